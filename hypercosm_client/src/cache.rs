//! Persistent, deduplicating asset cache.
//!
//! Two-tier store: a strong id→path index backed by files named by the
//! asset id's 32-hex-char text form, and a weakly-held id→bytes residency
//! table. Once bytes exist on disk they are never fetched over the network
//! again; once every external holder drops them they are re-read from disk.
//!
//! Concurrent misses for the same id are coalesced: a per-id in-flight lock
//! makes the fetch single-flight, and an optimistic file-existence check
//! covers files written by an earlier process or a racing writer.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use hypercosm_shared::error::Error;
use hypercosm_shared::uuid::Uuid;

pub struct AssetCache {
    dir: PathBuf,
    /// id → backing file; entries are only added after the file exists.
    entries: DashMap<Uuid, PathBuf>,
    /// id → weakly-retained resident bytes.
    data: DashMap<Uuid, Weak<Vec<u8>>>,
    /// Per-id miss gate for single-flight fetches.
    inflight: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl AssetCache {
    /// Opens the cache directory and indexes its contents.
    ///
    /// The directory is assumed exclusively owned by this cache: every file
    /// name must parse back to an asset id, anything else is an error.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(Error::CacheIo)?;
        let dir = std::fs::canonicalize(&dir).map_err(Error::CacheIo)?;

        let entries = DashMap::new();
        for entry in std::fs::read_dir(&dir).map_err(Error::CacheIo)? {
            let entry = entry.map_err(Error::CacheIo)?;
            let name = entry.file_name();
            let name = name.to_str().ok_or_else(|| bad_cache_file(&name.to_string_lossy()))?;
            let id: Uuid = name.parse().map_err(|_| bad_cache_file(name))?;
            entries.insert(id, dir.join(name));
        }
        debug!(dir = %dir.display(), indexed = entries.len(), "asset cache opened");

        Ok(Self {
            dir,
            entries,
            data: DashMap::new(),
            inflight: DashMap::new(),
        })
    }

    /// The canonical on-disk location for an asset id.
    pub fn canonical_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Returns the bytes for `id` from memory or disk, without fetching.
    pub async fn lookup(&self, id: Uuid) -> Result<Option<Arc<Vec<u8>>>, Error> {
        if let Some(data) = self.lookup_resident(id) {
            return Ok(Some(data));
        }
        self.read_indexed(id).await
    }

    /// Returns the bytes for `id`, invoking `fetch` at most once across all
    /// concurrent callers if neither memory, index, nor disk has them.
    ///
    /// A fetch yielding no data returns `None` and writes nothing. The file
    /// is written before the index entry is registered, so the index never
    /// points at a file that does not exist.
    pub async fn get_or_fetch<F, Fut>(&self, id: Uuid, fetch: F) -> Result<Option<Arc<Vec<u8>>>, Error>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = Result<Option<Vec<u8>>, Error>>,
    {
        if let Some(data) = self.lookup(id).await? {
            return Ok(Some(data));
        }

        let gate = self
            .inflight
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = gate.lock().await;
        let result = self.resolve_miss(id, fetch).await;
        drop(guard);
        // The gate is transient; it must not outlive the miss it coalesced,
        // whatever the outcome.
        self.inflight.remove(&id);
        result
    }

    async fn resolve_miss<F, Fut>(&self, id: Uuid, fetch: F) -> Result<Option<Arc<Vec<u8>>>, Error>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = Result<Option<Vec<u8>>, Error>>,
    {
        // A concurrent caller may have completed while we waited.
        if let Some(data) = self.lookup(id).await? {
            return Ok(Some(data));
        }

        let path = self.canonical_path(id);
        let file_exists = tokio::fs::try_exists(&path).await.map_err(Error::CacheIo)?;
        let bytes = if file_exists {
            tokio::fs::read(&path).await.map_err(Error::CacheIo)?
        } else {
            match fetch(id).await? {
                Some(bytes) => bytes,
                None => return Ok(None),
            }
        };
        if !file_exists {
            tokio::fs::write(&path, &bytes).await.map_err(Error::CacheIo)?;
            debug!(asset = %id, bytes = bytes.len(), "asset persisted");
        }
        self.entries.insert(id, path);

        let data = Arc::new(bytes);
        self.data.insert(id, Arc::downgrade(&data));
        Ok(Some(data))
    }

    fn lookup_resident(&self, id: Uuid) -> Option<Arc<Vec<u8>>> {
        self.data.get(&id).and_then(|weak| weak.upgrade())
    }

    async fn read_indexed(&self, id: Uuid) -> Result<Option<Arc<Vec<u8>>>, Error> {
        let path = match self.entries.get(&id) {
            Some(path) => path.clone(),
            None => return Ok(None),
        };
        let bytes = tokio::fs::read(&path).await.map_err(Error::CacheIo)?;
        let data = Arc::new(bytes);
        self.data.insert(id, Arc::downgrade(&data));
        Ok(Some(data))
    }
}

fn bad_cache_file(name: &str) -> Error {
    Error::CacheIo(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected file in cache directory: {name}"),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fetch_none(
        _id: Uuid,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, Error>> + Send>> {
        Box::pin(async { Ok(None) })
    }

    #[tokio::test]
    async fn lookup_without_fetch_returns_none_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let id = Uuid::generate();

        assert!(cache.lookup(id).await.unwrap().is_none());
        assert!(!cache.canonical_path(id).exists());
    }

    #[tokio::test]
    async fn fetch_yielding_no_data_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let id = Uuid::generate();

        assert!(cache.get_or_fetch(id, fetch_none).await.unwrap().is_none());
        assert!(!cache.canonical_path(id).exists());
        // Nothing registered: a later lookup still misses.
        assert!(cache.lookup(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn miss_path_persists_and_reindex_finds_it() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::generate();
        let payload = b"glb bytes".to_vec();

        {
            let cache = AssetCache::open(dir.path()).unwrap();
            let expected = payload.clone();
            let data = cache
                .get_or_fetch(id, move |_| async move { Ok(Some(expected)) })
                .await
                .unwrap()
                .unwrap();
            assert_eq!(*data, payload);
            assert!(cache.canonical_path(id).exists());
        }

        // Simulated process restart: reopen and resolve without fetching.
        let cache = AssetCache::open(dir.path()).unwrap();
        let data = cache
            .get_or_fetch(id, |_| async {
                panic!("must not fetch once the bytes exist on disk")
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*data, payload);
    }

    #[tokio::test]
    async fn dropped_residents_are_reread_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let id = Uuid::generate();

        let data = cache
            .get_or_fetch(id, |_| async { Ok(Some(vec![7u8; 32])) })
            .await
            .unwrap()
            .unwrap();
        drop(data); // last external holder

        // No fetch allowed: bytes must come back from disk.
        let data = cache.lookup(id).await.unwrap().unwrap();
        assert_eq!(*data, vec![7u8; 32]);
    }

    #[tokio::test]
    async fn preexisting_file_short_circuits_the_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let id = Uuid::generate();

        // A racing writer (or older process) left the file in place, but the
        // index does not know it yet.
        std::fs::write(cache.canonical_path(id), b"already here").unwrap();

        let data = cache
            .get_or_fetch(id, |_| async { panic!("file exists; no fetch") })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&**data, b"already here");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_fetch_once_and_agree() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(AssetCache::open(dir.path()).unwrap());
        let id = Uuid::generate();
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(id, move |_| async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(Some(b"shared payload".to_vec()))
                    })
                    .await
                    .unwrap()
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1, "fetch must be single-flight");
        for data in &results {
            assert_eq!(&***data, b"shared payload");
        }
        assert!(cache.canonical_path(id).exists());
    }

    #[tokio::test]
    async fn miss_gate_is_released_on_every_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let id = Uuid::generate();

        // Failed fetch: the error propagates and the gate is gone.
        let err = cache
            .get_or_fetch(id, |_| async { Err(Error::Import("boom".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Import(_)));
        assert!(cache.inflight.is_empty());

        // Absent asset: same.
        assert!(cache.get_or_fetch(id, fetch_none).await.unwrap().is_none());
        assert!(cache.inflight.is_empty());

        // Successful fetch: same, and the bytes came through.
        let data = cache
            .get_or_fetch(id, |_| async { Ok(Some(vec![9u8; 4])) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*data, vec![9u8; 4]);
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn unparsable_cache_file_is_a_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("not-an-id"), b"junk").unwrap();
        match AssetCache::open(dir.path()) {
            Err(Error::CacheIo(_)) => {}
            Err(other) => panic!("expected cache error, got {other:?}"),
            Ok(_) => panic!("expected cache error, got an open cache"),
        }

        // 32 characters, but a sign prefix is not a canonical id.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("+0000000000000001000000000000002"),
            b"junk",
        )
        .unwrap();
        match AssetCache::open(dir.path()) {
            Err(Error::CacheIo(_)) => {}
            Err(other) => panic!("expected cache error, got {other:?}"),
            Ok(_) => panic!("expected cache error, got an open cache"),
        }
    }

    #[tokio::test]
    async fn filename_roundtrips_to_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let id = Uuid::generate();
        cache
            .get_or_fetch(id, |_| async { Ok(Some(vec![1u8])) })
            .await
            .unwrap();

        let path = cache.canonical_path(id);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.parse::<Uuid>().unwrap(), id);
    }
}
