//! Remote-object protocol layer.
//!
//! A [`Connection`] turns a byte stream into a bidirectional RPC channel:
//! objects are addressed by [`Uuid`], requests and responses are correlated
//! by a per-connection monotonically increasing id, and either side can be
//! caller or callee. Locally-hosted objects each get a dedicated worker task
//! so incoming calls for one object are dispatched in arrival order and
//! never overlap, while responses keep flowing.
//!
//! Any malformed frame, a response with an unknown correlation id, or a
//! transport failure moves the connection into a terminal failed state; all
//! pending and future calls then fail with [`Error::Closed`].

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use hypercosm_shared::error::Error;
use hypercosm_shared::proto::{read_frame, selector, write_frame, Frame, WireError};
use hypercosm_shared::uuid::Uuid;

use crate::objects::HostedObject;
use crate::proxy::RemoteRoot;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const STATE_NEW: u8 = 0;
const STATE_HANDSHAKING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Capability lists the peer advertised in its hello.
#[derive(Debug, Clone)]
pub struct PeerCapabilities {
    pub interfaces: Vec<String>,
    pub extensions: Vec<String>,
}

struct IncomingCall {
    request: u64,
    selector: String,
    args: Value,
}

struct Inner {
    writer: Mutex<BoxedWriter>,
    /// Taken by `handshake`, then owned by the read loop.
    reader: Mutex<Option<BoxedReader>>,
    root: Arc<dyn HostedObject>,
    pending: DashMap<u64, oneshot::Sender<Result<Value, WireError>>>,
    next_request: AtomicU64,
    hosted: DashMap<Uuid, mpsc::UnboundedSender<IncomingCall>>,
    proxies: DashMap<Uuid, Arc<dyn Any + Send + Sync>>,
    peer: OnceLock<PeerCapabilities>,
    state: AtomicU8,
}

/// A live protocol connection. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Binds a connection to an open stream and the locally-hosted root.
    /// Performs no I/O; call [`Connection::handshake`] before anything else.
    pub fn new<S>(stream: S, root: Arc<dyn HostedObject>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Connection {
            inner: Arc::new(Inner {
                writer: Mutex::new(Box::new(writer)),
                reader: Mutex::new(Some(Box::new(reader))),
                root: root.clone(),
                pending: DashMap::new(),
                next_request: AtomicU64::new(1),
                hosted: DashMap::new(),
                proxies: DashMap::new(),
                peer: OnceLock::new(),
                state: AtomicU8::new(STATE_NEW),
            }),
        };
        conn.register_object(Uuid::NIL, root);
        conn
    }

    /// Performs the capability exchange, then starts the read loop.
    ///
    /// Must complete exactly once; repeated or concurrent calls error.
    pub async fn handshake(&self) -> Result<(), Error> {
        self.inner
            .state
            .compare_exchange(
                STATE_NEW,
                STATE_HANDSHAKING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|state| match state {
                STATE_CLOSED => Error::Closed,
                _ => Error::protocol("handshake already performed"),
            })?;

        match self.handshake_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                fail(&self.inner);
                Err(e)
            }
        }
    }

    async fn handshake_inner(&self) -> Result<(), Error> {
        // Our hello comes straight from the hosted root's dispatch table.
        let interfaces = self.root_capability_list(selector::LIST_INTERFACES).await?;
        let extensions = self.root_capability_list(selector::LIST_EXTENSIONS).await?;
        {
            let mut w = self.inner.writer.lock().await;
            write_frame(
                &mut *w,
                &Frame::Hello {
                    interfaces,
                    extensions,
                },
            )
            .await?;
        }

        let mut reader = self
            .inner
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::protocol("handshake already performed"))?;

        match read_frame(&mut reader).await? {
            Frame::Hello {
                interfaces,
                extensions,
            } => {
                debug!(
                    interfaces = interfaces.len(),
                    extensions = extensions.len(),
                    "peer hello received"
                );
                let _ = self.inner.peer.set(PeerCapabilities {
                    interfaces,
                    extensions,
                });
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected hello, got {other:?}"
                )))
            }
        }

        self.inner.state.store(STATE_READY, Ordering::Release);
        let inner = self.inner.clone();
        tokio::spawn(read_loop(inner, reader));
        Ok(())
    }

    async fn root_capability_list(&self, sel: &str) -> Result<Vec<String>, Error> {
        let value = self
            .inner
            .root
            .dispatch(sel, Value::Null)
            .await
            .map_err(|e| Error::Protocol(format!("root {sel} failed: {e}")))?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("root {sel} returned a non-list: {e}")))
    }

    /// Issues a correlated request and awaits the matching response.
    pub async fn call(&self, object: Uuid, selector: &str, args: Value) -> Result<Value, Error> {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_READY => {}
            STATE_CLOSED => return Err(Error::Closed),
            _ => return Err(Error::protocol("call before handshake completed")),
        }

        let request = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request, tx);

        let frame = Frame::Request {
            request,
            object,
            selector: selector.to_string(),
            args,
        };
        {
            let mut w = self.inner.writer.lock().await;
            if let Err(e) = write_frame(&mut *w, &frame).await {
                drop(w);
                self.inner.pending.remove(&request);
                fail(&self.inner);
                return Err(e);
            }
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(wire)) => Err(wire.into()),
            Err(_) => Err(Error::Closed),
        }
    }

    /// Returns the cached proxy for `id`, constructing it via `factory` on
    /// first lookup. Never issues a network call by itself.
    pub fn get_object<T, F>(&self, id: Uuid, factory: F) -> Result<Arc<T>, Error>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Connection, Uuid) -> T,
    {
        let proxy = self
            .inner
            .proxies
            .entry(id)
            .or_insert_with(|| Arc::new(factory(self.clone(), id)) as Arc<dyn Any + Send + Sync>)
            .value()
            .clone();
        proxy.downcast::<T>().map_err(|_| {
            Error::Protocol(format!("object {id} is already bound to a different proxy type"))
        })
    }

    /// Proxy for the object the peer hosts at the nil id.
    pub fn remote_root(&self) -> Result<Arc<RemoteRoot>, Error> {
        self.get_object(Uuid::NIL, RemoteRoot::new)
    }

    /// Hosts `object` at `id` with a dedicated in-order dispatch worker.
    pub fn register_object(&self, id: Uuid, object: Arc<dyn HostedObject>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<IncomingCall>();
        self.inner.hosted.insert(id, tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                let result = object.dispatch(&call.selector, call.args).await;
                if let Err(ref e) = result {
                    warn!(object = %id, selector = %call.selector, error = %e, "hosted call failed");
                }
                respond(&inner, call.request, result).await;
            }
        });
    }

    /// Capability lists from the peer's hello, once the handshake is done.
    pub fn peer_capabilities(&self) -> Option<PeerCapabilities> {
        self.inner.peer.get().cloned()
    }

    /// Exact-match membership check against the peer's advertised extensions.
    pub fn supports_extension(&self, name: &str) -> bool {
        self.inner
            .peer
            .get()
            .map(|caps| caps.extensions.iter().any(|e| e == name))
            .unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Moves the connection to its terminal state and fails pending calls.
    pub fn close(&self) {
        fail(&self.inner);
    }
}

async fn respond(inner: &Arc<Inner>, request: u64, result: Result<Value, WireError>) {
    let frame = Frame::Response { request, result };
    let mut w = inner.writer.lock().await;
    if let Err(e) = write_frame(&mut *w, &frame).await {
        drop(w);
        warn!(error = %e, "failed to write response");
        fail(inner);
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: BoxedReader) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Frame::Request {
                request,
                object,
                selector,
                args,
            }) => {
                let routed = inner.hosted.get(&object).map(|tx| tx.value().clone());
                match routed {
                    Some(tx) => {
                        if tx
                            .send(IncomingCall {
                                request,
                                selector,
                                args,
                            })
                            .is_err()
                        {
                            respond(&inner, request, Err(WireError::internal("object worker stopped")))
                                .await;
                        }
                    }
                    None => {
                        debug!(object = %object, selector = %selector, "request for unknown object");
                        respond(&inner, request, Err(WireError::unknown_object(object))).await;
                    }
                }
            }
            Ok(Frame::Response { request, result }) => match inner.pending.remove(&request) {
                Some((_, tx)) => {
                    let _ = tx.send(result);
                }
                None => {
                    warn!(request, "response with unknown correlation id");
                    fail(&inner);
                    break;
                }
            },
            Ok(Frame::Hello { .. }) => {
                warn!("unexpected hello after handshake");
                fail(&inner);
                break;
            }
            Err(e) => {
                if !matches!(inner.state.load(Ordering::Acquire), STATE_CLOSED) {
                    debug!(error = %e, "connection stream ended");
                }
                fail(&inner);
                break;
            }
        }
    }
}

fn fail(inner: &Arc<Inner>) {
    if inner.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
        return;
    }
    // Dropping the pending senders wakes every in-flight call with `Closed`.
    inner.pending.clear();
    // Dropping the worker senders lets each worker drain and exit.
    inner.hosted.clear();
    // Proxies hold the connection; clearing breaks the reference cycle.
    inner.proxies.clear();
    // Shut the write half down so the peer observes end-of-stream.
    let inner = inner.clone();
    tokio::spawn(async move {
        let mut w = inner.writer.lock().await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut *w).await;
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::objects::ClientRoot;
    use hypercosm_shared::proto::selector;

    fn pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::new(a, Arc::new(ClientRoot)),
            Connection::new(b, Arc::new(ClientRoot)),
        )
    }

    async fn handshaken_pair() -> (Connection, Connection) {
        let (a, b) = pair();
        let (ra, rb) = tokio::join!(a.handshake(), b.handshake());
        ra.unwrap();
        rb.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn handshake_exchanges_capabilities() {
        let (a, _b) = handshaken_pair().await;
        let caps = a.peer_capabilities().unwrap();
        assert_eq!(caps.interfaces, ClientRoot::interfaces());
        assert!(a.supports_extension("hypercosm.world.v0.1.0"));
        assert!(!a.supports_extension("hypercosm.world.v9.9.9"));
    }

    #[tokio::test]
    async fn handshake_twice_is_an_error() {
        let (a, b) = handshaken_pair().await;
        assert!(matches!(a.handshake().await, Err(Error::Protocol(_))));
        drop(b);
    }

    #[tokio::test]
    async fn call_before_handshake_fails() {
        let (a, _b) = pair();
        let err = a
            .call(Uuid::NIL, selector::PING, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn ping_roundtrip_to_remote_root() {
        let (a, _b) = handshaken_pair().await;
        let value = a
            .call(Uuid::NIL, selector::PING, Value::Null)
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn unknown_selector_is_nonfatal() {
        let (a, _b) = handshaken_pair().await;
        let err = a
            .call(Uuid::NIL, "made_up", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        // The connection is still usable afterwards.
        a.call(Uuid::NIL, selector::PING, Value::Null)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_object_is_nonfatal() {
        let (a, _b) = handshaken_pair().await;
        let err = a
            .call(Uuid::generate(), selector::PING, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        a.call(Uuid::NIL, selector::PING, Value::Null)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_calls_correlate_responses() {
        let (a, _b) = handshaken_pair().await;
        let mut handles = Vec::new();
        for _ in 0..16 {
            let conn = a.clone();
            handles.push(tokio::spawn(async move {
                conn.call(Uuid::NIL, selector::LIST_INTERFACES, Value::Null)
                    .await
            }));
        }
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            let list: Vec<String> = serde_json::from_value(value).unwrap();
            assert_eq!(list, ClientRoot::interfaces());
        }
    }

    #[tokio::test]
    async fn get_object_caches_the_proxy_and_runs_factory_once() {
        let (a, _b) = handshaken_pair().await;
        struct Probe;
        let id = Uuid::generate();
        let made = AtomicUsize::new(0);

        let first = a
            .get_object(id, |_, _| {
                made.fetch_add(1, Ordering::SeqCst);
                Probe
            })
            .unwrap();
        let second = a
            .get_object(id, |_, _| {
                made.fetch_add(1, Ordering::SeqCst);
                Probe
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(made.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peer_disconnect_fails_pending_and_future_calls() {
        let (a, b) = handshaken_pair().await;
        b.close();
        // The read loop notices the closed stream and fails the connection.
        let mut saw_closed = false;
        for _ in 0..50 {
            match a.call(Uuid::NIL, selector::PING, Value::Null).await {
                Err(Error::Closed) => {
                    saw_closed = true;
                    break;
                }
                _ => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
        }
        assert!(saw_closed, "expected calls to fail with Closed");
        assert!(a.is_closed());
    }
}
