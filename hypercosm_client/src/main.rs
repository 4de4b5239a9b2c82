//! Standalone world-client binary.
//!
//! Usage:
//!   cargo run -p hypercosm_client -- [--host localhost] [--port 12345] [--cache-dir cache]
//!
//! Connects to the simulation server, subscribes to the entity feed, and
//! pumps the main dispatcher on a fixed tick. Without a real presentation
//! engine attached, imports and placements are logged.

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info};

use hypercosm_client::cache::AssetCache;
use hypercosm_client::dispatch::main_dispatcher;
use hypercosm_client::engine::{
    ImportCallback, ImportOptions, ImportedAsset, PresentationEngine, SceneNodeId,
};
use hypercosm_client::session::run_world_session;
use hypercosm_shared::config::ClientConfig;
use hypercosm_shared::math::Mat4;

/// Stand-in engine that acknowledges every import and logs placements.
struct LogEngine {
    next_node: AtomicU64,
}

impl PresentationEngine for LogEngine {
    fn import_asset(&self, bytes: Arc<Vec<u8>>, options: ImportOptions, done: ImportCallback) {
        let node = SceneNodeId(self.next_node.fetch_add(1, Ordering::Relaxed));
        debug!(
            bytes = bytes.len(),
            legacy_clips = options.use_legacy_clips,
            "import requested"
        );
        done(Ok(ImportedAsset {
            node,
            animations: Vec::new(),
        }));
    }

    fn attach(&self, asset: ImportedAsset, transform: Mat4) {
        let [x, y, z] = transform.translation();
        info!(node = asset.node.0, x, y, z, "entity placed in scene");
    }
}

fn parse_args() -> ClientConfig {
    let mut cfg = ClientConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" if i + 1 < args.len() => {
                cfg.server_host = args[i + 1].clone();
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                cfg.server_port = args[i + 1].parse().unwrap_or(cfg.server_port);
                i += 2;
            }
            "--cache-dir" if i + 1 < args.len() => {
                cfg.cache_dir = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(host = %cfg.server_host, port = cfg.server_port, cache_dir = %cfg.cache_dir, "Starting client");

    let cache = Arc::new(AssetCache::open(&cfg.cache_dir).context("open asset cache")?);
    let (dispatcher, mut pump) = main_dispatcher();
    let engine = Arc::new(LogEngine {
        next_node: AtomicU64::new(1),
    });

    let conn = run_world_session(&cfg, cache, engine, dispatcher)
        .await
        .context("establish world session")?;

    // The per-tick update loop a presentation engine would normally drive.
    let tick = Duration::from_secs_f32(1.0 / 60.0);
    while !conn.is_closed() {
        pump.drain();
        tokio::time::sleep(tick).await;
    }
    pump.drain();
    info!("connection closed; exiting");

    Ok(())
}
