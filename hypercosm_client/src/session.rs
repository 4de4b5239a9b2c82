//! World-session wiring.
//!
//! Connects, handshakes, discovers the asset-delivery and world objects by
//! name, and subscribes to the entity feed. Each announced entity is
//! resolved through the asset cache (fetching over asset delivery on a true
//! miss) and its import/placement job is handed to the main dispatcher.
//! A failing entity is logged and skipped; its siblings and later batches
//! are unaffected.

use std::sync::Arc;

use tracing::{info, warn};

use hypercosm_shared::config::ClientConfig;
use hypercosm_shared::error::Error;
use hypercosm_shared::math::Mat4;
use hypercosm_shared::proto::{Entity, EXT_ASSET_DELIVERY, EXT_WORLD, IFACE_ROOT};
use hypercosm_shared::uuid::Uuid;

use crate::cache::AssetCache;
use crate::connection::Connection;
use crate::dispatch::MainDispatcher;
use crate::engine::{ImportOptions, PresentationEngine};
use crate::objects::ClientRoot;
use crate::proxy::{RemoteAssetDelivery, RemoteRoot, RemoteWorld};
use crate::transport;

/// Connects to the configured server and drives the entity feed into the
/// presentation engine. Returns the live connection; the session ends when
/// the connection reaches its terminal state.
pub async fn run_world_session(
    cfg: &ClientConfig,
    cache: Arc<AssetCache>,
    engine: Arc<dyn PresentationEngine>,
    dispatcher: MainDispatcher,
) -> Result<Connection, Error> {
    let mut stream = transport::connect(&cfg.server_host, cfg.server_port).await?;
    let (session, server_session) = transport::exchange_session_ids(&mut stream).await?;
    info!(session = %session, server_session = %server_session, "session established");

    let conn = Connection::new(stream, Arc::new(ClientRoot));
    conn.handshake().await?;

    let root = conn.remote_root()?;
    validate_peer(&conn, &root).await?;

    let delivery_id = root.get_object_by_name(EXT_ASSET_DELIVERY).await?;
    let asset_delivery = conn.get_object(delivery_id, RemoteAssetDelivery::new)?;
    let world_id = root.get_object_by_name(EXT_WORLD).await?;
    let world = conn.get_object(world_id, RemoteWorld::new)?;

    world
        .subscribe_add_entities(move |entities| {
            let cache = cache.clone();
            let asset_delivery = asset_delivery.clone();
            let engine = engine.clone();
            let dispatcher = dispatcher.clone();
            async move {
                for entity in entities {
                    handle_entity(&cache, &asset_delivery, &engine, &dispatcher, entity).await;
                }
                Ok(())
            }
        })
        .await?;

    info!("subscribed to world entity feed");
    Ok(conn)
}

async fn validate_peer(conn: &Connection, root: &RemoteRoot) -> Result<(), Error> {
    let interfaces = root.list_interfaces().await?;
    if !interfaces.iter().any(|i| i == IFACE_ROOT) {
        return Err(Error::protocol("peer does not expose a root interface"));
    }
    for ext in [EXT_ASSET_DELIVERY, EXT_WORLD] {
        if !conn.supports_extension(ext) {
            return Err(Error::not_found(format!("peer lacks extension {ext}")));
        }
    }
    Ok(())
}

/// Resolves one entity's asset and schedules its import. Failures are
/// reported and isolated to this entity.
async fn handle_entity(
    cache: &AssetCache,
    asset_delivery: &Arc<RemoteAssetDelivery>,
    engine: &Arc<dyn PresentationEngine>,
    dispatcher: &MainDispatcher,
    entity: Entity,
) {
    let delivery = asset_delivery.clone();
    let fetched = cache
        .get_or_fetch(entity.asset_id, move |id: Uuid| async move {
            match delivery.fetch_by_id(id).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(Error::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await;

    let bytes = match fetched {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            warn!(asset = %entity.asset_id, "asset unavailable; skipping entity");
            return;
        }
        Err(e) => {
            warn!(asset = %entity.asset_id, error = %e, "asset fetch failed; skipping entity");
            return;
        }
    };

    schedule_import(engine.clone(), dispatcher, bytes, entity.transform);
}

/// Enqueues the engine-touching part: kick off the import on the next tick
/// and attach the node (or report the failure) on completion.
fn schedule_import(
    engine: Arc<dyn PresentationEngine>,
    dispatcher: &MainDispatcher,
    bytes: Arc<Vec<u8>>,
    transform: Mat4,
) {
    let attach_engine = engine.clone();
    let queued = dispatcher.enqueue(move || {
        engine.import_asset(
            bytes,
            ImportOptions {
                use_legacy_clips: true,
            },
            Box::new(move |result| match result {
                Ok(asset) => attach_engine.attach(asset, transform),
                Err(e) => warn!(error = %e, "asset import failed"),
            }),
        );
    });
    if !queued {
        warn!("main dispatcher is gone; dropping import job");
    }
}
