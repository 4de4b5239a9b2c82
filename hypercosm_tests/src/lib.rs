//! In-process test world server.
//!
//! Binds an ephemeral TLS listener with a self-signed certificate and speaks
//! the same symmetric protocol layer as the client: a root object resolvable
//! by name, an asset-delivery object serving an in-memory byte map, and a
//! world object that records the subscriber's callback id so the test driver
//! can push entity batches.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use hypercosm_client::engine::{
    ImportCallback, ImportOptions, ImportedAsset, PresentationEngine, SceneNodeId,
};
use hypercosm_client::objects::HostedObject;
use hypercosm_client::Connection;
use hypercosm_shared::error::Error;
use hypercosm_shared::math::Mat4;
use hypercosm_shared::proto::{
    encode_payload, selector, AddEntitiesArgs, AssetPayload, Entity, FetchByIdArgs,
    ObjectByNameArgs, ObjectRef, SubscribeArgs, WireError, EXT_ASSET_DELIVERY, EXT_WORLD,
    IFACE_OBJECT, IFACE_ROOT,
};
use hypercosm_shared::uuid::Uuid;

/// TLS listener plus the asset bytes it serves.
pub struct TestWorldServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    assets: Arc<HashMap<Uuid, Vec<u8>>>,
    pub addr: SocketAddr,
    /// Number of `fetch_by_id` calls served, across all peers.
    pub fetch_count: Arc<AtomicUsize>,
}

impl TestWorldServer {
    pub async fn bind_ephemeral(assets: HashMap<Uuid, Vec<u8>>) -> anyhow::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .context("generate self-signed certificate")?;
        let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.cert.der().clone()], key.into())
            .context("build TLS config")?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.context("bind")?;
        let addr = listener.local_addr()?;
        info!(%addr, "test world server listening");

        Ok(Self {
            listener,
            acceptor,
            assets: Arc::new(assets),
            addr,
            fetch_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Accepts one client: TLS, session nonces, then the protocol handshake.
    pub async fn accept_one(&self) -> anyhow::Result<ServerPeer> {
        let (tcp, peer_addr) = self.listener.accept().await.context("accept")?;
        let mut tls = self.acceptor.accept(tcp).await.context("tls accept")?;
        debug!(%peer_addr, "client connected");

        let mut nonce = [0u8; 16];
        tls.read_exact(&mut nonce).await.context("read client nonce")?;
        let client_session = Uuid::from_bytes(nonce);
        let server_session = Uuid::generate();
        tls.write_all(&server_session.to_bytes())
            .await
            .context("write server nonce")?;

        let world_id = Uuid::generate();
        let delivery_id = Uuid::generate();
        let names = HashMap::from([
            (EXT_WORLD.to_string(), world_id),
            (EXT_ASSET_DELIVERY.to_string(), delivery_id),
        ]);

        let conn = Connection::new(tls, Arc::new(ServerRoot { names }));
        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        conn.register_object(
            world_id,
            Arc::new(ServerWorld {
                subscribed: Mutex::new(Some(subscribed_tx)),
            }),
        );
        conn.register_object(
            delivery_id,
            Arc::new(ServerAssetDelivery {
                assets: self.assets.clone(),
                fetches: self.fetch_count.clone(),
            }),
        );
        conn.handshake().await?;

        Ok(ServerPeer {
            conn,
            client_session,
            server_session,
            subscribed: Some(subscribed_rx),
        })
    }
}

/// One accepted client connection, seen from the server side.
pub struct ServerPeer {
    pub conn: Connection,
    pub client_session: Uuid,
    pub server_session: Uuid,
    subscribed: Option<oneshot::Receiver<Uuid>>,
}

impl ServerPeer {
    /// Resolves once the client has subscribed to the entity feed.
    pub async fn wait_for_subscriber(&mut self) -> anyhow::Result<Uuid> {
        let rx = self
            .subscribed
            .take()
            .context("subscription already awaited")?;
        Ok(rx.await.context("client never subscribed")?)
    }

    /// Pushes one entity batch; resolves after the client handler finished.
    pub async fn push_entities(&self, callback: Uuid, entities: Vec<Entity>) -> Result<(), Error> {
        let args = serde_json::to_value(AddEntitiesArgs { entities })
            .map_err(|e| Error::Protocol(format!("serialize entities: {e}")))?;
        self.conn
            .call(callback, selector::ADD_ENTITIES, args)
            .await?;
        Ok(())
    }
}

struct ServerRoot {
    names: HashMap<String, Uuid>,
}

#[async_trait]
impl HostedObject for ServerRoot {
    async fn dispatch(&self, sel: &str, args: Value) -> Result<Value, WireError> {
        match sel {
            selector::LIST_INTERFACES => Ok(json!([IFACE_OBJECT, IFACE_ROOT])),
            selector::LIST_EXTENSIONS => Ok(json!([EXT_ASSET_DELIVERY, EXT_WORLD])),
            selector::PING | selector::RELEASE => Ok(Value::Null),
            selector::GET_OBJECT_BY_NAME => {
                let args: ObjectByNameArgs =
                    serde_json::from_value(args).map_err(|e| WireError::bad_args(e.to_string()))?;
                match self.names.get(&args.name) {
                    Some(&object_id) => serde_json::to_value(ObjectRef { object_id })
                        .map_err(|e| WireError::internal(e.to_string())),
                    None => Err(WireError::not_found(args.name)),
                }
            }
            selector::GET_OBJECT_BY_ID => {
                Err(WireError::not_implemented("lookup by id is not served"))
            }
            other => Err(WireError::unknown_selector(other)),
        }
    }
}

struct ServerAssetDelivery {
    assets: Arc<HashMap<Uuid, Vec<u8>>>,
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl HostedObject for ServerAssetDelivery {
    async fn dispatch(&self, sel: &str, args: Value) -> Result<Value, WireError> {
        match sel {
            selector::FETCH_BY_ID => {
                let args: FetchByIdArgs =
                    serde_json::from_value(args).map_err(|e| WireError::bad_args(e.to_string()))?;
                self.fetches.fetch_add(1, Ordering::SeqCst);
                match self.assets.get(&args.id) {
                    Some(bytes) => serde_json::to_value(AssetPayload {
                        data: encode_payload(bytes),
                    })
                    .map_err(|e| WireError::internal(e.to_string())),
                    None => Err(WireError::not_found(args.id.to_string())),
                }
            }
            selector::PING | selector::RELEASE => Ok(Value::Null),
            other => Err(WireError::unknown_selector(other)),
        }
    }
}

struct ServerWorld {
    subscribed: Mutex<Option<oneshot::Sender<Uuid>>>,
}

#[async_trait]
impl HostedObject for ServerWorld {
    async fn dispatch(&self, sel: &str, args: Value) -> Result<Value, WireError> {
        match sel {
            selector::SUBSCRIBE_ADD_ENTITIES => {
                let args: SubscribeArgs =
                    serde_json::from_value(args).map_err(|e| WireError::bad_args(e.to_string()))?;
                match self.subscribed.lock().await.take() {
                    Some(tx) => {
                        let _ = tx.send(args.callback);
                        Ok(Value::Null)
                    }
                    None => Err(WireError::internal("feed already has a subscriber")),
                }
            }
            selector::PING | selector::RELEASE => Ok(Value::Null),
            other => Err(WireError::unknown_selector(other)),
        }
    }
}

/// Presentation-engine stub that counts imports and attachments.
#[derive(Default)]
pub struct RecordingEngine {
    imports: AtomicUsize,
    attachments: std::sync::Mutex<Vec<Mat4>>,
}

impl RecordingEngine {
    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    pub fn attachments(&self) -> Vec<Mat4> {
        self.attachments.lock().expect("attachments poisoned").clone()
    }
}

impl PresentationEngine for RecordingEngine {
    fn import_asset(&self, _bytes: Arc<Vec<u8>>, options: ImportOptions, done: ImportCallback) {
        assert!(options.use_legacy_clips, "world assets use legacy clips");
        let node = SceneNodeId(self.imports.fetch_add(1, Ordering::SeqCst) as u64);
        done(Ok(ImportedAsset {
            node,
            animations: Vec::new(),
        }));
    }

    fn attach(&self, _asset: ImportedAsset, transform: Mat4) {
        self.attachments
            .lock()
            .expect("attachments poisoned")
            .push(transform);
    }
}
