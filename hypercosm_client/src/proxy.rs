//! Typed client-side stand-ins for server-hosted objects.
//!
//! Proxies are constructed through [`Connection::get_object`] so repeated
//! lookups of the same object id share one instance. Each method translates
//! a typed call into the generic correlated-request mechanism; no caching
//! happens here.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use hypercosm_shared::error::Error;
use hypercosm_shared::proto::{
    decode_payload, selector, AddEntitiesArgs, AssetPayload, Entity, FetchByIdArgs,
    ObjectByNameArgs, ObjectRef, SubscribeArgs, WireError,
};
use hypercosm_shared::uuid::Uuid;

use crate::connection::Connection;
use crate::objects::HostedObject;

fn bad_reply(e: serde_json::Error) -> Error {
    Error::Protocol(format!("bad response payload: {e}"))
}

fn bad_args(e: serde_json::Error) -> Error {
    Error::Protocol(format!("serialize arguments: {e}"))
}

/// The object the peer hosts at the nil id.
pub struct RemoteRoot {
    conn: Connection,
    object: Uuid,
}

impl RemoteRoot {
    pub fn new(conn: Connection, object: Uuid) -> Self {
        Self { conn, object }
    }

    pub async fn list_interfaces(&self) -> Result<Vec<String>, Error> {
        let value = self
            .conn
            .call(self.object, selector::LIST_INTERFACES, Value::Null)
            .await?;
        serde_json::from_value(value).map_err(bad_reply)
    }

    pub async fn list_extensions(&self) -> Result<Vec<String>, Error> {
        let value = self
            .conn
            .call(self.object, selector::LIST_EXTENSIONS, Value::Null)
            .await?;
        serde_json::from_value(value).map_err(bad_reply)
    }

    pub async fn ping(&self) -> Result<(), Error> {
        self.conn
            .call(self.object, selector::PING, Value::Null)
            .await?;
        Ok(())
    }

    /// Resolves a server-hosted object id by capability name.
    pub async fn get_object_by_name(&self, name: &str) -> Result<Uuid, Error> {
        let args = serde_json::to_value(ObjectByNameArgs {
            name: name.to_string(),
        })
        .map_err(bad_args)?;
        let value = self
            .conn
            .call(self.object, selector::GET_OBJECT_BY_NAME, args)
            .await?;
        let reference: ObjectRef = serde_json::from_value(value).map_err(bad_reply)?;
        Ok(reference.object_id)
    }
}

/// Fetches raw asset payloads by id. Caching is the asset cache's job.
pub struct RemoteAssetDelivery {
    conn: Connection,
    object: Uuid,
}

impl RemoteAssetDelivery {
    pub fn new(conn: Connection, object: Uuid) -> Self {
        Self { conn, object }
    }

    pub async fn fetch_by_id(&self, id: Uuid) -> Result<Vec<u8>, Error> {
        let args = serde_json::to_value(FetchByIdArgs { id }).map_err(bad_args)?;
        let value = self
            .conn
            .call(self.object, selector::FETCH_BY_ID, args)
            .await?;
        let payload: AssetPayload = serde_json::from_value(value).map_err(bad_reply)?;
        decode_payload(&payload.data)
    }
}

pub(crate) type EntityHandler = Arc<
    dyn Fn(Vec<Entity>) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> + Send + Sync,
>;

/// Client-hosted callback object the server pushes entity batches into.
///
/// The per-object dispatch worker guarantees batches are handled in
/// server-send order and never overlap. A failing handler is reported in the
/// response but leaves the subscription intact.
pub(crate) struct EntitySink {
    handler: EntityHandler,
}

#[async_trait]
impl HostedObject for EntitySink {
    async fn dispatch(&self, sel: &str, args: Value) -> Result<Value, WireError> {
        match sel {
            selector::ADD_ENTITIES => {
                let args: AddEntitiesArgs = serde_json::from_value(args)
                    .map_err(|e| WireError::bad_args(e.to_string()))?;
                let count = args.entities.len();
                debug!(count, "entity batch received");
                match (self.handler)(args.entities).await {
                    Ok(()) => Ok(Value::Null),
                    Err(e) => {
                        warn!(count, error = %e, "entity batch handler failed");
                        Err(WireError::internal(e.to_string()))
                    }
                }
            }
            selector::PING | selector::RELEASE => Ok(Value::Null),
            other => Err(WireError::unknown_selector(other)),
        }
    }
}

/// The live world feed.
pub struct RemoteWorld {
    conn: Connection,
    object: Uuid,
}

impl RemoteWorld {
    pub fn new(conn: Connection, object: Uuid) -> Self {
        Self { conn, object }
    }

    /// Registers `handler` for the ordered entity-added feed.
    ///
    /// A locally-hosted callback object is created for the subscription and
    /// its id handed to the server; batches then arrive as calls against it.
    pub async fn subscribe_add_entities<H, Fut>(&self, handler: H) -> Result<(), Error>
    where
        H: Fn(Vec<Entity>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let handler: EntityHandler = Arc::new(move |entities| Box::pin(handler(entities)));
        let callback = Uuid::generate();
        self.conn
            .register_object(callback, Arc::new(EntitySink { handler }));

        let args = serde_json::to_value(SubscribeArgs { callback }).map_err(bad_args)?;
        self.conn
            .call(self.object, selector::SUBSCRIBE_ADD_ENTITIES, args)
            .await?;
        debug!(callback = %callback, "entity subscription established");
        Ok(())
    }
}
