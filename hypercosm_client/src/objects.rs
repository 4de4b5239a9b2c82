//! Hosted protocol objects.
//!
//! Every object a peer can call into implements [`HostedObject`]; the
//! selector match inside `dispatch` is the lookup table the connection layer
//! routes incoming requests through. Unknown selectors come back as a
//! protocol-level error response, never a disconnect.

use async_trait::async_trait;
use serde_json::{json, Value};

use hypercosm_shared::proto::{
    selector, WireError, EXT_ASSET_DELIVERY, EXT_WORLD, IFACE_OBJECT, IFACE_ROOT,
};

/// A locally-hosted protocol object the peer can address by id.
#[async_trait]
pub trait HostedObject: Send + Sync {
    async fn dispatch(&self, selector: &str, args: Value) -> Result<Value, WireError>;
}

/// The root object this client hosts so the server can introspect it.
///
/// The client hosts no discoverable children, so both object lookups fail
/// with a not-implemented error rather than silently succeeding.
pub struct ClientRoot;

impl ClientRoot {
    pub fn interfaces() -> Vec<String> {
        vec![IFACE_OBJECT.to_string(), IFACE_ROOT.to_string()]
    }

    pub fn extensions() -> Vec<String> {
        vec![EXT_ASSET_DELIVERY.to_string(), EXT_WORLD.to_string()]
    }
}

#[async_trait]
impl HostedObject for ClientRoot {
    async fn dispatch(&self, sel: &str, _args: Value) -> Result<Value, WireError> {
        match sel {
            selector::LIST_INTERFACES => Ok(json!(Self::interfaces())),
            selector::LIST_EXTENSIONS => Ok(json!(Self::extensions())),
            selector::PING => Ok(Value::Null),
            selector::RELEASE => Ok(Value::Null),
            selector::GET_OBJECT_BY_ID | selector::GET_OBJECT_BY_NAME => Err(
                WireError::not_implemented("client hosts no discoverable objects"),
            ),
            other => Err(WireError::unknown_selector(other)),
        }
    }
}
