//! Wire protocol: capability names, selectors, frames, and the codec.
//!
//! After the TLS upgrade and the 16-byte session-nonce exchange, the stream
//! carries length-prefixed frames: a `u32` big-endian payload length followed
//! by that many bytes of JSON. Requests and responses are correlated by a
//! per-connection monotonically increasing request id, so any number of calls
//! can be in flight concurrently. Either side can be caller or callee.
//!
//! Asset payload bytes travel base64-encoded inside the JSON frame.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::math::Mat4;
use crate::uuid::Uuid;

/// Interface implemented by every protocol object.
pub const IFACE_OBJECT: &str = "hypercosm.object.v1.0.0";
/// Interface implemented by each peer's root object.
pub const IFACE_ROOT: &str = "hypercosm.root.v0.1.0";
/// Extension for fetching asset payloads by id.
pub const EXT_ASSET_DELIVERY: &str = "hypercosm.assetdelivery.v0.1.0";
/// Extension for the live world-entity feed.
pub const EXT_WORLD: &str = "hypercosm.world.v0.1.0";

/// Method selectors. Capability membership is negotiated by exact string
/// match on the names above; selectors themselves are flat strings.
pub mod selector {
    pub const LIST_INTERFACES: &str = "list_interfaces";
    pub const LIST_EXTENSIONS: &str = "list_extensions";
    pub const PING: &str = "ping";
    pub const RELEASE: &str = "release";
    pub const GET_OBJECT_BY_ID: &str = "get_object_by_id";
    pub const GET_OBJECT_BY_NAME: &str = "get_object_by_name";
    pub const FETCH_BY_ID: &str = "fetch_by_id";
    pub const SUBSCRIBE_ADD_ENTITIES: &str = "subscribe_add_entities";
    pub const ADD_ENTITIES: &str = "add_entities";
}

/// Upper bound on a frame payload; asset payloads dominate frame sizes.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// High-level frame envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    /// Capability exchange; sent exactly once by each side, first.
    Hello {
        interfaces: Vec<String>,
        extensions: Vec<String>,
    },
    Request {
        request: u64,
        object: Uuid,
        selector: String,
        args: Value,
    },
    Response {
        request: u64,
        result: Result<Value, WireError>,
    },
}

/// Error payload carried in a `Response`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WireErrorKind {
    NotFound,
    UnknownObject,
    UnknownSelector,
    NotImplemented,
    BadArgs,
    Internal,
}

impl WireError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn unknown_object(id: Uuid) -> Self {
        Self {
            kind: WireErrorKind::UnknownObject,
            message: id.to_string(),
        }
    }

    pub fn unknown_selector(selector: &str) -> Self {
        Self {
            kind: WireErrorKind::UnknownSelector,
            message: selector.to_string(),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::NotImplemented,
            message: message.into(),
        }
    }

    pub fn bad_args(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::BadArgs,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Internal,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        match e.kind {
            WireErrorKind::NotFound => Error::NotFound(e.message),
            WireErrorKind::NotImplemented => Error::NotImplemented(e.message),
            _ => Error::Protocol(e.to_string()),
        }
    }
}

/// A server-announced world item: an asset and where to place it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub asset_id: Uuid,
    pub transform: Mat4,
}

// ─── Typed selector payloads ───

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectByNameArgs {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectByIdArgs {
    pub id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ObjectRef {
    pub object_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FetchByIdArgs {
    pub id: Uuid,
}

/// Asset bytes, base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetPayload {
    pub data: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SubscribeArgs {
    /// Object hosted by the subscriber that will receive `add_entities`.
    pub callback: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddEntitiesArgs {
    pub entities: Vec<Entity>,
}

pub fn encode_payload(data: &[u8]) -> String {
    base64::encode(data)
}

pub fn decode_payload(s: &str) -> Result<Vec<u8>, Error> {
    base64::decode(s).map_err(|e| Error::Protocol(format!("bad asset payload encoding: {e}")))
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), Error> {
    let payload =
        serde_json::to_vec(frame).map_err(|e| Error::Protocol(format!("serialize frame: {e}")))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await.map_err(Error::Transport)?;
    Ok(())
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, Error> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.map_err(Error::Transport)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await.map_err(Error::Transport)?;
    serde_json::from_slice(&payload).map_err(|e| Error::Protocol(format!("malformed frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let hello = Frame::Hello {
            interfaces: vec![IFACE_OBJECT.to_string(), IFACE_ROOT.to_string()],
            extensions: vec![EXT_WORLD.to_string()],
        };
        let request = Frame::Request {
            request: 7,
            object: Uuid::NIL,
            selector: selector::PING.to_string(),
            args: Value::Null,
        };
        let response = Frame::Response {
            request: 7,
            result: Err(WireError::unknown_selector("bogus")),
        };

        for frame in [&hello, &request, &response] {
            write_frame(&mut a, frame).await.unwrap();
            assert_eq!(&read_frame(&mut b).await.unwrap(), frame);
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // A raw header claiming a payload beyond the limit.
        let bogus = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus).await.unwrap();
        match read_frame(&mut b).await {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_frame_is_a_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &8u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, b"abc").await.unwrap();
        drop(a);
        match read_frame(&mut b).await {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[test]
    fn payload_encoding_roundtrip() {
        let data = vec![0u8, 1, 2, 250, 255];
        let encoded = encode_payload(&data);
        assert_eq!(decode_payload(&encoded).unwrap(), data);
        assert!(decode_payload("not!!base64??").is_err());
    }

    #[test]
    fn entity_serialization_carries_id_and_transform() {
        let entity = Entity {
            asset_id: Uuid::from_halves(1, 2),
            transform: Mat4::IDENTITY,
        };
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(
            json["asset_id"],
            "00000000000000010000000000000002".to_string()
        );
        let back: Entity = serde_json::from_value(json).unwrap();
        assert_eq!(back, entity);
    }
}
