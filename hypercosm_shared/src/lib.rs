//! `hypercosm_shared`
//!
//! Shared libraries used by the world client and by test peers.
//!
//! Design goals:
//! - Keep the wire protocol explicit and versionable.
//! - Clear separation of concerns (identifiers, frames, math, config, errors).
//! - No `unsafe`.

pub mod config;
pub mod error;
pub mod math;
pub mod proto;
pub mod uuid;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::math::*;
    pub use crate::proto::*;
    pub use crate::uuid::*;
}
