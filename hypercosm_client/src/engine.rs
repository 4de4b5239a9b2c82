//! Presentation-engine collaborator interface.
//!
//! The core hands the engine opaque asset bytes and placement data and never
//! looks inside the returned handles. Rendering, physics, and scene-graph
//! internals live entirely behind this trait.

use std::sync::Arc;

use hypercosm_shared::error::Error;
use hypercosm_shared::math::Mat4;

/// Handle to a node the engine inserted into its scene graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SceneNodeId(pub u64);

/// Handle to an animation clip produced by an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnimationClipId(pub u64);

#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    /// Import animations as legacy clips.
    pub use_legacy_clips: bool,
}

/// Result of a completed import: a scene node plus any animation clips.
#[derive(Debug, Clone)]
pub struct ImportedAsset {
    pub node: SceneNodeId,
    pub animations: Vec<AnimationClipId>,
}

pub type ImportCallback = Box<dyn FnOnce(Result<ImportedAsset, Error>) + Send>;

/// The narrow surface the core needs from the presentation engine.
///
/// Both methods are only ever invoked from main-dispatcher actions, so the
/// engine may assume its own thread. `import_asset` must return promptly and
/// deliver its outcome through `done`.
pub trait PresentationEngine: Send + Sync {
    fn import_asset(&self, bytes: Arc<Vec<u8>>, options: ImportOptions, done: ImportCallback);

    /// Parents an imported node under the world with the entity's placement.
    fn attach(&self, asset: ImportedAsset, transform: Mat4);
}
