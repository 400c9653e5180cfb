//! aur-scene: Versioned scene-state graph and motion models
//!
//! The scene is a chain of immutable, copy-on-write snapshots. A control
//! thread derives a mutable child from the published head, mutates it through
//! `alter_*` accessors that clone only the touched containers and leaves, and
//! publishes it with `fix`. Renderers hold references to published snapshots
//! and read them lock-free for as long as they like.

mod container;
mod manager;
mod motion;
mod scene;
mod state;

pub use container::*;
pub use manager::*;
pub use motion::*;
pub use scene::*;
pub use state::*;
