//! aur-render: Renderers turning scene snapshots into audio blocks
//!
//! Every renderer consumes the same versioned scene, maintains one sound path
//! per source-receiver relation it models, and mixes its receivers into a
//! block-synchronous output stream. Scene updates travel from the control
//! thread to the audio thread as pooled update messages over a lock-free
//! queue; teardown is a three-state reset handshake.
//!
//! ## Renderer variants
//! - `freefield` - Binaural free-field (HRIR convolution, flagship)
//! - `ambisonics` - Ambisonics free-field (spherical-harmonic panning)
//! - `reverb` - Binaural artificial reverb (worker-thread BRIR synthesis)
//! - `airtraffic` - Binaural air-traffic noise (direct + ground reflection)
//! - `proto_freefield` - Free-field with configurable channels and recording
//! - `generic` - Raw impulse responses pushed per path over parameters
//! - `imagesource` - Shoebox mirror-image model feeding per-path IRs
//! - `hearing_aid` - Four-channel (front/rear BTE) binaural convolution

mod base;
mod dump;
mod engine;
mod entity;
mod message;
mod path;
mod renderer;
mod reset;

mod airtraffic;
mod ambisonics;
mod freefield;
mod generic;
mod hearing_aid;
mod imagesource;
mod proto_freefield;
mod reverb;

pub use airtraffic::*;
pub use ambisonics::*;
pub use base::*;
pub use dump::*;
pub use engine::*;
pub use entity::*;
pub use freefield::*;
pub use generic::*;
pub use hearing_aid::*;
pub use imagesource::*;
pub use message::*;
pub use path::*;
pub use proto_freefield::*;
pub use renderer::*;
pub use reset::*;
pub use reverb::*;
