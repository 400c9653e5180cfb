//! aur-dsp: DSP primitives for the auralization pipeline
//!
//! All primitives share one design principle: state changes are staged and
//! crossfaded so that `process` never produces an audible discontinuity,
//! however violently parameters change between blocks. The audio thread calls
//! only the lock-free mutator APIs (set delay, set magnitudes, exchange
//! filter) and never allocates.
//!
//! ## Modules
//! - `vdl` - Variable fractional delay line with selectable switching
//! - `filterbank` - Third-octave magnitude filter bank (FIR / IIR biquads)
//! - `convolver` - Uniformly-partitioned FIR convolver with filter pool
//! - `sh` - Real spherical harmonics for ambisonics channel matrices
//! - `fade` - Crossfade envelopes shared by the primitives

pub mod convolver;
pub mod fade;
pub mod filterbank;
pub mod sh;
pub mod vdl;

pub use convolver::*;
pub use fade::*;
pub use filterbank::*;
pub use sh::*;
pub use vdl::*;
