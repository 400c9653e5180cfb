//! aur-core: Shared types, traits, and utilities for Auralis
//!
//! This crate provides the foundational types used across all Auralis crates:
//! sample buffers, block streams, the dynamically typed parameter struct, the
//! audio-safe object pool, 3D math, and the directivity data contract.

mod aura;
mod config;
mod directivity;
mod error;
mod math;
mod metrics;
mod pool;
mod sample;
mod stream;
mod value;

pub use aura::*;
pub use config::*;
pub use directivity::*;
pub use error::*;
pub use math::*;
pub use metrics::*;
pub use pool::*;
pub use sample::*;
pub use stream::*;
pub use value::*;

/// Audio sample type used throughout the engine
pub type Sample = f32;

/// Speed of sound in air at ~20 °C, meters per second
pub const DEFAULT_SOUND_SPEED: f64 = 343.0;

/// Fallback distance used when spreading loss is disabled, meters
pub const DEFAULT_DISTANCE: f64 = 2.0;

/// Minimum source-receiver distance for the inverse distance law, meters
pub const DEFAULT_MINIMUM_DISTANCE: f64 = 0.25;

/// Default amplitude calibration: sound power of 1 pW maps to 94 dB SPL at 1 m
pub const DEFAULT_AMPLITUDE_CALIBRATION_DB: f64 = 94.0;

/// Default sound power in watts (1 pW)
pub const DEFAULT_SOUND_POWER_W: f64 = 1e-12;

/// Number of third-octave bands used by magnitude filters
pub const NUM_THIRD_OCTAVE_BANDS: usize = 31;

/// ISO third-octave band center frequencies in Hz (20 Hz .. 20 kHz)
pub const THIRD_OCTAVE_CENTER_FREQUENCIES: [f64; NUM_THIRD_OCTAVE_BANDS] = [
    20.0, 25.0, 31.5, 40.0, 50.0, 63.0, 80.0, 100.0, 125.0, 160.0, 200.0, 250.0, 315.0, 400.0,
    500.0, 630.0, 800.0, 1000.0, 1250.0, 1600.0, 2000.0, 2500.0, 3150.0, 4000.0, 5000.0, 6300.0,
    8000.0, 10000.0, 12500.0, 16000.0, 20000.0,
];
