//! Motion models: pose smoothing between sparse updates and audio blocks
//!
//! Pose updates arrive sparsely and wall-clock-timestamped from the control
//! side; the audio side needs a pose at every block's sample-accurate time.
//! The model keeps a ring of recent keys and evaluates a triangular weight
//! window behind the query time, linearly extrapolating each key by its
//! velocity before blending.

use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;

use aur_core::{AurError, AurResult, Pose, Quat, Vec3};

use crate::MotionState;

/// One pose update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionKey {
    pub time: f64,
    pub position: Vec3,
    pub orientation: Quat,
}

/// Stored key with the velocity derived at insertion
#[derive(Debug, Clone, Copy, Default)]
struct StoredKey {
    time: f64,
    position: Vec3,
    orientation: Quat,
    velocity: Vec3,
}

/// Motion model configuration
#[derive(Debug, Clone)]
pub struct MotionModelConfig {
    /// Ring capacity for pose keys
    pub num_history_keys: usize,
    /// Triangular window width in seconds
    pub window_size: f64,
    /// Window center lag behind the query time in seconds
    pub window_delay: f64,
    /// Log every input key to a file on reset/drop
    pub log_input: bool,
    /// Log every estimate to a file on reset/drop
    pub log_estimated: bool,
}

impl Default for MotionModelConfig {
    fn default() -> Self {
        Self {
            num_history_keys: 1000,
            window_size: 0.1,
            window_delay: 0.1,
            log_input: false,
            log_estimated: false,
        }
    }
}

impl MotionModelConfig {
    pub fn validate(&self) -> AurResult<()> {
        if self.num_history_keys < 1 {
            return Err(AurError::InvalidParameter(
                "motion model history needs at least one key".into(),
            ));
        }
        if self.window_delay < 0.0 {
            return Err(AurError::InvalidParameter(
                "motion model window delay cannot be negative".into(),
            ));
        }
        if self.window_size <= 0.0 {
            return Err(AurError::InvalidParameter(
                "motion model window size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Single-threaded pose smoother
pub struct MotionModel {
    config: MotionModelConfig,
    keys: Vec<StoredKey>,
    /// Index of the newest key
    tail: usize,
    num_keys: usize,
    last_query_time: f64,
    input_log: MotionLog,
    estimation_log: MotionLog,
}

impl MotionModel {
    pub fn new(config: MotionModelConfig) -> AurResult<Self> {
        config.validate()?;
        let capacity = config.num_history_keys;
        Ok(Self {
            config,
            keys: vec![StoredKey::default(); capacity],
            tail: 0,
            num_keys: 0,
            last_query_time: f64::NEG_INFINITY,
            input_log: MotionLog::new(),
            estimation_log: MotionLog::new(),
        })
    }

    pub fn num_history_keys(&self) -> usize {
        self.num_keys
    }

    /// Set the instance name; log files derive their paths from it
    pub fn set_name(&mut self, name: &str) {
        if self.config.log_input {
            self.input_log
                .set_output_file(PathBuf::from(format!("{name}_Input.log")));
        }
        if self.config.log_estimated {
            self.estimation_log
                .set_output_file(PathBuf::from(format!("{name}_Estimated.log")));
        }
    }

    /// Append a pose key; the velocity is derived from the preceding key
    pub fn input_motion_key(&mut self, key: MotionKey) {
        let velocity = if self.num_keys > 0 {
            let prev = &self.keys[self.tail];
            let dt = key.time - prev.time;
            if dt > 1e-9 {
                (key.position - prev.position) * (1.0 / dt)
            } else {
                prev.velocity
            }
        } else {
            Vec3::ZERO
        };

        if self.config.log_input {
            let (view, up) = key.orientation.to_view_up();
            self.input_log.log(MotionLogEntry {
                time: key.time,
                position: key.position,
                view,
                up,
                orientation: key.orientation,
                num_involved_keys: 0,
            });
        }

        let capacity = self.config.num_history_keys;
        self.tail = if self.num_keys == 0 {
            self.tail
        } else {
            (self.tail + 1) % capacity
        };
        self.keys[self.tail] = StoredKey {
            time: key.time,
            position: key.position,
            orientation: key.orientation,
            velocity,
        };
        if self.num_keys < capacity {
            self.num_keys += 1;
        }
    }

    /// Key `lookback` steps behind the newest
    fn history_key(&self, lookback: usize) -> &StoredKey {
        let capacity = self.config.num_history_keys;
        let index = (self.tail + capacity - lookback) % capacity;
        &self.keys[index]
    }

    /// Triangular weight for a key that is `dt` seconds behind the query
    fn weight(&self, dt: f64) -> f64 {
        let w = 1.0 - (dt - self.config.window_delay).abs() / self.config.window_size;
        w.max(0.0)
    }

    /// Interpolated/extrapolated pose at `query_time`; None without any key
    ///
    /// Query times are expected to be monotonically non-decreasing per
    /// instance; the model is a smoother, not a timestamp enforcer, so a
    /// violation only trips a debug assertion.
    pub fn estimate(&mut self, query_time: f64) -> Option<Pose> {
        if self.num_keys == 0 {
            return None;
        }

        debug_assert!(
            query_time >= self.last_query_time,
            "motion model query times must not run backward"
        );
        self.last_query_time = self.last_query_time.max(query_time);

        // First pass: count keys inside the window and accumulate weights
        let mut n = 0;
        let mut wsum = 0.0;
        while n < self.num_keys {
            let key = self.history_key(n);
            let dt = query_time - key.time;
            let w = self.weight(dt);

            // Keys behind the window cannot come back into focus
            let out_of_focus = self.config.window_size * 0.5 - self.config.window_delay > 0.0;
            if w <= 0.0 && out_of_focus {
                break;
            }
            wsum += w;
            n += 1;
        }

        // All keys outside the window: the newest key extrapolates alone
        if n == 0 || wsum == 0.0 {
            let key = self.history_key(0);
            let dt = query_time - key.time;
            let position = key.position + key.velocity * dt;
            let orientation = key.orientation.normalized();
            self.log_estimate(query_time, position, orientation, 0);
            return Some(Pose::new(position, orientation));
        }

        // Second pass: blend the extrapolated positions by weight, take the
        // orientation of the peak-weight key
        let mut position = Vec3::ZERO;
        let mut orientation = Quat::IDENTITY;
        let mut max_weight = -1.0;
        for lookback in 0..n {
            let key = self.history_key(lookback);
            let dt = query_time - key.time;
            let w = self.weight(dt);
            let extrapolated = key.position + key.velocity * dt;
            position = position + extrapolated * (w / wsum);

            if w > max_weight {
                orientation = key.orientation;
                max_weight = w;
            }
        }
        let orientation = orientation.normalized();

        self.log_estimate(query_time, position, orientation, n);
        Some(Pose::new(position, orientation))
    }

    fn log_estimate(&mut self, time: f64, position: Vec3, orientation: Quat, involved: usize) {
        if self.config.log_estimated {
            let (view, up) = orientation.to_view_up();
            self.estimation_log.log(MotionLogEntry {
                time,
                position,
                view,
                up,
                orientation,
                num_involved_keys: involved,
            });
        }
    }

    /// Flush logs and forget all keys
    pub fn reset(&mut self) {
        if let Err(e) = self.estimation_log.store() {
            log::error!("could not store motion estimation log: {e}");
        }
        if let Err(e) = self.input_log.store() {
            log::error!("could not store motion input log: {e}");
        }
        // Keys are overwritten in place, no need to clear them
        self.num_keys = 0;
        self.last_query_time = f64::NEG_INFINITY;
    }
}

impl Drop for MotionModel {
    fn drop(&mut self) {
        self.reset();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTROL/AUDIO SHARED MODEL
// ═══════════════════════════════════════════════════════════════════════════

struct MotionAudioSide {
    consumer: rtrb::Consumer<MotionKey>,
    model: MotionModel,
}

/// Motion model split across the control and audio threads
///
/// The control side pushes keys into an SPSC ring; the audio side drains it
/// once per block, then queries. Each mutex is owned by exactly one thread by
/// protocol, so locking never contends.
pub struct SharedMotionModel {
    producer: Mutex<rtrb::Producer<MotionKey>>,
    audio: Mutex<MotionAudioSide>,
}

impl SharedMotionModel {
    pub fn new(config: MotionModelConfig) -> AurResult<Self> {
        let capacity = config.num_history_keys.max(64);
        let model = MotionModel::new(config)?;
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        Ok(Self {
            producer: Mutex::new(producer),
            audio: Mutex::new(MotionAudioSide { consumer, model }),
        })
    }

    /// Push a pose key (control thread)
    pub fn input_motion_key(&self, key: MotionKey) {
        if self.producer.lock().push(key).is_err() {
            log::warn!("motion key ring full, dropping key at t={}", key.time);
        }
    }

    /// Push a key from a scene motion state (control thread)
    pub fn input_motion_state(&self, state: &MotionState, time: f64) {
        self.input_motion_key(MotionKey {
            time,
            position: state.position(),
            orientation: state.orientation(),
        });
    }

    /// Drain pending keys into the model (audio thread, once per block)
    pub fn handle_motion_keys(&self) {
        let mut audio = self.audio.lock();
        while let Ok(key) = audio.consumer.pop() {
            audio.model.input_motion_key(key);
        }
    }

    /// Pose estimate at the block time (audio thread)
    pub fn estimate(&self, query_time: f64) -> Option<Pose> {
        self.audio.lock().model.estimate(query_time)
    }

    /// Flush logs and forget history (control thread, stream stopped)
    pub fn reset(&self) {
        let mut audio = self.audio.lock();
        while audio.consumer.pop().is_ok() {}
        audio.model.reset();
    }

    pub fn set_name(&self, name: &str) {
        self.audio.lock().model.set_name(name);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MOTION LOG
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
struct MotionLogEntry {
    time: f64,
    position: Vec3,
    view: Vec3,
    up: Vec3,
    orientation: Quat,
    num_involved_keys: usize,
}

/// In-memory event log that flushes to a tab-separated file
struct MotionLog {
    entries: Vec<MotionLogEntry>,
    output_file: Option<PathBuf>,
}

impl MotionLog {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            output_file: None,
        }
    }

    fn set_output_file(&mut self, path: PathBuf) {
        self.output_file = Some(path);
    }

    fn log(&mut self, entry: MotionLogEntry) {
        self.entries.push(entry);
    }

    /// Write all entries; without an output file this is a no-op
    fn store(&mut self) -> AurResult<()> {
        let Some(path) = &self.output_file else {
            return Ok(());
        };
        if self.entries.is_empty() {
            return Ok(());
        }

        let mut file = std::fs::File::create(path)?;
        writeln!(
            file,
            "time\tpos_x\tpos_y\tpos_z\tview_x\tview_y\tview_z\tup_x\tup_y\tup_z\tquat_x\tquat_y\tquat_z\tquat_w\tnum_involved_keys"
        )?;
        for e in &self.entries {
            writeln!(
                file,
                "{:.12}\t{:.12}\t{:.12}\t{:.12}\t{:.12}\t{:.12}\t{:.12}\t{:.12}\t{:.12}\t{:.12}\t{:.12}\t{:.12}\t{:.12}\t{:.12}\t{}",
                e.time,
                e.position.x,
                e.position.y,
                e.position.z,
                e.view.x,
                e.view.y,
                e.view.z,
                e.up.x,
                e.up.y,
                e.up.z,
                e.orientation.x,
                e.orientation.y,
                e.orientation.z,
                e.orientation.w,
                e.num_involved_keys
            )?;
        }
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(time: f64, x: f64) -> MotionKey {
        MotionKey {
            time,
            position: Vec3::new(x, 0.0, 0.0),
            orientation: Quat::IDENTITY,
        }
    }

    fn model() -> MotionModel {
        MotionModel::new(MotionModelConfig::default()).unwrap()
    }

    #[test]
    fn test_no_keys_no_estimate() {
        let mut m = model();
        assert!(m.estimate(1.0).is_none());
    }

    #[test]
    fn test_single_key_extrapolates_verbatim() {
        let mut m = model();
        m.input_motion_key(key(0.0, 1.0));
        // Single key has zero velocity: position holds
        let p = m.estimate(0.5).unwrap();
        assert_eq!(p.position, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_estimate_idempotent() {
        let mut m = model();
        m.input_motion_key(key(0.0, 0.0));
        m.input_motion_key(key(0.1, 1.0));
        m.input_motion_key(key(0.2, 2.0));

        let a = m.estimate(0.3).unwrap();
        let b = m.estimate(0.3).unwrap();
        assert_eq!(a.position, b.position);
        assert_eq!(a.orientation, b.orientation);
    }

    #[test]
    fn test_moving_source_follows_velocity() {
        let mut m = model();
        // Constant velocity of 10 m/s along x
        for i in 0..10 {
            let t = i as f64 * 0.05;
            m.input_motion_key(key(t, 10.0 * t));
        }
        // Query behind the newest key by the window delay
        let estimate = m.estimate(0.5).unwrap();
        // The window is centered at t=0.4; extrapolation brings every key to
        // its position at t=0.5
        assert!((estimate.position.x - 5.0).abs() < 0.2);
    }

    #[test]
    fn test_keys_outside_window_have_no_influence() {
        let config = MotionModelConfig {
            window_size: 0.1,
            window_delay: 0.1,
            ..Default::default()
        };
        let mut m = MotionModel::new(config).unwrap();
        m.input_motion_key(key(10.0, 3.0));
        m.input_motion_key(key(10.05, 3.0));

        let with_recent = m.estimate(10.2).unwrap();

        // A key far in the past gets weight zero and must not change anything
        let config = MotionModelConfig {
            window_size: 0.1,
            window_delay: 0.1,
            ..Default::default()
        };
        let mut m2 = MotionModel::new(config).unwrap();
        m2.input_motion_key(key(0.0, -100.0));
        m2.input_motion_key(key(10.0, 3.0));
        m2.input_motion_key(key(10.05, 3.0));
        let with_old = m2.estimate(10.2).unwrap();

        assert!((with_recent.position.x - with_old.position.x).abs() < 1e-9);
    }

    #[test]
    fn test_future_key_beyond_window_does_not_change_estimate() {
        let mut a = model();
        a.input_motion_key(key(1.0, 1.0));
        a.input_motion_key(key(1.05, 2.0));
        let before = a.estimate(1.15).unwrap();

        let mut b = model();
        b.input_motion_key(key(1.0, 1.0));
        b.input_motion_key(key(1.05, 2.0));
        // A key far in the future carries zero weight for this query
        b.input_motion_key(key(10.0, 500.0));
        let after = b.estimate(1.15).unwrap();

        assert_eq!(before.position, after.position);
    }

    #[test]
    fn test_out_of_order_inputs_accepted() {
        let mut m = model();
        m.input_motion_key(key(1.0, 1.0));
        m.input_motion_key(key(0.5, 0.5)); // runs backward, still accepted
        assert!(m.estimate(1.5).is_some());
    }

    #[test]
    fn test_all_keys_stale_returns_newest() {
        let config = MotionModelConfig {
            window_size: 0.1,
            window_delay: 0.0,
            ..Default::default()
        };
        let mut m = MotionModel::new(config).unwrap();
        m.input_motion_key(key(0.0, 7.0));
        // Way past the window; single key has zero velocity
        let p = m.estimate(100.0).unwrap();
        assert_eq!(p.position.x, 7.0);
    }

    #[test]
    fn test_shared_model_hand_off() {
        let shared = SharedMotionModel::new(MotionModelConfig::default()).unwrap();
        shared.input_motion_key(key(0.0, 1.0));
        shared.input_motion_key(key(0.1, 2.0));

        // Audio side: drain then estimate
        shared.handle_motion_keys();
        let p = shared.estimate(0.2).unwrap();
        assert!(p.position.x > 1.0);
    }

    #[test]
    fn test_ring_capacity_wraps() {
        let config = MotionModelConfig {
            num_history_keys: 4,
            ..Default::default()
        };
        let mut m = MotionModel::new(config).unwrap();
        for i in 0..10 {
            m.input_motion_key(key(i as f64 * 0.01, i as f64));
        }
        assert_eq!(m.num_history_keys(), 4);
        assert!(m.estimate(0.1).is_some());
    }

    #[test]
    fn test_motion_log_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motion_Estimated.log");

        let config = MotionModelConfig {
            log_estimated: true,
            ..Default::default()
        };
        let mut m = MotionModel::new(config).unwrap();
        m.estimation_log.set_output_file(path.clone());
        m.input_motion_key(key(0.0, 1.0));
        m.estimate(0.1);
        m.reset();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("time\tpos_x\tpos_y\tpos_z"));
        assert!(header.ends_with("num_involved_keys"));
        let row = lines.next().unwrap();
        assert_eq!(row.split('\t').count(), 15);
    }
}
