//! Renderer-side entity wrappers
//!
//! A renderer wraps every scene source and receiver it tracks into a pooled
//! object that couples the entity id with its signal buffer, motion model,
//! and the pose predicted for the current block. Wrappers are shared between
//! the control side (which feeds motion keys) and the audio side (which
//! samples them), so the mutable halves sit behind single-owner mutexes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use aur_core::{PoolItem, Pose, SampleFrame, SourceSignalBuffer};
use aur_scene::{MotionModelConfig, SharedMotionModel};

/// Pose sampled at the current block time
#[derive(Debug, Clone, Copy, Default)]
pub struct PredictedPose {
    pub pose: Pose,
    /// False until the motion model produced a first estimate
    pub valid: bool,
}

/// Renderer wrapper around one sound source
pub struct RendererSource {
    id: i32,
    signal: Option<Arc<SourceSignalBuffer>>,
    motion: Option<SharedMotionModel>,
    predicted: Mutex<PredictedPose>,
    deleted: AtomicBool,
}

impl RendererSource {
    /// Populate after pool request, before fixing
    pub fn init(
        &mut self,
        id: i32,
        signal: Arc<SourceSignalBuffer>,
        motion_config: MotionModelConfig,
        log_name: Option<&str>,
    ) {
        self.id = id;
        self.signal = Some(signal);
        let motion = SharedMotionModel::new(motion_config)
            .expect("renderer-provided motion config is validated on construction");
        if let Some(name) = log_name {
            motion.set_name(&format!("{name}_Source{id}"));
        }
        self.motion = Some(motion);
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn signal(&self) -> Option<&Arc<SourceSignalBuffer>> {
        self.signal.as_ref()
    }

    pub fn motion(&self) -> Option<&SharedMotionModel> {
        self.motion.as_ref()
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Sample the motion model at the block time (audio thread)
    pub fn sample_trajectory(&self, time: f64) {
        let Some(motion) = &self.motion else {
            return;
        };
        motion.handle_motion_keys();
        let mut predicted = self.predicted.lock();
        match motion.estimate(time) {
            Some(pose) => {
                predicted.pose = pose;
                predicted.valid = true;
            }
            None => predicted.valid = false,
        }
    }

    pub fn predicted(&self) -> PredictedPose {
        *self.predicted.lock()
    }
}

impl Default for RendererSource {
    fn default() -> Self {
        Self {
            id: -1,
            signal: None,
            motion: None,
            predicted: Mutex::new(PredictedPose::default()),
            deleted: AtomicBool::new(false),
        }
    }
}

impl PoolItem for RendererSource {
    fn reset(&mut self) {
        self.id = -1;
        self.signal = None;
        self.motion = None;
        *self.predicted.get_mut() = PredictedPose::default();
        *self.deleted.get_mut() = false;
    }

    fn pre_release(&mut self) {
        self.signal = None;
        self.motion = None;
    }
}

/// Renderer wrapper around one sound receiver
pub struct RendererReceiver {
    id: i32,
    motion: Option<SharedMotionModel>,
    predicted: Mutex<PredictedPose>,
    /// Per-receiver mix bus, summed into the renderer output after the paths
    output: Mutex<SampleFrame>,
    deleted: AtomicBool,
}

impl RendererReceiver {
    pub fn init(
        &mut self,
        id: i32,
        num_channels: usize,
        block_length: usize,
        motion_config: MotionModelConfig,
        log_name: Option<&str>,
    ) {
        self.id = id;
        let motion = SharedMotionModel::new(motion_config)
            .expect("renderer-provided motion config is validated on construction");
        if let Some(name) = log_name {
            motion.set_name(&format!("{name}_Receiver{id}"));
        }
        self.motion = Some(motion);
        *self.output.get_mut() = SampleFrame::new(num_channels, block_length);
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn motion(&self) -> Option<&SharedMotionModel> {
        self.motion.as_ref()
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn sample_trajectory(&self, time: f64) {
        let Some(motion) = &self.motion else {
            return;
        };
        motion.handle_motion_keys();
        let mut predicted = self.predicted.lock();
        match motion.estimate(time) {
            Some(pose) => {
                predicted.pose = pose;
                predicted.valid = true;
            }
            None => predicted.valid = false,
        }
    }

    pub fn predicted(&self) -> PredictedPose {
        *self.predicted.lock()
    }

    /// Receiver mix bus (audio thread)
    pub fn output(&self) -> &Mutex<SampleFrame> {
        &self.output
    }
}

impl Default for RendererReceiver {
    fn default() -> Self {
        Self {
            id: -1,
            motion: None,
            predicted: Mutex::new(PredictedPose::default()),
            output: Mutex::new(SampleFrame::new(0, 0)),
            deleted: AtomicBool::new(false),
        }
    }
}

impl PoolItem for RendererReceiver {
    fn reset(&mut self) {
        self.id = -1;
        self.motion = None;
        *self.predicted.get_mut() = PredictedPose::default();
        *self.deleted.get_mut() = false;
    }

    fn pre_release(&mut self) {
        self.motion = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aur_core::Vec3;
    use aur_scene::MotionKey;

    #[test]
    fn test_source_trajectory_sampling() {
        let mut source = RendererSource::default();
        source.init(
            1,
            SourceSignalBuffer::new(1, 64),
            MotionModelConfig::default(),
            None,
        );

        // No keys yet: estimate invalid
        source.sample_trajectory(0.0);
        assert!(!source.predicted().valid);

        source.motion().unwrap().input_motion_key(MotionKey {
            time: 0.0,
            position: Vec3::new(1.0, 2.0, 3.0),
            orientation: Default::default(),
        });
        source.sample_trajectory(0.1);
        let predicted = source.predicted();
        assert!(predicted.valid);
        assert_eq!(predicted.pose.position, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_receiver_output_frame_dimensions() {
        let mut receiver = RendererReceiver::default();
        receiver.init(7, 2, 128, MotionModelConfig::default(), None);
        assert_eq!(receiver.output().lock().num_channels(), 2);
        assert_eq!(receiver.output().lock().len(), 128);
    }
}
