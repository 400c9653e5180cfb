//! Shared renderer machinery
//!
//! Every variant owns a `RendererBase`: entity pools, the update-message
//! queue, the reset handshake, the control-side bookkeeping maps, and the
//! audio-side live lists. The control side mutates only under the control
//! mutex, the audio side only under the audio mutex; the queue and the pooled
//! references are the only bridges between the two.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use parking_lot::Mutex;

use aur_core::{
    AurResult, AuralizationMode, BlockOutput, Pool, PoolItem, PoolRef, SampleFrame,
    StreamProperties, Struct,
};
use aur_scene::{MotionModelConfig, SceneRef, SceneStateItem};

use crate::{
    RendererInitParams, RendererReceiver, RendererSource, ResetHandshake, ResetState,
    SignalRouter, UpdateMessage, UpdateQueue,
};

/// Control-thread half of a renderer
pub struct ControlSide<P: PoolItem> {
    pub cur_scene: Option<SceneRef>,
    pub sources: HashMap<i32, PoolRef<RendererSource>>,
    pub receivers: HashMap<i32, PoolRef<RendererReceiver>>,
    pub paths: Vec<PoolRef<P>>,
    pub pending: Option<aur_core::PoolBox<UpdateMessage<P>>>,
}

impl<P: PoolItem> Default for ControlSide<P> {
    fn default() -> Self {
        Self {
            cur_scene: None,
            sources: HashMap::new(),
            receivers: HashMap::new(),
            paths: Vec::new(),
            pending: None,
        }
    }
}

/// Audio-thread half of a renderer
pub struct AudioSide<P: PoolItem> {
    pub sources: Vec<PoolRef<RendererSource>>,
    pub receivers: Vec<PoolRef<RendererReceiver>>,
    pub paths: Vec<PoolRef<P>>,
}

impl<P: PoolItem> Default for AudioSide<P> {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            receivers: Vec::new(),
            paths: Vec::new(),
        }
    }
}

const STATUS_STOPPED: u8 = 0;
const STATUS_STREAMING: u8 = 1;

/// Common state and plumbing of one renderer instance
pub struct RendererBase<P: PoolItem> {
    pub name: String,
    pub props: StreamProperties,
    pub offline: bool,
    global_aura: AtomicU32,
    status: AtomicU8,
    pub reset_flag: ResetHandshake,
    queue: UpdateQueue<P>,
    source_pool: Pool<RendererSource>,
    receiver_pool: Pool<RendererReceiver>,
    pub signals: Arc<SignalRouter>,
    pub control: Mutex<ControlSide<P>>,
    pub audio: Mutex<AudioSide<P>>,
    scene_for_audio: Mutex<Option<SceneRef>>,
    pub output: Mutex<BlockOutput>,
    source_motion_config: MotionModelConfig,
    receiver_motion_config: MotionModelConfig,
    /// Prefix for motion log files when logging is on
    motion_log_prefix: Option<String>,
    receiver_channels: usize,
}

/// Parse the motion-model keys shared by all renderer configurations
pub fn motion_config_from(config: &Struct) -> AurResult<(MotionModelConfig, MotionModelConfig)> {
    let mut base = MotionModelConfig::default();
    if let Some(keys) = config.opt_int("MotionModelNumHistoryKeys")? {
        base.num_history_keys = keys.max(1) as usize;
    }
    if let Some(size) = config.opt_double("MotionModelWindowSize")? {
        base.window_size = size;
    }
    if let Some(delay) = config.opt_double("MotionModelWindowDelay")? {
        base.window_delay = delay;
    }
    base.validate()?;

    let mut sources = base.clone();
    sources.log_input = config.opt_bool("MotionModelLogInputSources")?.unwrap_or(false);
    let mut receivers = base;
    receivers.log_input = config.opt_bool("MotionModelLogInputListener")?.unwrap_or(false);
    Ok((sources, receivers))
}

impl<P: PoolItem> RendererBase<P> {
    pub fn new(params: &RendererInitParams, receiver_channels: usize) -> AurResult<Self> {
        let (source_motion_config, receiver_motion_config) = motion_config_from(&params.config)?;
        let logging = source_motion_config.log_input || receiver_motion_config.log_input;

        Ok(Self {
            name: params.name.clone(),
            props: params.props,
            offline: params.offline,
            global_aura: AtomicU32::new(AuralizationMode::default().0),
            status: AtomicU8::new(STATUS_STOPPED),
            reset_flag: ResetHandshake::new(),
            queue: UpdateQueue::new(),
            source_pool: Pool::new(8, 4, RendererSource::default),
            receiver_pool: Pool::new(4, 2, RendererReceiver::default),
            signals: Arc::clone(&params.signals),
            control: Mutex::new(ControlSide::default()),
            audio: Mutex::new(AudioSide::default()),
            scene_for_audio: Mutex::new(None),
            output: Mutex::new(BlockOutput::new(receiver_channels, params.props.block_length)),
            source_motion_config,
            receiver_motion_config,
            motion_log_prefix: logging.then(|| params.name.clone()),
            receiver_channels,
        })
    }

    pub fn receiver_channels(&self) -> usize {
        self.receiver_channels
    }

    pub fn global_aura(&self) -> AuralizationMode {
        AuralizationMode(self.global_aura.load(Ordering::Acquire))
    }

    pub fn set_global_aura(&self, mode: AuralizationMode) {
        self.global_aura.store(mode.0, Ordering::Release);
    }

    pub fn is_streaming(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_STREAMING
    }

    pub fn note_streaming(&self) {
        self.status.store(STATUS_STREAMING, Ordering::Release);
    }

    /// Scene snapshot for the current audio block
    pub fn audio_scene(&self) -> Option<SceneRef> {
        self.scene_for_audio.lock().clone()
    }

    // ═══════════════════════════════════════════════════════════════════
    // CONTROL SIDE: scene update bookkeeping
    // ═══════════════════════════════════════════════════════════════════

    /// Open the update message for this scene update
    pub fn start_update(&self, control: &mut ControlSide<P>) {
        control.pending = Some(self.queue.begin());
    }

    /// Create and register a source wrapper
    pub fn create_source(&self, control: &mut ControlSide<P>, id: i32) -> PoolRef<RendererSource> {
        let mut source = self.source_pool.request();
        source.init(
            id,
            self.signals.buffer(id),
            self.source_motion_config.clone(),
            self.motion_log_prefix.as_deref(),
        );
        let source = source.fix();
        control.sources.insert(id, source.clone());
        if let Some(pending) = &mut control.pending {
            pending.new_sources.push(source.clone());
        }
        source
    }

    /// Unregister a source wrapper; live paths must be marked beforehand
    pub fn delete_source(&self, control: &mut ControlSide<P>, id: i32) {
        if let Some(source) = control.sources.remove(&id) {
            source.mark_deleted();
            if let Some(pending) = &mut control.pending {
                pending.del_sources.push(source);
            }
        }
    }

    pub fn create_receiver(
        &self,
        control: &mut ControlSide<P>,
        id: i32,
    ) -> PoolRef<RendererReceiver> {
        let mut receiver = self.receiver_pool.request();
        receiver.init(
            id,
            self.receiver_channels,
            self.props.block_length,
            self.receiver_motion_config.clone(),
            self.motion_log_prefix.as_deref(),
        );
        let receiver = receiver.fix();
        control.receivers.insert(id, receiver.clone());
        if let Some(pending) = &mut control.pending {
            pending.new_receivers.push(receiver.clone());
        }
        receiver
    }

    pub fn delete_receiver(&self, control: &mut ControlSide<P>, id: i32) {
        if let Some(receiver) = control.receivers.remove(&id) {
            receiver.mark_deleted();
            if let Some(pending) = &mut control.pending {
                pending.del_receivers.push(receiver);
            }
        }
    }

    /// Register a freshly created path
    pub fn add_path(&self, control: &mut ControlSide<P>, path: PoolRef<P>) {
        control.paths.push(path.clone());
        if let Some(pending) = &mut control.pending {
            pending.new_paths.push(path);
        }
    }

    /// Remove a path from the control list and schedule its audio removal
    pub fn remove_path(&self, control: &mut ControlSide<P>, path: &PoolRef<P>) {
        control.paths.retain(|p| !PoolRef::ptr_eq(p, path));
        if let Some(pending) = &mut control.pending {
            pending.del_paths.push(path.clone());
        }
    }

    /// Feed changed motion states of the new scene into the motion models
    pub fn update_trajectories(&self, control: &ControlSide<P>, new_scene: &SceneRef) {
        for (&id, source) in &control.sources {
            let cur_motion = control
                .cur_scene
                .as_ref()
                .and_then(|s| s.sound_source_state(id))
                .and_then(|s| s.motion_ref().cloned());
            let new_state = new_scene.sound_source_state(id);
            let Some(new_motion) = new_state.and_then(|s| s.motion_ref()) else {
                continue;
            };
            let changed = match &cur_motion {
                Some(cur) => !PoolRef::ptr_eq(cur, new_motion),
                None => true,
            };
            if changed {
                if let Some(motion) = source.motion() {
                    log::trace!("{}: source {id} new motion state", self.name);
                    motion.input_motion_state(new_motion, new_motion.modification_time());
                }
            }
        }

        for (&id, receiver) in &control.receivers {
            let cur_motion = control
                .cur_scene
                .as_ref()
                .and_then(|s| s.sound_receiver_state(id))
                .and_then(|s| s.motion_ref().cloned());
            let new_state = new_scene.sound_receiver_state(id);
            let Some(new_motion) = new_state.and_then(|s| s.motion_ref()) else {
                continue;
            };
            let changed = match &cur_motion {
                Some(cur) => !PoolRef::ptr_eq(cur, new_motion),
                None => true,
            };
            if changed {
                if let Some(motion) = receiver.motion() {
                    log::trace!("{}: receiver {id} new motion state", self.name);
                    motion.input_motion_state(new_motion, new_motion.modification_time());
                }
            }
        }
    }

    /// Push the pending message and swap in the new scene
    pub fn finish_update(&self, control: &mut ControlSide<P>, new_scene: SceneRef) -> AurResult<()> {
        if let Some(pending) = control.pending.take() {
            self.queue.push(pending)?;
        }
        *self.scene_for_audio.lock() = Some(new_scene.clone());
        control.cur_scene = Some(new_scene);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // AUDIO SIDE: sync, reset, sampling, mixing
    // ═══════════════════════════════════════════════════════════════════

    /// Drain queued update messages into the live lists
    pub fn sync_audio(&self, audio: &mut AudioSide<P>) {
        self.queue.drain(|message| {
            for path in &message.del_paths {
                audio.paths.retain(|p| !PoolRef::ptr_eq(p, path));
            }
            for path in &message.new_paths {
                audio.paths.push(path.clone());
            }
            for source in &message.del_sources {
                audio.sources.retain(|s| !PoolRef::ptr_eq(s, source));
            }
            for source in &message.new_sources {
                audio.sources.push(source.clone());
            }
            for receiver in &message.del_receivers {
                audio.receivers.retain(|r| !PoolRef::ptr_eq(r, receiver));
            }
            for receiver in &message.new_receivers {
                audio.receivers.push(receiver.clone());
            }
        });
    }

    /// Reset check inside `process`; true means "emit silence and return"
    ///
    /// On a pending request the audio side drops every live reference and
    /// acknowledges; while the control side cleans up, blocks stay silent.
    pub fn handle_reset(&self, audio: &mut AudioSide<P>) -> bool {
        match self.reset_flag.state() {
            ResetState::Normal => false,
            ResetState::Requested => {
                log::debug!("{}: audio thread resetting internally", self.name);
                self.reset_audio_side(audio);
                true
            }
            ResetState::Acknowledged => true,
        }
    }

    fn reset_audio_side(&self, audio: &mut AudioSide<P>) {
        // Apply what is still queued so those references release too
        self.sync_audio(audio);
        audio.paths.clear();
        audio.sources.clear();
        audio.receivers.clear();
        self.reset_flag.acknowledge();
    }

    /// Control-thread reset: drain the audio side, then the control side
    pub fn reset_control(&self, mut drop_control_extras: impl FnMut(&mut ControlSide<P>)) {
        log::debug!("{}: reset requested", self.name);
        self.reset_flag.request();

        if !self.is_streaming() || self.offline {
            // No audio callback will run; perform the audio-side cleanup here
            let mut audio = self.audio.lock();
            self.reset_audio_side(&mut audio);
        }
        self.reset_flag.wait_acknowledged();

        let mut control = self.control.lock();
        control.pending = None;
        for path in control.paths.drain(..) {
            debug_assert_eq!(path.ref_count(), 1, "path still referenced during reset");
            drop(path);
        }
        control.sources.clear();
        control.receivers.clear();
        control.cur_scene = None;
        drop_control_extras(&mut control);
        drop(control);

        *self.scene_for_audio.lock() = None;
        self.reset_flag.finish();
        log::debug!("{}: reset complete", self.name);
    }

    /// Sample every live motion model at the block time
    pub fn sample_trajectories(&self, audio: &AudioSide<P>, time: f64) {
        for source in &audio.sources {
            source.sample_trajectory(time);
        }
        for receiver in &audio.receivers {
            receiver.sample_trajectory(time);
        }
    }

    /// Zero all receiver mix buses
    pub fn clear_receiver_outputs(&self, audio: &AudioSide<P>) {
        for receiver in &audio.receivers {
            receiver.output().lock().zero();
        }
    }

    /// Sum receiver buses into the renderer output frame
    pub fn mix_receivers(&self, audio: &AudioSide<P>, scene: Option<&SceneRef>, output: &mut SampleFrame) {
        for receiver in &audio.receivers {
            let muted = scene
                .and_then(|s| s.sound_receiver_state(receiver.id()))
                .map(|state| state.is_muted())
                .unwrap_or(false);
            if !muted {
                output.add(&receiver.output().lock());
            }
        }
    }
}
