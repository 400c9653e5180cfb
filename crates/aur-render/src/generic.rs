//! Prototype generic-path renderer
//!
//! No geometric computation: clients push raw impulse responses and delays
//! per source-receiver path over the parameter side channel, and the renderer
//! convolves each source signal with them. Used to auralize externally
//! simulated propagation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use aur_core::{
    AurError, AurResult, AuralizationMode, Pool, PoolItem, PoolRef, Sample, SampleBuffer,
    SampleFrame, StreamInfo, Struct, Value,
};
use aur_dsp::{MixMode, PartitionedConvolver, VariableDelayLine, VdlAlgorithm};
use aur_scene::{SceneDiff, SceneRef};

use crate::{
    AudioRenderer, ControlSide, RendererBase, RendererInitParams, RendererReceiver, RendererSource,
};

/// Filter and delay updates staged by the control thread
#[derive(Default)]
struct PendingPathUpdate {
    /// Per-channel impulse responses to exchange
    irs: Vec<Option<Vec<Sample>>>,
    delay_seconds: Option<f64>,
}

/// Path whose DSP is driven entirely by externally provided data
pub struct GenericSoundPath {
    source: Option<PoolRef<RendererSource>>,
    receiver: Option<PoolRef<RendererReceiver>>,
    marked_for_deletion: AtomicBool,
    num_channels: usize,
    pending: Mutex<PendingPathUpdate>,
    dsp: Mutex<GenericPathDsp>,
}

struct GenericPathDsp {
    vdl: VariableDelayLine,
    convolvers: Vec<PartitionedConvolver>,
    input: SampleBuffer,
    delayed: SampleBuffer,
}

impl GenericSoundPath {
    pub(crate) fn new(
        sample_rate: f64,
        block_length: usize,
        num_channels: usize,
        max_ir_length: usize,
    ) -> Self {
        let mut convolvers: Vec<PartitionedConvolver> = (0..num_channels)
            .map(|_| PartitionedConvolver::new(block_length, max_ir_length, 4))
            .collect();
        // Silence until an IR arrives
        for conv in &mut convolvers {
            if let Some(handle) = conv.request_filter() {
                conv.load(handle, &[0.0]);
                conv.exchange_filter(handle);
            }
        }
        let mut vdl = VariableDelayLine::new(sample_rate, block_length, 10.0);
        vdl.set_algorithm(VdlAlgorithm::CubicSpline);
        vdl.set_delay_samples(0.0);

        Self {
            source: None,
            receiver: None,
            marked_for_deletion: AtomicBool::new(false),
            num_channels,
            pending: Mutex::new(PendingPathUpdate::default()),
            dsp: Mutex::new(GenericPathDsp {
                vdl,
                convolvers,
                input: SampleBuffer::new(block_length),
                delayed: SampleBuffer::new(block_length),
            }),
        }
    }

    pub(crate) fn init(
        &mut self,
        source: PoolRef<RendererSource>,
        receiver: PoolRef<RendererReceiver>,
    ) {
        self.source = Some(source);
        self.receiver = Some(receiver);
        let mut pending = self.pending.lock();
        pending.irs = (0..self.num_channels).map(|_| None).collect();
        pending.delay_seconds = None;
    }

    pub fn source(&self) -> Option<&PoolRef<RendererSource>> {
        self.source.as_ref()
    }

    pub fn receiver(&self) -> Option<&PoolRef<RendererReceiver>> {
        self.receiver.as_ref()
    }

    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::Release);
    }

    /// Stage an impulse response for one channel (control thread)
    pub fn stage_ir(&self, channel: usize, ir: Vec<Sample>) {
        let mut pending = self.pending.lock();
        if channel < pending.irs.len() {
            pending.irs[channel] = Some(ir);
        }
    }

    /// Stage a propagation delay (control thread)
    pub fn stage_delay(&self, seconds: f64) {
        self.pending.lock().delay_seconds = Some(seconds);
    }

    pub(crate) fn process_block(
        &self,
        scene: &SceneRef,
        global_aura: AuralizationMode,
        calibration_db: f64,
    ) {
        let (Some(source), Some(receiver)) = (self.source.as_ref(), self.receiver.as_ref()) else {
            return;
        };
        let Some(source_state) = scene.sound_source_state(source.id()) else {
            return;
        };
        let Some(receiver_state) = scene.sound_receiver_state(receiver.id()) else {
            return;
        };

        let mut dsp = self.dsp.lock();

        // Apply staged updates without blocking the control thread
        if let Some(mut pending) = self.pending.try_lock() {
            if let Some(delay) = pending.delay_seconds.take() {
                dsp.vdl.set_delay_seconds(delay.max(0.0));
            }
            for (ch, slot) in pending.irs.iter_mut().enumerate() {
                if let Some(ir) = slot.take() {
                    let dsp = &mut *dsp;
                    if let Some(conv) = dsp.convolvers.get_mut(ch) {
                        if let Some(handle) = conv.request_filter() {
                            conv.load(handle, &ir);
                            conv.exchange_filter(handle);
                        }
                    }
                }
            }
        }

        let effective = AuralizationMode::combine(
            source_state.auralization_mode(),
            receiver_state.auralization_mode(),
            global_aura,
        );
        let muted = source_state.is_muted() || source.signal().is_some_and(|s| s.is_muted());
        let mut gain = source_state.volume(calibration_db);
        if muted || !effective.contains(AuralizationMode::DIRECT_SOUND) {
            gain = 0.0;
        }

        let dsp = &mut *dsp;
        for conv in dsp.convolvers.iter_mut() {
            conv.set_gain(gain as f32);
        }

        match source.signal() {
            Some(signal) => signal.copy_channel(0, &mut dsp.input),
            None => dsp.input.zero(),
        }
        dsp.vdl.process(dsp.input.data(), dsp.delayed.data_mut());

        let mut bus = receiver.output().lock();
        for (ch, conv) in dsp.convolvers.iter_mut().enumerate() {
            if ch >= bus.num_channels() {
                break;
            }
            conv.process(
                dsp.delayed.data(),
                bus.channel_mut(ch).data_mut(),
                MixMode::Add,
            );
        }
    }
}

impl PoolItem for GenericSoundPath {
    fn reset(&mut self) {
        self.source = None;
        self.receiver = None;
        *self.marked_for_deletion.get_mut() = false;
        let pending = self.pending.get_mut();
        pending.irs.clear();
        pending.delay_seconds = None;
        let dsp = self.dsp.get_mut();
        dsp.vdl.reset();
        for conv in &mut dsp.convolvers {
            conv.reset_history();
        }
    }

    fn pre_release(&mut self) {
        self.source = None;
        self.receiver = None;
    }
}

/// Renderer convolving externally provided impulse responses per path
pub struct GenericPathRenderer {
    base: RendererBase<GenericSoundPath>,
    path_pool: Pool<GenericSoundPath>,
    num_channels: usize,
    max_ir_length: usize,
    calibration_db: f64,
}

impl GenericPathRenderer {
    pub fn new(params: &RendererInitParams) -> AurResult<Self> {
        let num_channels = params.config.opt_int("NumChannels")?.unwrap_or(2).max(1) as usize;
        let max_ir_length = params
            .config
            .opt_int("MaxFilterLengthSamples")?
            .or(params.config.opt_int("IRFilterLengthSamples")?)
            .unwrap_or(4096)
            .max(1) as usize;

        let base = RendererBase::new(params, num_channels)?;
        let props = params.props;
        Ok(Self {
            base,
            path_pool: Pool::new(4, 2, move || {
                GenericSoundPath::new(
                    props.sample_rate,
                    props.block_length,
                    num_channels,
                    max_ir_length,
                )
            }),
            num_channels,
            max_ir_length,
            calibration_db: aur_core::DEFAULT_AMPLITUDE_CALIBRATION_DB,
        })
    }

    fn manage_sound_paths(&self, control: &mut ControlSide<GenericSoundPath>, diff: &SceneDiff) {
        let doomed: Vec<_> = control
            .paths
            .iter()
            .filter(|path| {
                path.source()
                    .is_some_and(|s| diff.sources.deleted_ids.contains(&s.id()))
                    || path
                        .receiver()
                        .is_some_and(|r| diff.receivers.deleted_ids.contains(&r.id()))
            })
            .cloned()
            .collect();
        for path in doomed {
            path.mark_for_deletion();
            self.base.remove_path(control, &path);
        }

        for &id in &diff.sources.deleted_ids {
            self.base.delete_source(control, id);
        }
        for &id in &diff.receivers.deleted_ids {
            self.base.delete_receiver(control, id);
        }
        for &id in &diff.sources.new_ids {
            self.base.create_source(control, id);
        }
        for &id in &diff.receivers.new_ids {
            self.base.create_receiver(control, id);
        }

        for &source_id in &diff.sources.new_ids {
            let receiver_ids: Vec<i32> = control.receivers.keys().copied().collect();
            for receiver_id in receiver_ids {
                self.create_path(control, source_id, receiver_id);
            }
        }
        for &receiver_id in &diff.receivers.new_ids {
            let source_ids: Vec<i32> = control
                .sources
                .keys()
                .copied()
                .filter(|id| !diff.sources.new_ids.contains(id))
                .collect();
            for source_id in source_ids {
                self.create_path(control, source_id, receiver_id);
            }
        }
    }

    fn create_path(
        &self,
        control: &mut ControlSide<GenericSoundPath>,
        source_id: i32,
        receiver_id: i32,
    ) {
        let (Some(source), Some(receiver)) = (
            control.sources.get(&source_id).cloned(),
            control.receivers.get(&receiver_id).cloned(),
        ) else {
            return;
        };
        let mut path = self.path_pool.request();
        path.init(source, receiver);
        self.base.add_path(control, path.fix());
    }

    /// Locate a live path by its endpoint ids
    fn find_path(
        control: &ControlSide<GenericSoundPath>,
        source_id: i32,
        receiver_id: i32,
    ) -> Option<PoolRef<GenericSoundPath>> {
        control
            .paths
            .iter()
            .find(|p| {
                p.source().is_some_and(|s| s.id() == source_id)
                    && p.receiver().is_some_and(|r| r.id() == receiver_id)
            })
            .cloned()
    }

    fn ir_samples_from(value: &Value, max_len: usize) -> AurResult<Vec<Sample>> {
        let samples: Vec<Sample> = match value {
            Value::Samples(s) => s.clone(),
            Value::Data(bytes) => bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            other => {
                return Err(AurError::InvalidParameter(format!(
                    "impulse response must be samples or data, got {}",
                    other.type_name()
                )));
            }
        };
        if samples.len() > max_len {
            log::warn!(
                "given IR filter too long ({} samples), cropping to {max_len}",
                samples.len()
            );
            return Ok(samples[..max_len].to_vec());
        }
        Ok(samples)
    }
}

impl AudioRenderer for GenericPathRenderer {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn update_scene(&self, new_scene: SceneRef) -> AurResult<()> {
        let mut control = self.base.control.lock();
        if control
            .cur_scene
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, &new_scene))
        {
            return Ok(());
        }
        let diff = new_scene.diff(control.cur_scene.as_deref());
        self.base.start_update(&mut control);
        self.manage_sound_paths(&mut control, &diff);
        self.base.update_trajectories(&control, &new_scene);
        self.base.finish_update(&mut control, new_scene)
    }

    fn update_global_auralization_mode(&self, mode: AuralizationMode) {
        self.base.set_global_aura(mode);
    }

    fn process(&self, info: &StreamInfo) {
        self.base.note_streaming();
        let _ = info;

        let mut audio = self.base.audio.lock();
        self.base.sync_audio(&mut audio);

        let mut output = self.base.output.lock();
        output.frame_mut().zero();

        if self.base.handle_reset(&mut audio) {
            output.increment_write_pointer();
            return;
        }
        let Some(scene) = self.base.audio_scene() else {
            output.increment_write_pointer();
            return;
        };

        self.base.clear_receiver_outputs(&audio);
        let global = self.base.global_aura();
        for path in &audio.paths {
            path.process_block(&scene, global, self.calibration_db);
        }
        self.base
            .mix_receivers(&audio, Some(&scene), output.frame_mut());
        output.increment_write_pointer();
    }

    fn reset(&self) {
        self.base.reset_control(|_| {});
    }

    fn mix_output_into(&self, dest: &mut SampleFrame) {
        dest.add(self.base.output.lock().frame());
    }

    fn num_output_channels(&self) -> usize {
        self.num_channels
    }

    /// Recognized keys: `source`/`sound_source_id`, `receiver`/
    /// `sound_receiver_id`, `delay` (seconds), `ch1`..`chN` (IR samples)
    fn set_parameters(&self, params: &Struct) -> AurResult<()> {
        let source_id = params
            .opt_int("source")?
            .or(params.opt_int("sound_source_id")?);
        let receiver_id = params
            .opt_int("receiver")?
            .or(params.opt_int("sound_receiver_id")?);
        let (Some(source_id), Some(receiver_id)) = (source_id, receiver_id) else {
            log::info!(
                "{}: parameter setter called without source or receiver id, no path updated",
                self.base.name
            );
            return Ok(());
        };

        let control = self.base.control.lock();
        let path = Self::find_path(&control, source_id as i32, receiver_id as i32).ok_or_else(
            || {
                AurError::InvalidParameter(format!(
                    "no sound path from source {source_id} to receiver {receiver_id}"
                ))
            },
        )?;
        drop(control);

        if let Some(delay) = params.opt_double("delay")? {
            if delay < 0.0 {
                return Err(AurError::InvalidParameter(
                    "key 'delay': variable delay line cannot be anti-causal".into(),
                ));
            }
            path.stage_delay(delay);
        }

        for ch in 0..self.num_channels {
            let key = format!("ch{}", ch + 1);
            if let Some(value) = params.get(&key) {
                let ir = Self::ir_samples_from(value, self.max_ir_length)?;
                path.stage_ir(ch, ir);
            }
        }
        Ok(())
    }

    fn get_parameters(&self, _query: &Struct) -> AurResult<Struct> {
        let mut out = Struct::new();
        out.set("numchannels", self.num_channels as i64)
            .set("irfilterlengthsamples", self.max_ir_length as i64)
            .set(
                "numpaths",
                self.base.control.lock().paths.len() as i64,
            );
        Ok(out)
    }
}
