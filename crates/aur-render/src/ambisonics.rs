//! Ambisonics free-field renderer
//!
//! Paths share one delay line and one directivity filter bank per
//! source-receiver pair; instead of per-ear HRIR convolution, the delayed
//! signal is weighted by real spherical-harmonic basis values of the
//! receiver-relative direction, producing (N+1)² channels that sum into a
//! common receiver frame. Channel gains ramp linearly across each block.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use aur_core::{
    AurError, AurResult, AuralizationMode, Pool, PoolItem, PoolRef, RelativeMetrics, Sample,
    SampleBuffer, SampleFrame, StreamInfo, Struct,
};
use aur_dsp::{
    MAX_AMBISONICS_ORDER, ThirdOctaveFilterBank, VariableDelayLine, VdlAlgorithm,
    evaluate_sh_into, num_ambisonics_channels,
};
use aur_scene::{SceneDiff, SceneRef};

use crate::freefield::{RenderSettings, parse_path_config};
use crate::{
    AudioRenderer, ControlSide, PathDspConfig, PathRenderContext, RendererBase,
    RendererInitParams, RendererReceiver, RendererSource,
};

/// Source-receiver path encoding into spherical harmonics
pub struct AmbisonicsSoundPath {
    source: Option<PoolRef<RendererSource>>,
    receiver: Option<PoolRef<RendererReceiver>>,
    marked_for_deletion: AtomicBool,
    order: usize,
    config: PathDspConfig,
    dsp: Mutex<AmbisonicsPathDsp>,
}

struct AmbisonicsPathDsp {
    vdl: VariableDelayLine,
    filter_bank: ThirdOctaveFilterBank,
    /// Channel gains of the previous block (ramp start)
    gains_current: Vec<f64>,
    /// Channel gains for this block (ramp end)
    gains_target: Vec<f64>,
    sh_scratch: Vec<f64>,
    input: SampleBuffer,
    bank_out: SampleBuffer,
    delayed: SampleBuffer,
}

impl AmbisonicsSoundPath {
    fn with_config(config: PathDspConfig, order: usize) -> Self {
        let block = config.props.block_length;
        let rate = config.props.sample_rate;
        let channels = num_ambisonics_channels(order);
        let mut vdl = VariableDelayLine::new(rate, block, 10.0);
        vdl.set_algorithm(config.default_vdl);
        Self {
            source: None,
            receiver: None,
            marked_for_deletion: AtomicBool::new(false),
            order,
            dsp: Mutex::new(AmbisonicsPathDsp {
                vdl,
                filter_bank: ThirdOctaveFilterBank::new(config.filter_bank_type, rate, block)
                    .unwrap_or_else(|_| {
                        ThirdOctaveFilterBank::new(
                            aur_dsp::FilterBankType::FirSplineLinearPhase,
                            rate,
                            block,
                        )
                        .expect("FIR filter bank always constructs")
                    }),
                gains_current: vec![0.0; channels],
                gains_target: vec![0.0; channels],
                sh_scratch: vec![0.0; channels],
                input: SampleBuffer::new(block),
                bank_out: SampleBuffer::new(block),
                delayed: SampleBuffer::new(block),
            }),
            config,
        }
    }

    fn init(&mut self, source: PoolRef<RendererSource>, receiver: PoolRef<RendererReceiver>) {
        self.source = Some(source);
        self.receiver = Some(receiver);
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

    fn process_block(&self, ctx: &PathRenderContext<'_>) {
        let (Some(source), Some(receiver)) = (self.source.as_ref(), self.receiver.as_ref()) else {
            return;
        };
        let Some(source_state) = ctx.scene.sound_source_state(source.id()) else {
            return;
        };
        let Some(receiver_state) = ctx.scene.sound_receiver_state(receiver.id()) else {
            return;
        };
        let source_pred = source.predicted();
        let receiver_pred = receiver.predicted();
        if !source_pred.valid || !receiver_pred.valid {
            return;
        }

        let metrics = RelativeMetrics::calc(&source_pred.pose, &receiver_pred.pose);
        let effective = AuralizationMode::combine(
            source_state.auralization_mode(),
            receiver_state.auralization_mode(),
            ctx.global_aura,
        );

        let mut dsp = self.dsp.lock();

        let doppler = effective.contains(AuralizationMode::DOPPLER);
        let wanted = if doppler { ctx.default_vdl } else { VdlAlgorithm::Switch };
        if dsp.vdl.algorithm() != wanted {
            dsp.vdl.set_algorithm(wanted);
        }
        dsp.vdl.set_delay_seconds(
            (metrics.distance / ctx.sound_speed + ctx.additional_static_delay).max(0.0),
        );

        if effective.contains(AuralizationMode::SOURCE_DIRECTIVITY) {
            if let Some(handle) = source_state.directivity() {
                let record = handle.nearest_neighbour(
                    metrics.azimuth_source_to_receiver,
                    metrics.elevation_source_to_receiver,
                );
                if let Some(magnitudes) = handle.magnitudes(record) {
                    dsp.filter_bank.set_magnitudes(&magnitudes);
                }
            }
        }

        let spreading = effective.contains(AuralizationMode::SPREADING_LOSS);
        let distance_gain = if spreading {
            1.0 / metrics.distance.max(ctx.minimum_distance)
        } else {
            1.0 / ctx.default_distance
        };
        let direct = effective.contains(AuralizationMode::DIRECT_SOUND);
        let muted = source_state.is_muted() || source.signal().is_some_and(|s| s.is_muted());
        let mut gain = distance_gain * source_state.volume(ctx.calibration_db);
        if muted || !direct {
            gain = 0.0;
        }

        // New channel gains: SH basis of the receiver-relative direction
        {
            let dsp = &mut *dsp;
            evaluate_sh_into(
                self.order,
                metrics.azimuth_receiver_to_source,
                metrics.elevation_receiver_to_source,
                &mut dsp.sh_scratch,
            );
            dsp.gains_current.copy_from_slice(&dsp.gains_target);
            for (target, &sh) in dsp.gains_target.iter_mut().zip(dsp.sh_scratch.iter()) {
                *target = sh * gain;
            }
        }

        let dsp = &mut *dsp;
        match source.signal() {
            Some(signal) => signal.copy_channel(0, &mut dsp.input),
            None => dsp.input.zero(),
        }
        dsp.filter_bank
            .process(dsp.input.data(), dsp.bank_out.data_mut());
        dsp.vdl.process(dsp.bank_out.data(), dsp.delayed.data_mut());

        // Encode: per channel, ramp the gain linearly across the block
        let mut bus = receiver.output().lock();
        let n = dsp.delayed.len();
        for ch in 0..num_ambisonics_channels(self.order).min(bus.num_channels()) {
            let g0 = dsp.gains_current[ch];
            let g1 = dsp.gains_target[ch];
            let out = bus.channel_mut(ch).data_mut();
            for (i, (&s, o)) in dsp.delayed.data().iter().zip(out.iter_mut()).enumerate() {
                let g = g0 + (g1 - g0) * ((i + 1) as f64 / n as f64);
                *o += s * g as Sample;
            }
        }
    }
}

impl PoolItem for AmbisonicsSoundPath {
    fn reset(&mut self) {
        self.source = None;
        self.receiver = None;
        *self.marked_for_deletion.get_mut() = false;
        let default_vdl = self.config.default_vdl;
        let dsp = self.dsp.get_mut();
        dsp.vdl.reset();
        dsp.vdl.set_algorithm(default_vdl);
        dsp.filter_bank.set_identity();
        dsp.filter_bank.reset();
        dsp.gains_current.fill(0.0);
        dsp.gains_target.fill(0.0);
    }

    fn pre_release(&mut self) {
        self.source = None;
        self.receiver = None;
    }
}

/// Free-field renderer producing an ambisonics sound field
pub struct AmbisonicsFreeFieldRenderer {
    base: RendererBase<AmbisonicsSoundPath>,
    path_pool: Pool<AmbisonicsSoundPath>,
    settings: Mutex<RenderSettings>,
    order: usize,
    num_channels: usize,
}

impl AmbisonicsFreeFieldRenderer {
    pub fn new(params: &RendererInitParams) -> AurResult<Self> {
        let (path_config, settings) = parse_path_config(params)?;

        let order = params.config.opt_int("TruncationOrder")?.unwrap_or(3);
        if order < 0 || order as usize > MAX_AMBISONICS_ORDER {
            return Err(AurError::InvalidParameter(format!(
                "key 'TruncationOrder': order {order} outside 0..={MAX_AMBISONICS_ORDER}"
            )));
        }
        let order = order as usize;
        let num_channels = num_ambisonics_channels(order);

        let base = RendererBase::new(params, num_channels)?;
        let pool_config = path_config.clone();
        Ok(Self {
            base,
            path_pool: Pool::new(4, 2, move || {
                AmbisonicsSoundPath::with_config(pool_config.clone(), order)
            }),
            settings: Mutex::new(settings),
            order,
            num_channels,
        })
    }

    fn manage_sound_paths(&self, control: &mut ControlSide<AmbisonicsSoundPath>, diff: &SceneDiff) {
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
        control: &mut ControlSide<AmbisonicsSoundPath>,
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
}

impl AudioRenderer for AmbisonicsFreeFieldRenderer {
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

        self.base.sample_trajectories(&audio, info.sys_time);
        self.base.clear_receiver_outputs(&audio);

        let settings = self.settings.lock().clone();
        let ctx = PathRenderContext {
            scene: &scene,
            global_aura: self.base.global_aura(),
            sound_speed: settings.sound_speed,
            minimum_distance: settings.minimum_distance,
            default_distance: settings.default_distance,
            calibration_db: settings.calibration_db,
            additional_static_delay: settings.additional_static_delay,
            default_vdl: settings.default_vdl,
        };
        for path in &audio.paths {
            path.process_block(&ctx);
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

    fn set_parameters(&self, params: &Struct) -> AurResult<()> {
        if let Some(delay) = params.opt_double("AdditionalStaticDelaySeconds")? {
            self.settings.lock().additional_static_delay = delay.max(0.0);
        }
        Ok(())
    }

    fn get_parameters(&self, _query: &Struct) -> AurResult<Struct> {
        let mut out = Struct::new();
        out.set("TruncationOrder", self.order as i64)
            .set("NumChannels", self.num_channels as i64);
        Ok(out)
    }
}
