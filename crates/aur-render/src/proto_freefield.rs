//! Prototype free-field renderer
//!
//! Free-field propagation like the binaural renderer, but with a configurable
//! per-receiver channel count (the receiver dataset decides what the channels
//! mean) and optional per-receiver output recording to WAV.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use aur_core::{
    AurResult, AuralizationMode, Pool, PoolItem, PoolRef, RelativeMetrics, SampleBuffer,
    SampleFrame, StreamInfo, Struct,
};
use aur_dsp::{MixMode, PartitionedConvolver, ThirdOctaveFilterBank, VariableDelayLine,
    VdlAlgorithm};
use aur_scene::{SceneDiff, SceneRef};

use crate::freefield::{RenderSettings, parse_path_config};
use crate::{
    AudioRenderer, ControlSide, PathDspConfig, PathRenderContext, ReceiverDumper, RendererBase,
    RendererInitParams, RendererReceiver, RendererSource,
};

/// Free-field path with an arbitrary output channel count
pub struct PrototypeSoundPath {
    source: Option<PoolRef<RendererSource>>,
    receiver: Option<PoolRef<RendererReceiver>>,
    marked_for_deletion: AtomicBool,
    num_channels: usize,
    config: PathDspConfig,
    dsp: Mutex<PrototypePathDsp>,
}

struct PrototypePathDsp {
    vdl: VariableDelayLine,
    filter_bank: ThirdOctaveFilterBank,
    convolvers: Vec<PartitionedConvolver>,
    record: Option<usize>,
    ir_frame: SampleFrame,
    input: SampleBuffer,
    bank_out: SampleBuffer,
    delayed: SampleBuffer,
}

impl PrototypePathDsp {
    fn new(config: &PathDspConfig, num_channels: usize) -> Self {
        let block = config.props.block_length;
        let rate = config.props.sample_rate;
        let mut convolvers: Vec<PartitionedConvolver> = (0..num_channels)
            .map(|_| PartitionedConvolver::new(block, config.hrir_filter_length, 4))
            .collect();
        // Pass-through until a dataset record is loaded
        let mut delta = vec![0.0; 8];
        delta[0] = 1.0;
        for conv in &mut convolvers {
            if let Some(handle) = conv.request_filter() {
                conv.load(handle, &delta);
                conv.exchange_filter(handle);
            }
        }

        let mut vdl = VariableDelayLine::new(rate, block, 10.0);
        vdl.set_algorithm(config.default_vdl);

        Self {
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
            convolvers,
            record: None,
            ir_frame: SampleFrame::new(num_channels, config.hrir_filter_length),
            input: SampleBuffer::new(block),
            bank_out: SampleBuffer::new(block),
            delayed: SampleBuffer::new(block),
        }
    }
}

impl PrototypeSoundPath {
    fn with_config(config: PathDspConfig, num_channels: usize) -> Self {
        Self {
            source: None,
            receiver: None,
            marked_for_deletion: AtomicBool::new(false),
            num_channels,
            dsp: Mutex::new(PrototypePathDsp::new(&config, num_channels)),
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

        // Source directivity
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

        // Receiver dataset record drives the per-channel FIRs
        if let Some(dataset) = receiver_state.directivity() {
            let record = dataset.nearest_neighbour(
                metrics.azimuth_receiver_to_source,
                metrics.elevation_receiver_to_source,
            );
            if dsp.record != Some(record) {
                let dsp = &mut *dsp;
                if dataset
                    .hrir_by_index(&mut dsp.ir_frame, record, metrics.distance)
                    .is_ok()
                {
                    for (ch, conv) in dsp.convolvers.iter_mut().enumerate() {
                        if let Some(ir) = dsp.ir_frame.get_channel(ch) {
                            if let Some(handle) = conv.request_filter() {
                                conv.load(handle, ir.data());
                                conv.exchange_filter(handle);
                            }
                        }
                    }
                    dsp.record = Some(record);
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
        for conv in dsp.convolvers.iter_mut() {
            conv.set_gain(gain as f32);
        }

        let dsp = &mut *dsp;
        match source.signal() {
            Some(signal) => signal.copy_channel(0, &mut dsp.input),
            None => dsp.input.zero(),
        }
        dsp.filter_bank
            .process(dsp.input.data(), dsp.bank_out.data_mut());
        dsp.vdl.process(dsp.bank_out.data(), dsp.delayed.data_mut());

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

impl PoolItem for PrototypeSoundPath {
    fn reset(&mut self) {
        self.source = None;
        self.receiver = None;
        *self.marked_for_deletion.get_mut() = false;
        let dsp = self.dsp.get_mut();
        dsp.vdl.reset();
        dsp.vdl.set_algorithm(self.config.default_vdl);
        dsp.filter_bank.set_identity();
        dsp.filter_bank.reset();
        for conv in &mut dsp.convolvers {
            conv.reset_history();
        }
        dsp.record = None;
    }

    fn pre_release(&mut self) {
        self.source = None;
        self.receiver = None;
    }
}

/// Free-field renderer with configurable channels and recording
pub struct PrototypeFreeFieldRenderer {
    base: RendererBase<PrototypeSoundPath>,
    path_pool: Pool<PrototypeSoundPath>,
    settings: Mutex<RenderSettings>,
    dumper: ReceiverDumper,
    num_channels: usize,
}

impl PrototypeFreeFieldRenderer {
    pub fn new(params: &RendererInitParams) -> AurResult<Self> {
        let (path_config, settings) = parse_path_config(params)?;
        let num_channels = params
            .config
            .opt_int("NumChannels")?
            .unwrap_or(2)
            .max(1) as usize;

        let base = RendererBase::new(params, num_channels)?;
        let pool_config = path_config.clone();
        Ok(Self {
            dumper: ReceiverDumper::new(
                params.props.sample_rate,
                num_channels,
                params.props.block_length,
            ),
            base,
            path_pool: Pool::new(4, 2, move || {
                PrototypeSoundPath::with_config(pool_config.clone(), num_channels)
            }),
            settings: Mutex::new(settings),
            num_channels,
        })
    }

    fn manage_sound_paths(&self, control: &mut ControlSide<PrototypeSoundPath>, diff: &SceneDiff) {
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
        control: &mut ControlSide<PrototypeSoundPath>,
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

impl AudioRenderer for PrototypeFreeFieldRenderer {
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

        if self.dumper.is_active() {
            for receiver in &audio.receivers {
                self.dumper.write_block(receiver.id(), &receiver.output().lock());
            }
        }
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
        if let Some(gain) = params.opt_double("DumpReceiversGain")? {
            self.dumper.set_gain(gain);
        }
        if let Some(prefix) = params.opt_string("DumpReceiversStart")? {
            let ids: Vec<i32> = self.base.control.lock().receivers.keys().copied().collect();
            self.dumper.start(&ids, &prefix)?;
        }
        if params.opt_bool("DumpReceiversStop")?.unwrap_or(false) {
            self.dumper.stop()?;
        }
        Ok(())
    }

    fn get_parameters(&self, _query: &Struct) -> AurResult<Struct> {
        let mut out = Struct::new();
        out.set("NumChannels", self.num_channels as i64)
            .set(
                "AdditionalStaticDelaySeconds",
                self.settings.lock().additional_static_delay,
            );
        Ok(out)
    }
}
