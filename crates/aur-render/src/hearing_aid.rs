//! Prototype hearing-aid renderer
//!
//! Renders four channels per receiver: front and rear behind-the-ear
//! microphones on both sides. The receiver dataset must carry four-channel
//! impulse responses; selection resolves the head-above-torso orientation
//! when the dataset supports it. A configurable channel map routes dataset
//! channels onto output channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use aur_core::{
    AurError, AurResult, AuralizationMode, Pool, PoolItem, PoolRef, RelativeMetrics, SampleBuffer,
    SampleFrame, StreamInfo, Struct,
};
use aur_dsp::{MixMode, PartitionedConvolver, ThirdOctaveFilterBank, VariableDelayLine,
    VdlAlgorithm};
use aur_scene::{SceneDiff, SceneRef};

use crate::freefield::{RenderSettings, parse_path_config};
use crate::{
    AudioRenderer, ControlSide, PathDspConfig, PathRenderContext, RendererBase,
    RendererInitParams, RendererReceiver, RendererSource,
};

/// Front-left, front-right, rear-left, rear-right
const HA_CHANNELS: usize = 4;

/// Hearing-aid transmission path
pub struct HearingAidSoundPath {
    source: Option<PoolRef<RendererSource>>,
    receiver: Option<PoolRef<RendererReceiver>>,
    marked_for_deletion: AtomicBool,
    channel_map: [usize; HA_CHANNELS],
    config: PathDspConfig,
    dsp: Mutex<HearingAidPathDsp>,
}

struct HearingAidPathDsp {
    vdl_left: VariableDelayLine,
    vdl_right: VariableDelayLine,
    filter_bank: ThirdOctaveFilterBank,
    convolvers: Vec<PartitionedConvolver>,
    hrir_record: Option<(usize, i32)>,
    hrir_frame: SampleFrame,
    input: SampleBuffer,
    bank_out: SampleBuffer,
    ear_left: SampleBuffer,
    ear_right: SampleBuffer,
}

impl HearingAidSoundPath {
    fn with_config(config: PathDspConfig, channel_map: [usize; HA_CHANNELS]) -> Self {
        let block = config.props.block_length;
        let rate = config.props.sample_rate;
        let mut convolvers: Vec<PartitionedConvolver> = (0..HA_CHANNELS)
            .map(|_| PartitionedConvolver::new(block, config.hrir_filter_length, 4))
            .collect();
        let mut delta = vec![0.0; 8];
        delta[0] = 1.0;
        for conv in &mut convolvers {
            if let Some(handle) = conv.request_filter() {
                conv.load(handle, &delta);
                conv.exchange_filter(handle);
            }
        }
        let mut vdl_left = VariableDelayLine::new(rate, block, 10.0);
        let mut vdl_right = VariableDelayLine::new(rate, block, 10.0);
        vdl_left.set_algorithm(config.default_vdl);
        vdl_right.set_algorithm(config.default_vdl);

        Self {
            source: None,
            receiver: None,
            marked_for_deletion: AtomicBool::new(false),
            channel_map,
            dsp: Mutex::new(HearingAidPathDsp {
                vdl_left,
                vdl_right,
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
                hrir_record: None,
                hrir_frame: SampleFrame::new(HA_CHANNELS, config.hrir_filter_length),
                input: SampleBuffer::new(block),
                bank_out: SampleBuffer::new(block),
                ear_left: SampleBuffer::new(block),
                ear_right: SampleBuffer::new(block),
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
        if dsp.vdl_left.algorithm() != wanted {
            dsp.vdl_left.set_algorithm(wanted);
            dsp.vdl_right.set_algorithm(wanted);
        }

        let delay = metrics.distance / ctx.sound_speed + ctx.additional_static_delay;
        dsp.vdl_left.set_delay_seconds(delay.max(0.0));
        dsp.vdl_right.set_delay_seconds(delay.max(0.0));

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

        // Four-channel BTE impulse responses, HATO-resolved when possible
        if let Some(dataset) = receiver_state.directivity() {
            let record = dataset.nearest_neighbour(
                metrics.azimuth_receiver_to_source,
                metrics.elevation_receiver_to_source,
            );
            let hato_deg = receiver_state
                .motion()
                .and_then(|m| m.head_above_torso())
                .map(|q| q.yaw_deg())
                .unwrap_or(0.0);
            let hato_key = hato_deg.round() as i32;

            if dsp.hrir_record != Some((record, hato_key)) {
                let dsp = &mut *dsp;
                let fetched = dataset
                    .hrir_by_index_and_hato(&mut dsp.hrir_frame, record, hato_deg)
                    .or_else(|_| {
                        dataset.hrir_by_index(&mut dsp.hrir_frame, record, metrics.distance)
                    });
                if fetched.is_ok() {
                    for (out_ch, conv) in dsp.convolvers.iter_mut().enumerate() {
                        let dataset_ch = self.channel_map[out_ch];
                        if let Some(ir) = dsp.hrir_frame.get_channel(dataset_ch) {
                            if let Some(handle) = conv.request_filter() {
                                conv.load(handle, ir.data());
                                conv.exchange_filter(handle);
                            }
                        }
                    }
                    dsp.hrir_record = Some((record, hato_key));
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
        dsp.vdl_left
            .process(dsp.bank_out.data(), dsp.ear_left.data_mut());
        dsp.vdl_right
            .process(dsp.bank_out.data(), dsp.ear_right.data_mut());

        // Left-side channels (0, 2) take the left delay, right-side (1, 3)
        // the right delay
        let mut bus = receiver.output().lock();
        for (out_ch, conv) in dsp.convolvers.iter_mut().enumerate() {
            if out_ch >= bus.num_channels() {
                break;
            }
            let side = if out_ch % 2 == 0 {
                &dsp.ear_left
            } else {
                &dsp.ear_right
            };
            conv.process(side.data(), bus.channel_mut(out_ch).data_mut(), MixMode::Add);
        }
    }
}

impl PoolItem for HearingAidSoundPath {
    fn reset(&mut self) {
        self.source = None;
        self.receiver = None;
        *self.marked_for_deletion.get_mut() = false;
        let default_vdl = self.config.default_vdl;
        let dsp = self.dsp.get_mut();
        dsp.vdl_left.reset();
        dsp.vdl_right.reset();
        dsp.vdl_left.set_algorithm(default_vdl);
        dsp.vdl_right.set_algorithm(default_vdl);
        dsp.filter_bank.set_identity();
        dsp.filter_bank.reset();
        for conv in &mut dsp.convolvers {
            conv.reset_history();
        }
        dsp.hrir_record = None;
    }

    fn pre_release(&mut self) {
        self.source = None;
        self.receiver = None;
    }
}

/// Four-channel hearing-aid renderer
pub struct HearingAidRenderer {
    base: RendererBase<HearingAidSoundPath>,
    path_pool: Pool<HearingAidSoundPath>,
    settings: Mutex<RenderSettings>,
    channel_map: [usize; HA_CHANNELS],
}

impl HearingAidRenderer {
    pub fn new(params: &RendererInitParams) -> AurResult<Self> {
        let (path_config, settings) = parse_path_config(params)?;

        // Channel map keys route dataset channels onto outputs
        let mut channel_map = [0, 1, 2, 3];
        let map_keys = ["ChannelMapFL", "ChannelMapFR", "ChannelMapRL", "ChannelMapRR"];
        for (slot, key) in channel_map.iter_mut().zip(map_keys) {
            if let Some(v) = params.config.opt_int(key)? {
                if !(0..HA_CHANNELS as i64).contains(&v) {
                    return Err(AurError::InvalidParameter(format!(
                        "key '{key}': channel index {v} outside 0..{HA_CHANNELS}"
                    )));
                }
                *slot = v as usize;
            }
        }

        let base = RendererBase::new(params, HA_CHANNELS)?;
        let pool_config = path_config.clone();
        Ok(Self {
            base,
            path_pool: Pool::new(4, 2, move || {
                HearingAidSoundPath::with_config(pool_config.clone(), channel_map)
            }),
            settings: Mutex::new(settings),
            channel_map,
        })
    }

    fn manage_sound_paths(&self, control: &mut ControlSide<HearingAidSoundPath>, diff: &SceneDiff) {
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
        control: &mut ControlSide<HearingAidSoundPath>,
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

impl AudioRenderer for HearingAidRenderer {
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
        HA_CHANNELS
    }

    fn set_parameters(&self, params: &Struct) -> AurResult<()> {
        if let Some(delay) = params.opt_double("AdditionalStaticDelaySeconds")? {
            self.settings.lock().additional_static_delay = delay.max(0.0);
        }
        Ok(())
    }

    fn get_parameters(&self, _query: &Struct) -> AurResult<Struct> {
        let mut out = Struct::new();
        out.set("NumChannels", HA_CHANNELS as i64);
        let map_keys = ["ChannelMapFL", "ChannelMapFR", "ChannelMapRL", "ChannelMapRR"];
        for (value, key) in self.channel_map.iter().zip(map_keys) {
            out.set(key, *value as i64);
        }
        Ok(out)
    }
}
