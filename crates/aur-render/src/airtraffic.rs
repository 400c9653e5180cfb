//! Binaural air-traffic-noise renderer
//!
//! Every source-receiver pair transmits over two sub-paths: the direct line
//! of sight and a ground reflection. Each sub-path composes its third-octave
//! magnitude from up to four sub-spectra (air attenuation, source
//! directivity, temporal variation, ground reflection), which are computed
//! internally from the atmosphere model or overridden externally through the
//! parameter side channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use aur_core::{
    AurError, AurResult, AuralizationMode, NUM_THIRD_OCTAVE_BANDS, Pool, PoolItem, PoolRef,
    RelativeMetrics, Sample, SampleBuffer, SampleFrame, StreamInfo, Struct,
    THIRD_OCTAVE_CENTER_FREQUENCIES, Vec3,
};
use aur_dsp::{
    FilterBankType, MixMode, PartitionedConvolver, ThirdOctaveFilterBank, VariableDelayLine,
    VdlAlgorithm,
};
use aur_scene::{SceneDiff, SceneRef};

use crate::freefield::{RenderSettings, parse_path_config};
use crate::{
    AudioRenderer, ControlSide, PathDspConfig, PathRenderContext, RendererBase,
    RendererInitParams, RendererReceiver, RendererSource,
};

/// Stratified atmosphere description, loaded from JSON
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StratifiedAtmosphere {
    pub layers: Vec<AtmosphereLayer>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AtmosphereLayer {
    /// Upper boundary of the layer in meters
    pub height: f64,
    /// Temperature in degrees Celsius
    pub temperature: f64,
}

impl StratifiedAtmosphere {
    pub fn from_json(text: &str) -> AurResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            AurError::InvalidParameter(format!("key 'stratified_atmosphere': invalid JSON: {e}"))
        })
    }

    /// Average effective sound speed between two altitudes
    ///
    /// A straight-ray approximation over the layer stack; a full eigenray
    /// search is not part of this model.
    pub fn effective_sound_speed(&self, from_height: f64, to_height: f64) -> f64 {
        let lo = from_height.min(to_height);
        let hi = from_height.max(to_height);
        let mut sum = 0.0;
        let mut count = 0;
        for layer in &self.layers {
            if layer.height >= lo && layer.height <= hi || self.layers.len() == 1 {
                sum += sound_speed_celsius(layer.temperature);
                count += 1;
            }
        }
        if count == 0 {
            // Nearest layer decides when the ray crosses none
            let nearest = self
                .layers
                .iter()
                .min_by(|a, b| {
                    (a.height - lo)
                        .abs()
                        .partial_cmp(&(b.height - lo).abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|l| l.temperature)
                .unwrap_or(20.0);
            return sound_speed_celsius(nearest);
        }
        sum / count as f64
    }
}

fn sound_speed_celsius(temperature: f64) -> f64 {
    331.3 * (1.0 + temperature / 273.15).sqrt()
}

/// Atmospheric air attenuation per band, linear magnitude over a distance
fn air_attenuation_magnitudes(distance: f64) -> [Sample; NUM_THIRD_OCTAVE_BANDS] {
    let mut mags = [1.0; NUM_THIRD_OCTAVE_BANDS];
    for (band, slot) in mags.iter_mut().enumerate() {
        let f_khz = THIRD_OCTAVE_CENTER_FREQUENCIES[band] / 1000.0;
        // Power-law fit of atmospheric absorption at moderate humidity
        let alpha_db_per_m = 4.4e-3 * f_khz.powf(1.7);
        let db = alpha_db_per_m * distance;
        *slot = 10f64.powf(-db / 20.0) as Sample;
    }
    mags
}

/// One transmission branch: direct or ground-reflected
struct SubPathDsp {
    vdl_left: VariableDelayLine,
    vdl_right: VariableDelayLine,
    filter_bank: ThirdOctaveFilterBank,
    conv_left: PartitionedConvolver,
    conv_right: PartitionedConvolver,
    hrir_record: Option<usize>,
    hrir_frame: SampleFrame,
    /// Per-band state of the slow fluctuation model
    temporal_variation: [f64; NUM_THIRD_OCTAVE_BANDS],
    rng: StdRng,
    bank_out: SampleBuffer,
    ear_left: SampleBuffer,
    ear_right: SampleBuffer,
}

impl SubPathDsp {
    fn new(config: &PathDspConfig, seed: u64) -> Self {
        let block = config.props.block_length;
        let rate = config.props.sample_rate;
        let mut dsp = Self {
            vdl_left: VariableDelayLine::new(rate, block, 30.0),
            vdl_right: VariableDelayLine::new(rate, block, 30.0),
            filter_bank: ThirdOctaveFilterBank::new(config.filter_bank_type, rate, block)
                .unwrap_or_else(|_| {
                    ThirdOctaveFilterBank::new(FilterBankType::FirSplineLinearPhase, rate, block)
                        .expect("FIR filter bank always constructs")
                }),
            conv_left: PartitionedConvolver::new(block, config.hrir_filter_length, 4),
            conv_right: PartitionedConvolver::new(block, config.hrir_filter_length, 4),
            hrir_record: None,
            hrir_frame: SampleFrame::new(2, config.hrir_filter_length),
            temporal_variation: [1.0; NUM_THIRD_OCTAVE_BANDS],
            rng: StdRng::seed_from_u64(seed),
            bank_out: SampleBuffer::new(block),
            ear_left: SampleBuffer::new(block),
            ear_right: SampleBuffer::new(block),
        };
        dsp.vdl_left.set_algorithm(config.default_vdl);
        dsp.vdl_right.set_algorithm(config.default_vdl);
        let mut delta = vec![0.0; 8];
        delta[0] = 1.0;
        for conv in [&mut dsp.conv_left, &mut dsp.conv_right] {
            if let Some(handle) = conv.request_filter() {
                conv.load(handle, &delta);
                conv.exchange_filter(handle);
            }
        }
        dsp
    }

    /// Advance the slow Gauss-Markov fluctuation of each band
    fn advance_temporal_variation(&mut self) {
        for state in &mut self.temporal_variation {
            let noise: f64 = self.rng.random_range(-1.0..1.0);
            *state = 0.995 * *state + 0.005 * (1.0 + 0.3 * noise);
        }
    }

    fn clear(&mut self, default_vdl: VdlAlgorithm) {
        self.vdl_left.reset();
        self.vdl_right.reset();
        self.vdl_left.set_algorithm(default_vdl);
        self.vdl_right.set_algorithm(default_vdl);
        self.filter_bank.set_identity();
        self.filter_bank.reset();
        self.conv_left.reset_history();
        self.conv_right.reset_history();
        self.hrir_record = None;
        self.temporal_variation = [1.0; NUM_THIRD_OCTAVE_BANDS];
    }
}

/// Externally provided sub-path properties (side-channel overrides)
#[derive(Debug, Clone, Default)]
pub struct ExternalSubPath {
    pub propagation_time: Option<f64>,
    pub geometrical_spreading_loss: Option<f64>,
    pub directivity: Option<[Sample; NUM_THIRD_OCTAVE_BANDS]>,
    pub air_attenuation: Option<[Sample; NUM_THIRD_OCTAVE_BANDS]>,
    pub temporal_variation: Option<[Sample; NUM_THIRD_OCTAVE_BANDS]>,
    pub ground_reflection: Option<[Sample; NUM_THIRD_OCTAVE_BANDS]>,
}

impl ExternalSubPath {
    fn parse(update: &Struct) -> AurResult<Self> {
        let mut out = Self {
            propagation_time: update.opt_double("propagation_time")?,
            geometrical_spreading_loss: update.opt_double("geometrical_spreading_loss")?,
            ..Self::default()
        };
        out.directivity = parse_bands(update, "directivity_third_octaves")?;
        out.air_attenuation = parse_bands(update, "air_attenuation_third_octaves")?;
        out.temporal_variation = parse_bands(update, "temporal_variation_third_octaves")?;
        out.ground_reflection = parse_bands(update, "ground_reflection_third_octaves")?;
        Ok(out)
    }
}

/// Read a `band_1`..`band_31` struct into a magnitude array
fn parse_bands(
    parent: &Struct,
    key: &str,
) -> AurResult<Option<[Sample; NUM_THIRD_OCTAVE_BANDS]>> {
    let Some(value) = parent.get(key) else {
        return Ok(None);
    };
    let nested = value.as_struct().ok_or_else(|| {
        AurError::InvalidParameter(format!("key '{key}': expected a band struct"))
    })?;
    let mut bands = [1.0; NUM_THIRD_OCTAVE_BANDS];
    for (i, slot) in bands.iter_mut().enumerate() {
        let band_key = format!("band_{}", i + 1);
        if let Some(v) = nested.get(&band_key) {
            *slot = v.coerce_double().ok_or_else(|| {
                AurError::InvalidParameter(format!("key '{key}/{band_key}': not a number"))
            })? as Sample;
        }
    }
    Ok(Some(bands))
}

/// Source-receiver transmission with direct and ground-reflected branches
pub struct AtnSoundPath {
    source: Option<PoolRef<RendererSource>>,
    receiver: Option<PoolRef<RendererReceiver>>,
    marked_for_deletion: AtomicBool,
    config: PathDspConfig,
    external: Mutex<(ExternalSubPath, ExternalSubPath)>,
    direct: Mutex<SubPathDsp>,
    reflected: Mutex<SubPathDsp>,
}

impl AtnSoundPath {
    fn with_config(config: PathDspConfig) -> Self {
        Self {
            source: None,
            receiver: None,
            marked_for_deletion: AtomicBool::new(false),
            external: Mutex::new((ExternalSubPath::default(), ExternalSubPath::default())),
            direct: Mutex::new(SubPathDsp::new(&config, 11)),
            reflected: Mutex::new(SubPathDsp::new(&config, 23)),
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

    /// Stage external overrides (control thread)
    pub fn stage_external(&self, direct: Option<ExternalSubPath>, reflected: Option<ExternalSubPath>) {
        let mut external = self.external.lock();
        if let Some(d) = direct {
            external.0 = d;
        }
        if let Some(r) = reflected {
            external.1 = r;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_sub_path(
        dsp: &mut SubPathDsp,
        external: &ExternalSubPath,
        ctx: &PathRenderContext<'_>,
        source_pose: &aur_core::Pose,
        receiver_pose: &aur_core::Pose,
        source: &PoolRef<RendererSource>,
        source_state: &aur_scene::SoundSourceState,
        receiver_state: &aur_scene::SoundReceiverState,
        effective: AuralizationMode,
        sound_speed: f64,
        gate: AuralizationMode,
        is_reflected: bool,
        bus: &mut SampleFrame,
        input: &SampleBuffer,
    ) {
        let metrics = RelativeMetrics::calc(source_pose, receiver_pose);

        // Doppler gate
        let doppler = effective.contains(AuralizationMode::DOPPLER);
        let wanted = if doppler { ctx.default_vdl } else { VdlAlgorithm::Switch };
        if dsp.vdl_left.algorithm() != wanted {
            dsp.vdl_left.set_algorithm(wanted);
            dsp.vdl_right.set_algorithm(wanted);
        }

        // Propagation delay, uniformly offset by the static delay
        let delay = external
            .propagation_time
            .unwrap_or(metrics.distance / sound_speed)
            + ctx.additional_static_delay;
        dsp.vdl_left.set_delay_seconds(delay.max(0.0));
        dsp.vdl_right.set_delay_seconds(delay.max(0.0));

        // Compose the magnitude spectrum from the four sub-spectra
        dsp.advance_temporal_variation();
        let mut magnitudes = [1.0f32; NUM_THIRD_OCTAVE_BANDS];

        if effective.contains(AuralizationMode::MEDIUM_ABSORPTION) {
            let air = external
                .air_attenuation
                .unwrap_or_else(|| air_attenuation_magnitudes(metrics.distance));
            for (m, a) in magnitudes.iter_mut().zip(air) {
                *m *= a;
            }
        }
        if effective.contains(AuralizationMode::SOURCE_DIRECTIVITY) {
            let directivity = external.directivity.or_else(|| {
                source_state.directivity().and_then(|handle| {
                    let record = handle.nearest_neighbour(
                        metrics.azimuth_source_to_receiver,
                        metrics.elevation_source_to_receiver,
                    );
                    handle.magnitudes(record)
                })
            });
            if let Some(d) = directivity {
                for (m, v) in magnitudes.iter_mut().zip(d) {
                    *m *= v;
                }
            }
        }
        if effective.contains(AuralizationMode::TEMP_VAR) {
            match &external.temporal_variation {
                Some(tv) => {
                    for (m, v) in magnitudes.iter_mut().zip(tv) {
                        *m *= v;
                    }
                }
                None => {
                    for (m, v) in magnitudes.iter_mut().zip(dsp.temporal_variation) {
                        *m *= v as Sample;
                    }
                }
            }
        }
        if is_reflected {
            let ground = external.ground_reflection.unwrap_or([0.95; NUM_THIRD_OCTAVE_BANDS]);
            for (m, g) in magnitudes.iter_mut().zip(ground) {
                *m *= g;
            }
        }
        dsp.filter_bank.set_magnitudes(&magnitudes);

        // HRIR for this branch's incidence direction
        if let Some(hrir) = receiver_state.directivity() {
            let record = hrir.nearest_neighbour(
                metrics.azimuth_receiver_to_source,
                metrics.elevation_receiver_to_source,
            );
            if dsp.hrir_record != Some(record)
                && hrir
                    .hrir_by_index(&mut dsp.hrir_frame, record, metrics.distance)
                    .is_ok()
            {
                for (conv, ch) in [(&mut dsp.conv_left, 0), (&mut dsp.conv_right, 1)] {
                    if let Some(handle) = conv.request_filter() {
                        conv.load(handle, dsp.hrir_frame.channel(ch).data());
                        conv.exchange_filter(handle);
                    }
                }
                dsp.hrir_record = Some(record);
            }
        }

        // Gain: spreading loss, source power, branch gate
        let spreading = if effective.contains(AuralizationMode::SPREADING_LOSS) {
            external
                .geometrical_spreading_loss
                .unwrap_or(1.0 / metrics.distance.max(ctx.minimum_distance))
        } else {
            1.0 / ctx.default_distance
        };
        let muted = source_state.is_muted() || source.signal().is_some_and(|s| s.is_muted());
        let mut gain = spreading * source_state.volume(ctx.calibration_db);
        if muted || !effective.contains(gate) {
            gain = 0.0;
        }
        dsp.conv_left.set_gain(gain as f32);
        dsp.conv_right.set_gain(gain as f32);

        dsp.filter_bank.process(input.data(), dsp.bank_out.data_mut());
        dsp.vdl_left
            .process(dsp.bank_out.data(), dsp.ear_left.data_mut());
        dsp.vdl_right
            .process(dsp.bank_out.data(), dsp.ear_right.data_mut());
        dsp.conv_left.process(
            dsp.ear_left.data(),
            bus.channel_mut(0).data_mut(),
            MixMode::Add,
        );
        dsp.conv_right.process(
            dsp.ear_right.data(),
            bus.channel_mut(1).data_mut(),
            MixMode::Add,
        );
    }

    fn process_block(&self, ctx: &PathRenderContext<'_>, sound_speed: f64, input: &mut SampleBuffer) {
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

        let effective = AuralizationMode::combine(
            source_state.auralization_mode(),
            receiver_state.auralization_mode(),
            ctx.global_aura,
        );

        match source.signal() {
            Some(signal) => signal.copy_channel(0, input),
            None => input.zero(),
        }

        let external = self.external.lock().clone();
        let mut bus = receiver.output().lock();

        // Direct line of sight
        {
            let mut dsp = self.direct.lock();
            Self::process_sub_path(
                &mut dsp,
                &external.0,
                ctx,
                &source_pred.pose,
                &receiver_pred.pose,
                source,
                source_state,
                receiver_state,
                effective,
                sound_speed,
                AuralizationMode::DIRECT_SOUND,
                false,
                &mut bus,
                input,
            );
        }

        // Ground reflection: mirror the source below the ground plane
        {
            let mirrored = aur_core::Pose::new(
                Vec3::new(
                    source_pred.pose.position.x,
                    -source_pred.pose.position.y,
                    source_pred.pose.position.z,
                ),
                source_pred.pose.orientation,
            );
            let mut dsp = self.reflected.lock();
            Self::process_sub_path(
                &mut dsp,
                &external.1,
                ctx,
                &mirrored,
                &receiver_pred.pose,
                source,
                source_state,
                receiver_state,
                effective,
                sound_speed,
                AuralizationMode::EARLY_REFLECTIONS,
                true,
                &mut bus,
                input,
            );
        }
    }
}

impl PoolItem for AtnSoundPath {
    fn reset(&mut self) {
        self.source = None;
        self.receiver = None;
        *self.marked_for_deletion.get_mut() = false;
        *self.external.get_mut() = (ExternalSubPath::default(), ExternalSubPath::default());
        let default_vdl = self.config.default_vdl;
        self.direct.get_mut().clear(default_vdl);
        self.reflected.get_mut().clear(default_vdl);
    }

    fn pre_release(&mut self) {
        self.source = None;
        self.receiver = None;
    }
}

/// Atmosphere model selecting how internal sub-spectra are computed
enum AtmosphereModel {
    Homogeneous,
    Stratified(StratifiedAtmosphere),
}

/// Binaural air-traffic-noise renderer
pub struct AirTrafficNoiseRenderer {
    base: RendererBase<AtnSoundPath>,
    path_pool: Pool<AtnSoundPath>,
    settings: Mutex<RenderSettings>,
    atmosphere: Mutex<AtmosphereModel>,
    scratch_input: Mutex<SampleBuffer>,
}

impl AirTrafficNoiseRenderer {
    pub fn new(params: &RendererInitParams) -> AurResult<Self> {
        let (path_config, settings) = parse_path_config(params)?;

        let atmosphere = match params.config.opt_string("stratified_atmosphere")? {
            Some(json) => AtmosphereModel::Stratified(StratifiedAtmosphere::from_json(&json)?),
            None => AtmosphereModel::Homogeneous,
        };

        let base = RendererBase::new(params, 2)?;
        let pool_config = path_config.clone();
        Ok(Self {
            base,
            path_pool: Pool::new(4, 2, move || AtnSoundPath::with_config(pool_config.clone())),
            settings: Mutex::new(settings),
            atmosphere: Mutex::new(atmosphere),
            scratch_input: Mutex::new(SampleBuffer::new(params.props.block_length)),
        })
    }

    fn manage_sound_paths(&self, control: &mut ControlSide<AtnSoundPath>, diff: &SceneDiff) {
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

    fn create_path(&self, control: &mut ControlSide<AtnSoundPath>, source_id: i32, receiver_id: i32) {
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

impl AudioRenderer for AirTrafficNoiseRenderer {
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

        let mut input = self.scratch_input.lock();
        for path in &audio.paths {
            // Per-pair effective sound speed under the current atmosphere
            let sound_speed = {
                let atmosphere = self.atmosphere.lock();
                match &*atmosphere {
                    AtmosphereModel::Homogeneous => settings.sound_speed,
                    AtmosphereModel::Stratified(strat) => {
                        let src_h = path
                            .source()
                            .map(|s| s.predicted().pose.position.y)
                            .unwrap_or(0.0);
                        let rcv_h = path
                            .receiver()
                            .map(|r| r.predicted().pose.position.y)
                            .unwrap_or(0.0);
                        strat.effective_sound_speed(src_h, rcv_h)
                    }
                }
            };
            path.process_block(&ctx, sound_speed, &mut input);
        }
        drop(input);

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
        2
    }

    /// Recognized keys: `sound_source_id` + `sound_receiver_id` with
    /// `direct_path`/`reflected_path` structs, and `stratified_atmosphere`
    fn set_parameters(&self, params: &Struct) -> AurResult<()> {
        if let Some(json) = params.opt_string("stratified_atmosphere")? {
            let text = if std::path::Path::new(&json).exists() {
                std::fs::read_to_string(&json)?
            } else {
                json
            };
            *self.atmosphere.lock() = AtmosphereModel::Stratified(
                StratifiedAtmosphere::from_json(&text)?,
            );
        }

        let source_id = params.opt_int("sound_source_id")?;
        let receiver_id = params.opt_int("sound_receiver_id")?;
        if let (Some(source_id), Some(receiver_id)) = (source_id, receiver_id) {
            let control = self.base.control.lock();
            let path = control
                .paths
                .iter()
                .find(|p| {
                    p.source().is_some_and(|s| s.id() == source_id as i32)
                        && p.receiver().is_some_and(|r| r.id() == receiver_id as i32)
                })
                .cloned()
                .ok_or_else(|| {
                    AurError::InvalidParameter(format!(
                        "no transmission from source {source_id} to receiver {receiver_id}"
                    ))
                })?;
            drop(control);

            let direct = match params.get("direct_path").and_then(|v| v.as_struct()) {
                Some(update) => Some(ExternalSubPath::parse(update)?),
                None => None,
            };
            let reflected = match params.get("reflected_path").and_then(|v| v.as_struct()) {
                Some(update) => Some(ExternalSubPath::parse(update)?),
                None => None,
            };
            path.stage_external(direct, reflected);
        }
        Ok(())
    }

    fn get_parameters(&self, _query: &Struct) -> AurResult<Struct> {
        let mut out = Struct::new();
        let atmosphere = self.atmosphere.lock();
        out.set(
            "atmosphere_model",
            match &*atmosphere {
                AtmosphereModel::Homogeneous => "homogeneous",
                AtmosphereModel::Stratified(_) => "stratified",
            },
        )
        .set("numpaths", self.base.control.lock().paths.len() as i64);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_air_attenuation_monotonic_in_frequency() {
        let mags = air_attenuation_magnitudes(1000.0);
        assert!(mags[0] > mags[30]);
        assert!(mags[30] > 0.0);
    }

    #[test]
    fn test_band_struct_parsing() {
        let mut bands = Struct::new();
        bands.set("band_1", 0.5).set("band_31", 0.25);
        let mut parent = Struct::new();
        parent.set("air_attenuation_third_octaves", bands);

        let parsed = parse_bands(&parent, "air_attenuation_third_octaves")
            .unwrap()
            .unwrap();
        assert_eq!(parsed[0], 0.5);
        assert_eq!(parsed[30], 0.25);
        assert_eq!(parsed[1], 1.0);
    }

    #[test]
    fn test_stratified_atmosphere_json() {
        let json = r#"{"layers": [{"height": 0.0, "temperature": 20.0}, {"height": 1000.0, "temperature": 10.0}]}"#;
        let atm = StratifiedAtmosphere::from_json(json).unwrap();
        let c = atm.effective_sound_speed(0.0, 1000.0);
        assert!(c > 330.0 && c < 350.0);

        assert!(StratifiedAtmosphere::from_json("not json").is_err());
    }
}
