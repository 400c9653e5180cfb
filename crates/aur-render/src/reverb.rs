//! Binaural artificial reverb renderer
//!
//! Maintains one binaural room impulse response per receiver, synthesized
//! from reverberation times (3 or 8 bands), room volume, and surface area:
//! diracs are Poisson-placed over time slots with the reflection density
//! following Kuttruff's equation (capped at a configurable maximum), scaled
//! by the exponential decay of each band, band-filtered, and accumulated.
//! Synthesis runs on a background thread; the audio thread exchanges the
//! finished response into the per-receiver convolvers and never blocks on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use aur_core::{
    AurError, AurResult, AuralizationMode, DEFAULT_SOUND_SPEED, Pool, PoolItem, PoolRef,
    RelativeMetrics, Sample, SampleBuffer, SampleFrame, StreamInfo, Struct, Vec3,
};
use aur_dsp::{Biquad, MixMode, PartitionedConvolver, VariableDelayLine};
use aur_scene::{SceneDiff, SceneRef};

use crate::{
    AudioRenderer, ControlSide, RendererBase, RendererInitParams, RendererReceiver, RendererSource,
};

/// Minimum allowed reverberation time in seconds
const MIN_REVERBERATION_TIME: f64 = 0.25;
const MIN_ROOM_VOLUME: f64 = 1.0;
const MIN_ROOM_SURFACE_AREA: f64 = 1.0;
/// Fixed seed so repeated syntheses produce the same dirac sequence
const POISSON_SEED: u64 = 667;

/// Reverb synthesis parameters
#[derive(Debug, Clone)]
pub struct ReverbConfig {
    /// Band reverberation times, 3 (low/mid/high) or 8 (octaves 63 Hz..8 kHz)
    pub reverberation_times: Vec<f64>,
    pub room_volume: f64,
    pub room_surface_area: f64,
    pub position_threshold: f64,
    pub angle_threshold_deg: f64,
    pub time_slot_resolution: f64,
    pub max_reflection_density: f64,
    pub scattering_coefficient: f64,
    pub max_filter_length: usize,
}

impl Default for ReverbConfig {
    fn default() -> Self {
        Self {
            reverberation_times: vec![1.0 * std::f64::consts::SQRT_2, 1.0, 1.0 / std::f64::consts::SQRT_2],
            room_volume: 200.0,
            room_surface_area: 88.0,
            position_threshold: 1.0,
            angle_threshold_deg: 30.0,
            time_slot_resolution: 0.005,
            max_reflection_density: 12000.0,
            scattering_coefficient: 0.2,
            max_filter_length: 88200,
        }
    }
}

impl ReverbConfig {
    fn clamp_and_warn(&mut self) {
        for rt in &mut self.reverberation_times {
            if *rt < MIN_REVERBERATION_TIME {
                log::warn!(
                    "requested reverberation time of {rt} s too small, clamping to {MIN_REVERBERATION_TIME} s"
                );
                *rt = MIN_REVERBERATION_TIME;
            }
        }
        if self.room_volume < MIN_ROOM_VOLUME {
            log::warn!("room volume clamped to {MIN_ROOM_VOLUME} m^3");
            self.room_volume = MIN_ROOM_VOLUME;
        }
        if self.room_surface_area < MIN_ROOM_SURFACE_AREA {
            log::warn!("room surface area clamped to {MIN_ROOM_SURFACE_AREA} m^2");
            self.room_surface_area = MIN_ROOM_SURFACE_AREA;
        }
    }

    /// Accept `room_reverberation_times` as a scalar or a band list
    fn set_reverberation_times_value(&mut self, value: &aur_core::Value) -> AurResult<()> {
        if let Some(rt) = value.coerce_double() {
            let n = self.reverberation_times.len();
            self.reverberation_times = if n == 8 {
                vec![rt; 8]
            } else {
                vec![rt * std::f64::consts::SQRT_2, rt, rt / std::f64::consts::SQRT_2]
            };
            return Ok(());
        }
        if let Some(nested) = value.as_struct() {
            let mut times = Vec::new();
            for (_, v) in nested.iter() {
                times.push(v.coerce_double().ok_or_else(|| {
                    AurError::InvalidParameter(
                        "key 'room_reverberation_times': non-numeric band entry".into(),
                    )
                })?);
            }
            if times.len() != 3 && times.len() != 8 {
                return Err(AurError::InvalidParameter(
                    "key 'room_reverberation_times': provide 3 or 8 band values".into(),
                ));
            }
            self.reverberation_times = times;
            return Ok(());
        }
        Err(AurError::InvalidParameter(
            "key 'room_reverberation_times': expected number or band list".into(),
        ))
    }

    /// Band crossover frequencies for the configured band count
    fn band_centers(&self) -> Vec<f64> {
        if self.reverberation_times.len() == 8 {
            vec![63.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0]
        } else {
            vec![125.0, 1000.0, 4000.0]
        }
    }
}

/// Synthesize a two-channel room impulse response
///
/// Channels use independent dirac signs, which decorrelates the ears the way
/// a diffuse field does.
pub fn synthesize_brir(config: &ReverbConfig, sample_rate: f64) -> (Vec<Sample>, Vec<Sample>) {
    let length = config.max_filter_length;
    let mut left = vec![0.0f32; length];
    let mut right = vec![0.0f32; length];

    let c = DEFAULT_SOUND_SPEED;
    let mean_free_path = 4.0 * config.room_volume / config.room_surface_area;
    let t_last_image_source = mean_free_path / c;
    let scatter_factor = 0.75 + config.scattering_coefficient / 4.0;
    let slot_samples = (sample_rate * config.time_slot_resolution).max(1.0) as usize;
    let num_slots = length / slot_samples + 1;

    let centers = config.band_centers();
    for (band, &rt) in config.reverberation_times.iter().enumerate() {
        let rt = rt.max(MIN_REVERBERATION_TIME);
        let mut rng = StdRng::seed_from_u64(POISSON_SEED + band as u64);

        let mut band_left = vec![0.0f32; length];
        let mut band_right = vec![0.0f32; length];

        // Initial energy from the critical distance and the decay integral
        let time_const = -13.816 / rt;
        let area_norm = ((time_const * length as f64 / sample_rate).exp()
            - (time_const * t_last_image_source).exp())
            / time_const;
        let absorption_area = 0.163 * config.room_volume / rt;
        let critical_distance = (absorption_area / (16.0 * std::f64::consts::PI)).sqrt();
        let initial_energy = 3.0 / critical_distance.powi(2) / c / area_norm.abs().max(1e-12);

        for slot in 0..num_slots {
            let t = (slot * slot_samples + 1) as f64 / sample_rate;
            // Kuttruff's reflection density, capped at the configured maximum
            let density = (4.0 * std::f64::consts::PI * c * c * c * t * t / config.room_volume)
                .min(config.max_reflection_density);
            let diracs = (density * scatter_factor / sample_rate * slot_samples as f64) as usize;
            let poisson_scale = if diracs > 1 {
                (1.0 / diracs as f64).sqrt()
            } else {
                1.0
            };

            for _ in 0..diracs {
                let pos = slot * slot_samples + rng.random_range(0..slot_samples);
                if pos >= length {
                    break;
                }
                let t_abs = pos as f64 / sample_rate;
                let decay = (-13.816 * t_abs / rt).exp();
                let energy = if t_abs < t_last_image_source {
                    // Build-up phase before the diffuse field is established
                    initial_energy * (t_abs / t_last_image_source) * decay
                } else {
                    initial_energy * decay
                };
                let amplitude = (energy.max(0.0)).sqrt() * poisson_scale;

                let sign_l = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
                let sign_r = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
                band_left[pos] += (sign_l * amplitude) as f32;
                band_right[pos] += (sign_r * amplitude) as f32;
            }
        }

        // Shape the band: lowest band lowpassed, highest highpassed, the
        // rest bandpassed around their centers
        let center = centers.get(band).copied().unwrap_or(1000.0);
        let filter = if band == 0 {
            Biquad::lowpass(center * 1.5, 0.707, sample_rate)
        } else if band == config.reverberation_times.len() - 1 {
            Biquad::highpass(center * 0.75, 0.707, sample_rate)
        } else {
            Biquad::bandpass(center, 0.9, sample_rate)
        };
        let mut filter_left = filter;
        filter_left.process_buffer(&mut band_left);
        let mut filter_right = filter;
        filter_right.process_buffer(&mut band_right);

        for (acc, &s) in left.iter_mut().zip(&band_left) {
            *acc += s;
        }
        for (acc, &s) in right.iter_mut().zip(&band_right) {
            *acc += s;
        }
    }

    (left, right)
}

/// Per-receiver reverberation engine
struct ReceiverReverb {
    /// Mono sum of all delayed source signals, rebuilt every block
    mix: Mutex<SampleBuffer>,
    convolvers: Mutex<(PartitionedConvolver, PartitionedConvolver)>,
    /// Finished BRIR from the simulator, picked up by the audio thread
    pending_brir: Mutex<Option<(Vec<Sample>, Vec<Sample>)>>,
    /// Pose the current BRIR was computed for
    brir_pose: Mutex<Option<(Vec3, Vec3)>>,
    regenerations: AtomicU64,
}

impl ReceiverReverb {
    fn new(block_length: usize, max_filter_length: usize) -> Arc<Self> {
        Arc::new(Self {
            mix: Mutex::new(SampleBuffer::new(block_length)),
            convolvers: Mutex::new((
                PartitionedConvolver::new(block_length, max_filter_length, 3),
                PartitionedConvolver::new(block_length, max_filter_length, 3),
            )),
            pending_brir: Mutex::new(None),
            brir_pose: Mutex::new(None),
            regenerations: AtomicU64::new(0),
        })
    }
}

enum SimulatorJob {
    Synthesize {
        target: Arc<ReceiverReverb>,
        config: ReverbConfig,
        sample_rate: f64,
    },
    Shutdown,
}

/// Reverb path: propagation delay into the receiver's diffuse mix
pub struct ReverbSoundPath {
    source: Option<PoolRef<RendererSource>>,
    receiver: Option<PoolRef<RendererReceiver>>,
    marked_for_deletion: AtomicBool,
    dsp: Mutex<ReverbPathDsp>,
}

struct ReverbPathDsp {
    vdl: VariableDelayLine,
    input: SampleBuffer,
    delayed: SampleBuffer,
}

impl ReverbSoundPath {
    fn new(sample_rate: f64, block_length: usize) -> Self {
        Self {
            source: None,
            receiver: None,
            marked_for_deletion: AtomicBool::new(false),
            dsp: Mutex::new(ReverbPathDsp {
                vdl: VariableDelayLine::new(sample_rate, block_length, 10.0),
                input: SampleBuffer::new(block_length),
                delayed: SampleBuffer::new(block_length),
            }),
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

    /// Delay the source signal and add it to the receiver's diffuse mix
    fn process_block(
        &self,
        scene: &SceneRef,
        global_aura: AuralizationMode,
        calibration_db: f64,
        mix: &mut SampleBuffer,
    ) {
        let Some(source) = self.source.as_ref() else {
            return;
        };
        let Some(receiver) = self.receiver.as_ref() else {
            return;
        };
        let Some(source_state) = scene.sound_source_state(source.id()) else {
            return;
        };
        let Some(receiver_state) = scene.sound_receiver_state(receiver.id()) else {
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
            global_aura,
        );
        // The diffuse field needs either early reflections or late decay
        let audible = effective.contains(AuralizationMode::EARLY_REFLECTIONS)
            || effective.contains(AuralizationMode::DIFFUSE_DECAY);
        let muted = source_state.is_muted() || source.signal().is_some_and(|s| s.is_muted());
        if !audible || muted {
            return;
        }

        let metrics = RelativeMetrics::calc(&source_pred.pose, &receiver_pred.pose);
        let gain = source_state.volume(calibration_db);

        let mut dsp = self.dsp.lock();
        dsp.vdl
            .set_delay_seconds(metrics.distance / DEFAULT_SOUND_SPEED);

        let dsp = &mut *dsp;
        match source.signal() {
            Some(signal) => signal.copy_channel(0, &mut dsp.input),
            None => dsp.input.zero(),
        }
        dsp.vdl.process(dsp.input.data(), dsp.delayed.data_mut());

        for (acc, &s) in mix.data_mut().iter_mut().zip(dsp.delayed.data()) {
            *acc += s * gain as Sample;
        }
    }
}

impl PoolItem for ReverbSoundPath {
    fn reset(&mut self) {
        self.source = None;
        self.receiver = None;
        *self.marked_for_deletion.get_mut() = false;
        self.dsp.get_mut().vdl.reset();
    }

    fn pre_release(&mut self) {
        self.source = None;
        self.receiver = None;
    }
}

/// Binaural artificial reverberation renderer
pub struct ArtificialReverbRenderer {
    base: RendererBase<ReverbSoundPath>,
    path_pool: Pool<ReverbSoundPath>,
    config: Mutex<ReverbConfig>,
    reverbs: Mutex<HashMap<i32, Arc<ReceiverReverb>>>,
    simulator: Sender<SimulatorJob>,
    simulator_thread: Mutex<Option<JoinHandle<()>>>,
    calibration_db: f64,
}

impl ArtificialReverbRenderer {
    pub fn new(params: &RendererInitParams) -> AurResult<Self> {
        let mut config = ReverbConfig::default();
        if let Some(value) = params.config.get("room_reverberation_times") {
            config.set_reverberation_times_value(value)?;
        }
        if let Some(v) = params.config.opt_double("RoomVolume")? {
            config.room_volume = v;
        }
        if let Some(v) = params.config.opt_double("RoomSurfaceArea")? {
            config.room_surface_area = v;
        }
        if let Some(v) = params.config.opt_double("PositionThreshold")? {
            config.position_threshold = v;
        }
        if let Some(v) = params.config.opt_double("AngleThresholdDegree")? {
            config.angle_threshold_deg = v;
        }
        if let Some(v) = params.config.opt_double("MaxReflectionDensity")? {
            config.max_reflection_density = v;
        }
        if let Some(v) = params.config.opt_int("MaxFilterLengthSamples")? {
            config.max_filter_length = v.max(1) as usize;
        }
        config.clamp_and_warn();

        let base = RendererBase::new(params, 2)?;
        let props = params.props;

        // Background simulator: one job per regeneration request
        let (tx, rx) = unbounded::<SimulatorJob>();
        let thread = std::thread::Builder::new()
            .name("brir-simulator".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        SimulatorJob::Synthesize {
                            target,
                            config,
                            sample_rate,
                        } => {
                            let brir = synthesize_brir(&config, sample_rate);
                            *target.pending_brir.lock() = Some(brir);
                        }
                        SimulatorJob::Shutdown => break,
                    }
                }
            })
            .expect("spawning the BRIR simulator thread");

        Ok(Self {
            base,
            path_pool: Pool::new(4, 2, move || {
                ReverbSoundPath::new(props.sample_rate, props.block_length)
            }),
            config: Mutex::new(config),
            reverbs: Mutex::new(HashMap::new()),
            simulator: tx,
            simulator_thread: Mutex::new(Some(thread)),
            calibration_db: aur_core::DEFAULT_AMPLITUDE_CALIBRATION_DB,
        })
    }

    fn request_brir(&self, reverb: &Arc<ReceiverReverb>) {
        reverb.regenerations.fetch_add(1, Ordering::Relaxed);
        let job = SimulatorJob::Synthesize {
            target: Arc::clone(reverb),
            config: self.config.lock().clone(),
            sample_rate: self.base.props.sample_rate,
        };
        let _ = self.simulator.send(job);
    }

    /// Request regeneration for receivers that moved beyond the thresholds
    fn check_regeneration(&self, scene: &SceneRef) {
        let config = self.config.lock().clone();
        let reverbs = self.reverbs.lock();
        for (&id, reverb) in reverbs.iter() {
            let Some(state) = scene.sound_receiver_state(id) else {
                continue;
            };
            let Some(motion) = state.motion() else {
                continue;
            };
            let position = motion.position();
            let view = motion.view();

            let mut pose_slot = reverb.brir_pose.lock();
            let needs_update = match *pose_slot {
                None => true,
                Some((last_pos, last_view)) => {
                    let moved = position.distance_to(&last_pos) > config.position_threshold;
                    let angle = last_view
                        .dot(&view)
                        .clamp(-1.0, 1.0)
                        .acos()
                        .to_degrees();
                    moved || angle > config.angle_threshold_deg
                }
            };
            if needs_update {
                *pose_slot = Some((position, view));
                drop(pose_slot);
                self.request_brir(reverb);
            }
        }
    }

    fn manage_sound_paths(&self, control: &mut ControlSide<ReverbSoundPath>, diff: &SceneDiff) {
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
            self.reverbs.lock().remove(&id);
        }
        for &id in &diff.sources.new_ids {
            self.base.create_source(control, id);
        }
        for &id in &diff.receivers.new_ids {
            self.base.create_receiver(control, id);
            let reverb = ReceiverReverb::new(
                self.base.props.block_length,
                self.config.lock().max_filter_length,
            );
            self.reverbs.lock().insert(id, reverb);
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
        control: &mut ControlSide<ReverbSoundPath>,
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

impl AudioRenderer for ArtificialReverbRenderer {
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
        self.check_regeneration(&new_scene);
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

        let global = self.base.global_aura();
        let reverbs = self.reverbs.lock();

        // Sum all paths into their receiver's diffuse mix
        for reverb in reverbs.values() {
            reverb.mix.lock().zero();
        }
        for path in &audio.paths {
            let Some(receiver) = path.receiver() else {
                continue;
            };
            let Some(reverb) = reverbs.get(&receiver.id()) else {
                continue;
            };
            let mut mix = reverb.mix.lock();
            path.process_block(&scene, global, self.calibration_db, &mut mix);
        }

        // Convolve each receiver's mix with its BRIR
        for receiver in &audio.receivers {
            let Some(reverb) = reverbs.get(&receiver.id()) else {
                continue;
            };

            let mut convolvers = reverb.convolvers.lock();
            if let Some((left, right)) = reverb.pending_brir.lock().take() {
                let (conv_l, conv_r) = &mut *convolvers;
                if let Some(handle) = conv_l.request_filter() {
                    conv_l.load(handle, &left);
                    conv_l.exchange_filter(handle);
                }
                if let Some(handle) = conv_r.request_filter() {
                    conv_r.load(handle, &right);
                    conv_r.exchange_filter(handle);
                }
            }

            // Diffuse-decay gate drives the reverb gain
            let dd_enabled = scene
                .sound_receiver_state(receiver.id())
                .map(|state| {
                    AuralizationMode::combine(
                        AuralizationMode::ALL,
                        state.auralization_mode(),
                        global,
                    )
                    .contains(AuralizationMode::DIFFUSE_DECAY)
                })
                .unwrap_or(false);
            let gain = if dd_enabled { 1.0 } else { 0.0 };

            let mix = reverb.mix.lock();
            let mut bus = receiver.output().lock();
            let (conv_l, conv_r) = &mut *convolvers;
            conv_l.set_gain(gain);
            conv_r.set_gain(gain);
            conv_l.process(mix.data(), bus.channel_mut(0).data_mut(), MixMode::Add);
            conv_r.process(mix.data(), bus.channel_mut(1).data_mut(), MixMode::Add);
        }
        drop(reverbs);

        self.base
            .mix_receivers(&audio, Some(&scene), output.frame_mut());
        output.increment_write_pointer();
    }

    fn reset(&self) {
        self.base.reset_control(|_| {});
        self.reverbs.lock().clear();
    }

    fn mix_output_into(&self, dest: &mut SampleFrame) {
        dest.add(self.base.output.lock().frame());
    }

    fn num_output_channels(&self) -> usize {
        2
    }

    fn set_parameters(&self, params: &Struct) -> AurResult<()> {
        let mut changed = false;
        {
            let mut config = self.config.lock();
            if let Some(value) = params.get("room_reverberation_times") {
                config.set_reverberation_times_value(value)?;
                changed = true;
            }
            if let Some(v) = params.opt_double("RoomVolume")? {
                config.room_volume = v;
                changed = true;
            }
            if let Some(v) = params.opt_double("RoomSurfaceArea")? {
                config.room_surface_area = v;
                changed = true;
            }
            if let Some(v) = params.opt_double("PositionThreshold")? {
                config.position_threshold = v;
            }
            if let Some(v) = params.opt_double("AngleThresholdDegree")? {
                config.angle_threshold_deg = v;
            }
            if changed {
                config.clamp_and_warn();
            }
        }
        if changed {
            // New acoustics: regenerate every receiver's BRIR
            let reverbs = self.reverbs.lock();
            for reverb in reverbs.values() {
                self.request_brir(reverb);
            }
        }
        Ok(())
    }

    fn get_parameters(&self, _query: &Struct) -> AurResult<Struct> {
        let config = self.config.lock();
        let mut out = Struct::new();
        let mut times = Struct::new();
        for (i, rt) in config.reverberation_times.iter().enumerate() {
            times.set(format!("band_{}", i + 1), *rt);
        }
        out.set("room_reverberation_times", times)
            .set("RoomVolume", config.room_volume)
            .set("RoomSurfaceArea", config.room_surface_area)
            .set("PositionThreshold", config.position_threshold)
            .set("AngleThresholdDegree", config.angle_threshold_deg);

        let reverbs = self.reverbs.lock();
        let mut regen = Struct::new();
        for (&id, reverb) in reverbs.iter() {
            regen.set(
                id.to_string(),
                reverb.regenerations.load(Ordering::Relaxed) as i64,
            );
        }
        out.set("brir_regenerations", regen);
        Ok(out)
    }
}

impl Drop for ArtificialReverbRenderer {
    fn drop(&mut self) {
        let _ = self.simulator.send(SimulatorJob::Shutdown);
        if let Some(thread) = self.simulator_thread.lock().take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brir_decays() {
        let config = ReverbConfig {
            max_filter_length: 44100,
            ..Default::default()
        };
        let (left, right) = synthesize_brir(&config, 44100.0);
        assert_eq!(left.len(), 44100);

        let early: f64 = left[0..11025].iter().map(|&s| (s as f64).powi(2)).sum();
        let late: f64 = left[33075..44100].iter().map(|&s| (s as f64).powi(2)).sum();
        assert!(early > late, "early energy {early} vs late {late}");

        // Channels are decorrelated, not copies
        assert_ne!(left, right);
    }

    #[test]
    fn test_brir_deterministic() {
        let config = ReverbConfig {
            max_filter_length: 8192,
            ..Default::default()
        };
        let (a, _) = synthesize_brir(&config, 44100.0);
        let (b, _) = synthesize_brir(&config, 44100.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rt_clamp() {
        let mut config = ReverbConfig {
            reverberation_times: vec![0.1, 1.0, 0.2],
            ..Default::default()
        };
        config.clamp_and_warn();
        assert_eq!(config.reverberation_times[0], MIN_REVERBERATION_TIME);
        assert_eq!(config.reverberation_times[1], 1.0);
        assert_eq!(config.reverberation_times[2], MIN_REVERBERATION_TIME);
    }
}
