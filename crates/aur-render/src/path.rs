//! Binaural sound path: the per-(source, receiver) DSP graph
//!
//! Each path owns one variable delay line per ear, a third-octave filter bank
//! for the source directivity, and one FIR convolver per ear for the HRIR.
//! Per block it samples the pair's predicted poses, updates every DSP element
//! from the fresh geometry, and mixes its contribution onto the receiver bus.
//! The path is pooled; the control thread creates and marks it, the audio
//! thread processes and finally releases it.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use aur_core::{
    AuralizationMode, PoolItem, PoolRef, RelativeMetrics, SampleBuffer, SampleFrame,
    StreamProperties,
};
use aur_dsp::{
    FilterBankType, MixMode, PartitionedConvolver, ThirdOctaveFilterBank, VariableDelayLine,
    VdlAlgorithm,
};
use aur_scene::SceneRef;

use crate::{RendererReceiver, RendererSource};

/// Longest source-receiver distance the delay lines can represent
const MAX_PATH_DELAY_SECONDS: f64 = 10.0;

/// Filter slots per convolver: active, fading, staged, spare
const FILTERS_PER_CONVOLVER: usize = 4;

/// Static configuration of a path's DSP elements
#[derive(Debug, Clone)]
pub struct PathDspConfig {
    pub props: StreamProperties,
    pub filter_bank_type: FilterBankType,
    pub hrir_filter_length: usize,
    pub default_vdl: VdlAlgorithm,
}

impl Default for PathDspConfig {
    fn default() -> Self {
        Self {
            props: StreamProperties::new(44100.0, 1024),
            filter_bank_type: FilterBankType::default(),
            hrir_filter_length: 256,
            default_vdl: VdlAlgorithm::default(),
        }
    }
}

/// Per-block environment shared by all paths of one renderer
#[derive(Clone)]
pub struct PathRenderContext<'a> {
    pub scene: &'a SceneRef,
    pub global_aura: AuralizationMode,
    pub sound_speed: f64,
    pub minimum_distance: f64,
    pub default_distance: f64,
    pub calibration_db: f64,
    pub additional_static_delay: f64,
    pub default_vdl: VdlAlgorithm,
}

/// Mutable DSP half of a path, owned by the audio thread
pub struct BinauralPathDsp {
    vdl_left: VariableDelayLine,
    vdl_right: VariableDelayLine,
    filter_bank: ThirdOctaveFilterBank,
    conv_left: PartitionedConvolver,
    conv_right: PartitionedConvolver,

    directivity_record: Option<usize>,
    directivity_applied: bool,
    hrir_record: Option<(usize, i32)>,

    hrir_frame: SampleFrame,
    input: SampleBuffer,
    bank_out: SampleBuffer,
    ear_left: SampleBuffer,
    ear_right: SampleBuffer,
}

impl BinauralPathDsp {
    pub fn new(config: &PathDspConfig) -> Self {
        let block = config.props.block_length;
        let rate = config.props.sample_rate;
        let mut dsp = Self {
            vdl_left: VariableDelayLine::new(rate, block, MAX_PATH_DELAY_SECONDS),
            vdl_right: VariableDelayLine::new(rate, block, MAX_PATH_DELAY_SECONDS),
            // Burg realizations are rejected at renderer construction
            filter_bank: ThirdOctaveFilterBank::new(config.filter_bank_type, rate, block)
                .unwrap_or_else(|_| {
                    ThirdOctaveFilterBank::new(FilterBankType::FirSplineLinearPhase, rate, block)
                        .expect("FIR filter bank always constructs")
                }),
            conv_left: PartitionedConvolver::new(
                block,
                config.hrir_filter_length,
                FILTERS_PER_CONVOLVER,
            ),
            conv_right: PartitionedConvolver::new(
                block,
                config.hrir_filter_length,
                FILTERS_PER_CONVOLVER,
            ),
            directivity_record: None,
            directivity_applied: false,
            hrir_record: None,
            hrir_frame: SampleFrame::new(2, config.hrir_filter_length),
            input: SampleBuffer::new(block),
            bank_out: SampleBuffer::new(block),
            ear_left: SampleBuffer::new(block),
            ear_right: SampleBuffer::new(block),
        };
        dsp.vdl_left.set_algorithm(config.default_vdl);
        dsp.vdl_right.set_algorithm(config.default_vdl);
        dsp.load_identity_hrir();
        dsp
    }

    /// Unit impulse on both ears until real HRIR data arrives
    fn load_identity_hrir(&mut self) {
        let mut delta = vec![0.0; 8];
        delta[0] = 1.0;
        for conv in [&mut self.conv_left, &mut self.conv_right] {
            if let Some(handle) = conv.request_filter() {
                conv.load(handle, &delta);
                conv.exchange_filter(handle);
            }
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
        self.directivity_record = None;
        self.directivity_applied = false;
        self.hrir_record = None;
    }
}

/// Pooled source-receiver path of the binaural renderers
pub struct BinauralSoundPath {
    source: Option<PoolRef<RendererSource>>,
    receiver: Option<PoolRef<RendererReceiver>>,
    marked_for_deletion: AtomicBool,
    config: PathDspConfig,
    dsp: Mutex<BinauralPathDsp>,
}

impl BinauralSoundPath {
    pub fn with_config(config: PathDspConfig) -> Self {
        Self {
            source: None,
            receiver: None,
            marked_for_deletion: AtomicBool::new(false),
            dsp: Mutex::new(BinauralPathDsp::new(&config)),
            config,
        }
    }

    /// Attach the endpoints after pool request, before fixing
    pub fn init(&mut self, source: PoolRef<RendererSource>, receiver: PoolRef<RendererReceiver>) {
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

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }

    /// Whether this path connects the given pair
    pub fn connects(&self, source_id: i32, receiver_id: i32) -> bool {
        self.source.as_ref().is_some_and(|s| s.id() == source_id)
            && self.receiver.as_ref().is_some_and(|r| r.id() == receiver_id)
    }

    /// Run the full per-block pipeline and mix onto the receiver bus
    pub fn process_block(&self, ctx: &PathRenderContext<'_>) {
        let (Some(source), Some(receiver)) = (self.source.as_ref(), self.receiver.as_ref()) else {
            return;
        };

        // Scene data for both endpoints; skip silently when either is gone
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

        // Doppler gate: hard switching disables the pitch shift
        let doppler = effective.contains(AuralizationMode::DOPPLER);
        let wanted_vdl = if doppler { ctx.default_vdl } else { VdlAlgorithm::Switch };
        if dsp.vdl_left.algorithm() != wanted_vdl {
            dsp.vdl_left.set_algorithm(wanted_vdl);
            dsp.vdl_right.set_algorithm(wanted_vdl);
        }

        // Medium propagation delay plus anthropometric ITD steering
        let base_delay = metrics.distance / ctx.sound_speed + ctx.additional_static_delay;
        let itd_offset = itd_correction_seconds(
            receiver_state.anthropometrics().head_width_delta(),
            metrics.azimuth_receiver_to_source,
            ctx.sound_speed,
        );
        dsp.vdl_left.set_delay_seconds((base_delay + itd_offset).max(0.0));
        dsp.vdl_right.set_delay_seconds((base_delay - itd_offset).max(0.0));

        // Source directivity through the third-octave bank
        let directivity_enabled = effective.contains(AuralizationMode::SOURCE_DIRECTIVITY);
        match (directivity_enabled, source_state.directivity()) {
            (true, Some(handle)) => {
                let record = handle.nearest_neighbour(
                    metrics.azimuth_source_to_receiver,
                    metrics.elevation_source_to_receiver,
                );
                if dsp.directivity_record != Some(record) || !dsp.directivity_applied {
                    if let Some(magnitudes) = handle.magnitudes(record) {
                        dsp.filter_bank.set_magnitudes(&magnitudes);
                        dsp.directivity_record = Some(record);
                        dsp.directivity_applied = true;
                    }
                }
            }
            _ => {
                // Missing data or gated off: fall back to identity once
                if dsp.directivity_applied {
                    dsp.filter_bank.set_identity();
                    dsp.directivity_applied = false;
                    dsp.directivity_record = None;
                }
            }
        }

        // Spherical spreading loss
        let spreading = effective.contains(AuralizationMode::SPREADING_LOSS);
        let distance_gain = if spreading {
            1.0 / metrics.distance.max(ctx.minimum_distance)
        } else {
            1.0 / ctx.default_distance
        };

        // HRIR selection, optionally resolving head-above-torso orientation
        if let Some(hrir) = receiver_state.directivity() {
            let record = hrir.nearest_neighbour(
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
                let fetched = if hato_key != 0 {
                    hrir.hrir_by_index_and_hato(&mut dsp.hrir_frame, record, hato_deg)
                        .or_else(|_| {
                            hrir.hrir_by_index(&mut dsp.hrir_frame, record, metrics.distance)
                        })
                } else {
                    hrir.hrir_by_index(&mut dsp.hrir_frame, record, metrics.distance)
                };
                match fetched {
                    Ok(()) => {
                        exchange_ear_filter(&mut dsp.conv_left, dsp.hrir_frame.channel(0));
                        exchange_ear_filter(&mut dsp.conv_right, dsp.hrir_frame.channel(1));
                        dsp.hrir_record = Some((record, hato_key));
                    }
                    Err(e) => {
                        log::debug!("HRIR fetch failed for record {record}: {e}");
                    }
                }
            }
        }

        // Overall gain: spreading loss, source power, mute, direct-sound gate
        let direct_sound = effective.contains(AuralizationMode::DIRECT_SOUND);
        let muted = source_state.is_muted()
            || source.signal().is_some_and(|s| s.is_muted());
        let mut gain = distance_gain * source_state.volume(ctx.calibration_db);
        if muted || !direct_sound {
            gain = 0.0;
        }
        dsp.conv_left.set_gain(gain as f32);
        dsp.conv_right.set_gain(gain as f32);

        // Signal flow: input -> filter bank -> per-ear VDL -> per-ear FIR
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

        let mut bus = receiver.output().lock();
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
}

/// Per-ear delay correction from the head-width deviation
///
/// The wider the head, the larger the wave's extra travel around it; the
/// correction scales with the lateral displacement of the source.
fn itd_correction_seconds(head_width_delta: f64, azimuth_deg: f64, sound_speed: f64) -> f64 {
    0.5 * head_width_delta / sound_speed * azimuth_deg.to_radians().sin()
}

fn exchange_ear_filter(conv: &mut PartitionedConvolver, ir: &SampleBuffer) {
    match conv.request_filter() {
        Some(handle) => {
            conv.load(handle, ir.data());
            conv.exchange_filter(handle);
        }
        None => log::warn!("convolver filter pool exhausted, keeping previous HRIR"),
    }
}

impl PoolItem for BinauralSoundPath {
    fn reset(&mut self) {
        self.source = None;
        self.receiver = None;
        *self.marked_for_deletion.get_mut() = false;
        let default_vdl = self.config.default_vdl;
        self.dsp.get_mut().clear(default_vdl);
    }

    fn pre_release(&mut self) {
        self.source = None;
        self.receiver = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_itd_correction_sign() {
        // Source to the right (azimuth 90): left ear farther away
        let corr = itd_correction_seconds(0.02, 90.0, 343.0);
        assert!(corr > 0.0);
        // Source to the left (azimuth 270): sign flips
        let corr = itd_correction_seconds(0.02, 270.0, 343.0);
        assert!(corr < 0.0);
        // Frontal source: no correction
        let corr = itd_correction_seconds(0.02, 0.0, 343.0);
        assert!(corr.abs() < 1e-12);
    }

    #[test]
    fn test_path_marking() {
        let path = BinauralSoundPath::with_config(PathDspConfig::default());
        assert!(!path.is_marked_for_deletion());
        path.mark_for_deletion();
        assert!(path.is_marked_for_deletion());
    }
}
