//! Binaural free-field renderer
//!
//! One sound path per source-receiver pair: source directivity through the
//! third-octave bank, medium propagation through the per-ear delay lines,
//! HRIR through the per-ear convolvers. The flagship of the renderer family;
//! the other binaural variants share its path type and bookkeeping.

use std::sync::Arc;

use parking_lot::Mutex;

use aur_core::{
    AurError, AurResult, AuralizationMode, DEFAULT_AMPLITUDE_CALIBRATION_DB, DEFAULT_DISTANCE,
    DEFAULT_MINIMUM_DISTANCE, DEFAULT_SOUND_SPEED, Pool, SampleFrame, StreamInfo, Struct,
};
use aur_dsp::{FilterBankType, VdlAlgorithm};
use aur_scene::{SceneDiff, SceneRef};

use crate::{
    AudioRenderer, BinauralSoundPath, ControlSide, PathDspConfig, PathRenderContext,
    ReceiverDumper, RendererBase, RendererInitParams,
};

/// Runtime-adjustable rendering constants
#[derive(Debug, Clone)]
pub(crate) struct RenderSettings {
    pub additional_static_delay: f64,
    pub default_vdl: VdlAlgorithm,
    pub sound_speed: f64,
    pub minimum_distance: f64,
    pub default_distance: f64,
    pub calibration_db: f64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            additional_static_delay: 0.0,
            default_vdl: VdlAlgorithm::default(),
            sound_speed: DEFAULT_SOUND_SPEED,
            minimum_distance: DEFAULT_MINIMUM_DISTANCE,
            default_distance: DEFAULT_DISTANCE,
            calibration_db: DEFAULT_AMPLITUDE_CALIBRATION_DB,
        }
    }
}

/// Parse the config keys shared by the binaural renderer family
pub(crate) fn parse_path_config(
    params: &RendererInitParams,
) -> AurResult<(PathDspConfig, RenderSettings)> {
    let config = &params.config;

    let mut settings = RenderSettings::default();
    if let Some(delay) = config.opt_double("AdditionalStaticDelaySeconds")? {
        if delay < 0.0 {
            return Err(AurError::InvalidParameter(
                "key 'AdditionalStaticDelaySeconds': negative delay".into(),
            ));
        }
        settings.additional_static_delay = delay;
    }
    if let Some(name) = config.opt_string("SwitchingAlgorithm")? {
        settings.default_vdl = VdlAlgorithm::from_name(&name).ok_or_else(|| {
            AurError::InvalidParameter(format!("key 'SwitchingAlgorithm': unknown value '{name}'"))
        })?;
    }

    let mut path_config = PathDspConfig {
        props: params.props,
        default_vdl: settings.default_vdl,
        ..PathDspConfig::default()
    };
    if let Some(name) = config.opt_string("FilterBankType")? {
        let bank_type = FilterBankType::from_name(&name).ok_or_else(|| {
            AurError::InvalidParameter(format!("key 'FilterBankType': unknown value '{name}'"))
        })?;
        // Reject unavailable realizations up front instead of per path
        if matches!(
            bank_type,
            FilterBankType::IirBurgOrder4 | FilterBankType::IirBurgOrder10
        ) {
            return Err(AurError::NotImplemented(
                "Burg IIR filter bank realizations are not available".into(),
            ));
        }
        path_config.filter_bank_type = bank_type;
    }
    if let Some(len) = config.opt_int("HRIRFilterLength")? {
        if len < 1 {
            return Err(AurError::InvalidParameter(
                "key 'HRIRFilterLength': must be positive".into(),
            ));
        }
        path_config.hrir_filter_length = len as usize;
    }

    Ok((path_config, settings))
}

pub struct BinauralFreeFieldRenderer {
    base: RendererBase<BinauralSoundPath>,
    path_pool: Pool<BinauralSoundPath>,
    settings: Mutex<RenderSettings>,
    dumper: ReceiverDumper,
}

impl BinauralFreeFieldRenderer {
    pub fn new(params: &RendererInitParams) -> AurResult<Self> {
        let (path_config, settings) = parse_path_config(params)?;
        let base = RendererBase::new(params, 2)?;
        let pool_config = path_config.clone();

        Ok(Self {
            dumper: ReceiverDumper::new(params.props.sample_rate, 2, params.props.block_length),
            base,
            path_pool: Pool::new(4, 2, move || {
                BinauralSoundPath::with_config(pool_config.clone())
            }),
            settings: Mutex::new(settings),
        })
    }

    /// Translate a scene diff into path and entity changes
    fn manage_sound_paths(
        &self,
        control: &mut ControlSide<BinauralSoundPath>,
        diff: &SceneDiff,
    ) {
        // Paths whose endpoint disappears get marked; the audio thread drops
        // them when it drains the message
        let doomed: Vec<_> = control
            .paths
            .iter()
            .filter(|path| {
                let source_gone = path
                    .source()
                    .is_some_and(|s| diff.sources.deleted_ids.contains(&s.id()));
                let receiver_gone = path
                    .receiver()
                    .is_some_and(|r| diff.receivers.deleted_ids.contains(&r.id()));
                source_gone || receiver_gone
            })
            .cloned()
            .collect();
        for path in doomed {
            log::debug!(
                "{}: deleting sound path {:?} -> {:?}",
                self.base.name,
                path.source().map(|s| s.id()),
                path.receiver().map(|r| r.id())
            );
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

        // New sources pair with every receiver; new receivers with every
        // source that existed before (avoids double-pairing new x new)
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
        control: &mut ControlSide<BinauralSoundPath>,
        source_id: i32,
        receiver_id: i32,
    ) {
        let (Some(source), Some(receiver)) = (
            control.sources.get(&source_id).cloned(),
            control.receivers.get(&receiver_id).cloned(),
        ) else {
            return;
        };
        log::debug!(
            "{}: creating sound path from source {source_id} -> receiver {receiver_id}",
            self.base.name
        );
        let mut path = self.path_pool.request();
        path.init(source, receiver);
        self.base.add_path(control, path.fix());
    }
}

impl AudioRenderer for BinauralFreeFieldRenderer {
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
        2
    }

    fn set_parameters(&self, params: &Struct) -> AurResult<()> {
        if let Some(delay) = params.opt_double("AdditionalStaticDelaySeconds")? {
            if delay < 0.0 {
                return Err(AurError::InvalidParameter(
                    "key 'AdditionalStaticDelaySeconds': negative delay".into(),
                ));
            }
            self.settings.lock().additional_static_delay = delay;
        }
        if let Some(name) = params.opt_string("SwitchingAlgorithm")? {
            let algorithm = VdlAlgorithm::from_name(&name).ok_or_else(|| {
                AurError::InvalidParameter(format!(
                    "key 'SwitchingAlgorithm': unknown value '{name}'"
                ))
            })?;
            self.settings.lock().default_vdl = algorithm;
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
        let settings = self.settings.lock();
        let mut out = Struct::new();
        out.set(
            "AdditionalStaticDelaySeconds",
            settings.additional_static_delay,
        )
        .set("SwitchingAlgorithm", settings.default_vdl.name())
        .set(
            "AuralizationMode",
            self.base.global_aura().to_short_string(),
        )
        .set("numpaths", self.base.control.lock().paths.len() as i64);
        Ok(out)
    }
}
