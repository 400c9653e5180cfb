//! Prototype image-source renderer
//!
//! Synthesizes each path's impulse response from a shoebox room using the
//! classical mirror-image algorithm: six wall reflection coefficients, a
//! maximum reflection order, and the pair's positions from the scene. The
//! synthesized responses feed the same externally-driven paths as the
//! generic-path renderer.

use std::sync::Arc;

use parking_lot::Mutex;

use aur_core::{
    AurError, AurResult, AuralizationMode, DEFAULT_SOUND_SPEED, Pool, Sample, SampleFrame,
    StreamInfo, Struct, Vec3,
};
use aur_scene::{SceneDiff, SceneRef};

use crate::{AudioRenderer, ControlSide, GenericSoundPath, RendererBase, RendererInitParams};

/// Shoebox room description
#[derive(Debug, Clone)]
pub struct ShoeboxRoom {
    /// Extent along x in meters
    pub length: f64,
    /// Extent along z in meters
    pub width: f64,
    /// Extent along y (up) in meters
    pub height: f64,
    /// Reflection coefficients: x1/x2 walls, y1 floor, y2 ceiling, z1/z2 walls
    pub beta: [f64; 6],
    pub max_order: usize,
    /// Include the direct-sound dirac
    pub direct_sound: bool,
}

impl Default for ShoeboxRoom {
    fn default() -> Self {
        Self {
            length: 10.0,
            width: 8.0,
            height: 3.0,
            beta: [0.8; 6],
            max_order: 10,
            direct_sound: true,
        }
    }
}

impl ShoeboxRoom {
    fn parse_into(&mut self, config: &Struct) -> AurResult<()> {
        if let Some(v) = config.opt_double("RoomLength")? {
            self.length = v;
        }
        if let Some(v) = config.opt_double("RoomWidth")? {
            self.width = v;
        }
        if let Some(v) = config.opt_double("RoomHeight")? {
            self.height = v;
        }
        if let Some(v) = config.opt_int("MaxOrder")? {
            self.max_order = v.max(0) as usize;
        }
        if let Some(v) = config.opt_bool("DirectSound")? {
            self.direct_sound = v;
        }
        let beta_keys = ["Betax1", "Betax2", "Betay1", "Betay2", "Betaz1", "Betaz2"];
        for (slot, key) in self.beta.iter_mut().zip(beta_keys) {
            if let Some(v) = config.opt_double(key)? {
                if !(0.0..=1.0).contains(&v) {
                    return Err(AurError::InvalidParameter(format!(
                        "key '{key}': reflection coefficient must be in [0, 1]"
                    )));
                }
                *slot = v;
            }
        }
        if self.length <= 0.0 || self.width <= 0.0 || self.height <= 0.0 {
            return Err(AurError::InvalidParameter(
                "room dimensions must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Mirror-image impulse response from `source` to `receiver`
    pub fn impulse_response(
        &self,
        source: Vec3,
        receiver: Vec3,
        sample_rate: f64,
        max_length: usize,
    ) -> Vec<Sample> {
        let mut ir = vec![0.0; max_length];
        let n_max = self.max_order as i64;

        for nx in -n_max..=n_max {
            for qx in 0..2i64 {
                let refl_x = (nx - qx).unsigned_abs() as u32 + nx.unsigned_abs() as u32;
                if refl_x as usize > self.max_order {
                    continue;
                }
                let img_x = (1 - 2 * qx) as f64 * source.x + 2.0 * nx as f64 * self.length;
                let amp_x = self.beta[0].powi((nx - qx).unsigned_abs() as i32)
                    * self.beta[1].powi(nx.unsigned_abs() as i32);

                for ny in -n_max..=n_max {
                    for qy in 0..2i64 {
                        let refl_y = (ny - qy).unsigned_abs() as u32 + ny.unsigned_abs() as u32;
                        if (refl_x + refl_y) as usize > self.max_order {
                            continue;
                        }
                        let img_y =
                            (1 - 2 * qy) as f64 * source.y + 2.0 * ny as f64 * self.height;
                        let amp_y = self.beta[2].powi((ny - qy).unsigned_abs() as i32)
                            * self.beta[3].powi(ny.unsigned_abs() as i32);

                        for nz in -n_max..=n_max {
                            for qz in 0..2i64 {
                                let refl_z =
                                    (nz - qz).unsigned_abs() as u32 + nz.unsigned_abs() as u32;
                                let order = (refl_x + refl_y + refl_z) as usize;
                                if order > self.max_order {
                                    continue;
                                }
                                if order == 0 && !self.direct_sound {
                                    continue;
                                }
                                let img_z =
                                    (1 - 2 * qz) as f64 * source.z + 2.0 * nz as f64 * self.width;
                                let amp_z = self.beta[4].powi((nz - qz).unsigned_abs() as i32)
                                    * self.beta[5].powi(nz.unsigned_abs() as i32);

                                let image = Vec3::new(img_x, img_y, img_z);
                                let distance = image.distance_to(&receiver).max(0.1);
                                let delay_samples =
                                    (distance / DEFAULT_SOUND_SPEED * sample_rate).round() as usize;
                                if delay_samples >= max_length {
                                    continue;
                                }
                                let amplitude = amp_x * amp_y * amp_z / distance;
                                ir[delay_samples] += amplitude as Sample;
                            }
                        }
                    }
                }
            }
        }
        ir
    }
}

/// Renderer feeding mirror-image responses into generic paths
pub struct ImageSourceRenderer {
    base: RendererBase<GenericSoundPath>,
    path_pool: Pool<GenericSoundPath>,
    room: Mutex<ShoeboxRoom>,
    num_channels: usize,
    max_ir_length: usize,
    calibration_db: f64,
}

impl ImageSourceRenderer {
    pub fn new(params: &RendererInitParams) -> AurResult<Self> {
        let mut room = ShoeboxRoom::default();
        room.parse_into(&params.config)?;

        let num_channels = params.config.opt_int("NumChannels")?.unwrap_or(2).max(1) as usize;
        let max_ir_length = params
            .config
            .opt_int("MaxFilterLengthSamples")?
            .unwrap_or((params.props.sample_rate * 2.0) as i64)
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
            room: Mutex::new(room),
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

    /// Recompute and stage the response of every path from scene positions
    fn update_impulse_responses(&self, control: &ControlSide<GenericSoundPath>, scene: &SceneRef) {
        let room = self.room.lock().clone();
        for path in &control.paths {
            let (Some(source), Some(receiver)) = (path.source(), path.receiver()) else {
                continue;
            };
            let source_pos = scene
                .sound_source_state(source.id())
                .and_then(|s| s.motion().map(|m| m.position()));
            let receiver_pos = scene
                .sound_receiver_state(receiver.id())
                .and_then(|r| r.motion().map(|m| m.position()));
            let (Some(source_pos), Some(receiver_pos)) = (source_pos, receiver_pos) else {
                continue;
            };

            let ir = room.impulse_response(
                source_pos,
                receiver_pos,
                self.base.props.sample_rate,
                self.max_ir_length,
            );
            for ch in 0..self.num_channels {
                path.stage_ir(ch, ir.clone());
            }
        }
    }
}

impl AudioRenderer for ImageSourceRenderer {
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
        self.update_impulse_responses(&control, &new_scene);
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

    fn set_parameters(&self, params: &Struct) -> AurResult<()> {
        {
            let mut room = self.room.lock();
            room.parse_into(params)?;
        }
        // Room changes retroactively apply to every live path
        let control = self.base.control.lock();
        if let Some(scene) = control.cur_scene.clone() {
            self.update_impulse_responses(&control, &scene);
        }
        Ok(())
    }

    fn get_parameters(&self, _query: &Struct) -> AurResult<Struct> {
        let room = self.room.lock();
        let mut out = Struct::new();
        out.set("RoomLength", room.length)
            .set("RoomWidth", room.width)
            .set("RoomHeight", room.height)
            .set("MaxOrder", room.max_order as i64)
            .set("DirectSound", room.direct_sound);
        let beta_keys = ["Betax1", "Betax2", "Betay1", "Betay2", "Betaz1", "Betaz2"];
        for (value, key) in room.beta.iter().zip(beta_keys) {
            out.set(key, *value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_sound_dirac_position() {
        let room = ShoeboxRoom {
            beta: [0.0; 6], // only the direct path survives
            ..Default::default()
        };
        let source = Vec3::new(2.0, 1.5, 2.0);
        let receiver = Vec3::new(5.43, 1.5, 2.0);
        let ir = room.impulse_response(source, receiver, 44100.0, 8192);

        let expected = (3.43 / DEFAULT_SOUND_SPEED * 44100.0).round() as usize;
        assert!(ir[expected] > 0.0);
        let hits = ir.iter().filter(|&&s| s != 0.0).count();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_direct_sound_can_be_disabled() {
        let room = ShoeboxRoom {
            beta: [0.0; 6],
            direct_sound: false,
            ..Default::default()
        };
        let ir = room.impulse_response(
            Vec3::new(2.0, 1.5, 2.0),
            Vec3::new(4.0, 1.5, 2.0),
            44100.0,
            4096,
        );
        assert!(ir.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_reflections_appear_with_order() {
        let room = ShoeboxRoom {
            length: 4.0,
            width: 4.0,
            height: 3.0,
            beta: [0.9; 6],
            max_order: 2,
            direct_sound: true,
        };
        let ir = room.impulse_response(
            Vec3::new(1.0, 1.5, 1.0),
            Vec3::new(3.0, 1.5, 3.0),
            44100.0,
            16384,
        );
        let hits = ir.iter().filter(|&&s| s != 0.0).count();
        // Direct path plus a healthy number of low-order reflections
        assert!(hits > 5, "only {hits} taps");
    }

    #[test]
    fn test_invalid_beta_rejected() {
        let mut room = ShoeboxRoom::default();
        let mut config = Struct::new();
        config.set("Betax1", 1.5);
        assert!(room.parse_into(&config).is_err());
    }
}
