//! Scene entity states
//!
//! All leaf states share the pooled lifecycle: requested from a pool, mutable
//! while part of an unfixed scene version, immutable once the version is
//! published. Cloning for copy-on-write copies the payload and inherits the
//! modification time of the enclosing scene version.

use aur_core::{
    AuralizationMode, DEFAULT_SOUND_POWER_W, DirectivityHandle, Pool, PoolBox, PoolItem, PoolRef,
    Pose, Quat, Struct, Vec3,
};

/// Common behavior of pooled scene states
pub trait SceneStateItem: PoolItem {
    /// Copy payload from a fixed state, stamping the new modification time
    fn copy_from(&mut self, source: &Self, modification_time: f64);

    /// Initialize a freshly requested state
    fn initialize(&mut self, modification_time: f64);

    fn modification_time(&self) -> f64;

    /// Recursively fix child states before the state itself is fixed
    fn fix_children(&mut self) {}
}

// ═══════════════════════════════════════════════════════════════════════════
// MOTION STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Pose snapshot of a movable entity
///
/// View and up are kept unit length and mutually orthogonal by the setters.
#[derive(Debug, Clone)]
pub struct MotionState {
    position: Vec3,
    view: Vec3,
    up: Vec3,
    /// Head rotation relative to the torso, where the dataset supports it
    head_above_torso: Option<Quat>,
    /// Physical pose when it differs from the virtual pose (loudspeaker setups)
    real_world_pose: Option<Pose>,
    modification_time: f64,
}

impl Default for MotionState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            view: Vec3::new(0.0, 0.0, -1.0),
            up: Vec3::new(0.0, 1.0, 0.0),
            head_above_torso: None,
            real_world_pose: None,
            modification_time: 0.0,
        }
    }
}

impl MotionState {
    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn view(&self) -> Vec3 {
        self.view
    }

    pub fn up(&self) -> Vec3 {
        self.up
    }

    pub fn orientation(&self) -> Quat {
        Quat::from_view_up(self.view, self.up)
    }

    pub fn pose(&self) -> Pose {
        Pose::new(self.position, self.orientation())
    }

    pub fn head_above_torso(&self) -> Option<Quat> {
        self.head_above_torso
    }

    pub fn real_world_pose(&self) -> Option<Pose> {
        self.real_world_pose
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    /// Set the view/up frame; both are renormalized, up is re-orthogonalized
    pub fn set_orientation_vu(&mut self, view: Vec3, up: Vec3) {
        let v = view.normalized();
        let mut u = up.normalized();
        let proj = v * u.dot(&v);
        u = (u - proj).normalized();
        self.view = v;
        self.up = u;
    }

    pub fn set_orientation(&mut self, orientation: Quat) {
        let (view, up) = orientation.to_view_up();
        self.view = view;
        self.up = up;
    }

    pub fn set_head_above_torso(&mut self, hato: Option<Quat>) {
        self.head_above_torso = hato;
    }

    pub fn set_real_world_pose(&mut self, pose: Option<Pose>) {
        self.real_world_pose = pose;
    }
}

impl PoolItem for MotionState {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl SceneStateItem for MotionState {
    fn copy_from(&mut self, source: &Self, modification_time: f64) {
        *self = source.clone();
        self.modification_time = modification_time;
    }

    fn initialize(&mut self, modification_time: f64) {
        *self = Self::default();
        self.modification_time = modification_time;
    }

    fn modification_time(&self) -> f64 {
        self.modification_time
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MOTION SLOT (copy-on-write child)
// ═══════════════════════════════════════════════════════════════════════════

/// Copy-on-write slot for the motion child of a source or receiver
#[derive(Debug, Default)]
pub enum MotionSlot {
    #[default]
    None,
    Fixed(PoolRef<MotionState>),
    Working(PoolBox<MotionState>),
}

impl MotionSlot {
    pub fn get(&self) -> Option<&MotionState> {
        match self {
            MotionSlot::None => None,
            MotionSlot::Fixed(r) => Some(r),
            MotionSlot::Working(b) => Some(b),
        }
    }

    /// Shared reference for pointer-identity change detection; None while the
    /// state is unfixed or absent
    pub fn fixed_ref(&self) -> Option<&PoolRef<MotionState>> {
        match self {
            MotionSlot::Fixed(r) => Some(r),
            _ => None,
        }
    }

    /// Make the slot writable, cloning a shared state on first write
    fn make_working(&mut self, pool: &Pool<MotionState>, modification_time: f64) -> &mut MotionState {
        let slot = std::mem::take(self);
        *self = match slot {
            MotionSlot::None => {
                let mut b = pool.request();
                b.initialize(modification_time);
                MotionSlot::Working(b)
            }
            MotionSlot::Fixed(r) => {
                let mut b = pool.request();
                b.copy_from(&r, modification_time);
                MotionSlot::Working(b)
            }
            MotionSlot::Working(b) => MotionSlot::Working(b),
        };
        match self {
            MotionSlot::Working(b) => b,
            _ => unreachable!("slot was just made working"),
        }
    }

    fn fix_in_place(&mut self) {
        if matches!(self, MotionSlot::Working(_)) {
            if let MotionSlot::Working(b) = std::mem::take(self) {
                *self = MotionSlot::Fixed(b.fix());
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SOUND SOURCE STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Scene state of one sound source
#[derive(Default)]
pub struct SoundSourceState {
    motion: MotionSlot,
    sound_power_watts: f64,
    auralization_mode: AuralizationMode,
    directivity_id: i32,
    directivity: Option<DirectivityHandle>,
    parameters: Struct,
    muted: bool,
    modification_time: f64,
}

impl std::fmt::Debug for SoundSourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundSourceState")
            .field("motion", &self.motion)
            .field("sound_power_watts", &self.sound_power_watts)
            .field("auralization_mode", &self.auralization_mode)
            .field("directivity_id", &self.directivity_id)
            .field("directivity", &self.directivity.is_some())
            .field("parameters", &self.parameters)
            .field("muted", &self.muted)
            .field("modification_time", &self.modification_time)
            .finish()
    }
}

impl SoundSourceState {
    pub fn motion(&self) -> Option<&MotionState> {
        self.motion.get()
    }

    pub fn motion_ref(&self) -> Option<&PoolRef<MotionState>> {
        self.motion.fixed_ref()
    }

    /// Clone-on-write access to the motion child
    pub fn alter_motion(
        &mut self,
        pool: &Pool<MotionState>,
        modification_time: f64,
    ) -> &mut MotionState {
        self.motion.make_working(pool, modification_time)
    }

    /// Sound power in watts (default 1 pW)
    pub fn sound_power(&self) -> f64 {
        self.sound_power_watts
    }

    pub fn set_sound_power(&mut self, watts: f64) {
        self.sound_power_watts = watts;
    }

    /// Linear amplitude factor relative to the calibration level
    ///
    /// 1 pW corresponds to 94 dB SPL at 1 m; the factor scales with the
    /// square root of the power ratio.
    pub fn volume(&self, calibration_db: f64) -> f64 {
        let db_gain = calibration_db - aur_core::DEFAULT_AMPLITUDE_CALIBRATION_DB;
        (self.sound_power_watts / DEFAULT_SOUND_POWER_W).sqrt() * 10f64.powf(-db_gain / 20.0)
    }

    pub fn auralization_mode(&self) -> AuralizationMode {
        self.auralization_mode
    }

    pub fn set_auralization_mode(&mut self, mode: AuralizationMode) {
        self.auralization_mode = mode;
    }

    pub fn directivity_id(&self) -> i32 {
        self.directivity_id
    }

    pub fn directivity(&self) -> Option<&DirectivityHandle> {
        self.directivity.as_ref()
    }

    pub fn set_directivity(&mut self, id: i32, handle: Option<DirectivityHandle>) {
        self.directivity_id = id;
        self.directivity = handle;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn parameters(&self) -> &Struct {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut Struct {
        &mut self.parameters
    }
}

impl PoolItem for SoundSourceState {
    fn reset(&mut self) {
        *self = Self::default();
        self.sound_power_watts = DEFAULT_SOUND_POWER_W;
        self.directivity_id = -1;
    }

    fn pre_release(&mut self) {
        self.motion = MotionSlot::None;
        self.directivity = None;
    }
}

impl SceneStateItem for SoundSourceState {
    fn copy_from(&mut self, source: &Self, modification_time: f64) {
        self.motion = match &source.motion {
            MotionSlot::Fixed(r) => MotionSlot::Fixed(r.clone()),
            // Copy sources are always fixed states
            _ => MotionSlot::None,
        };
        self.sound_power_watts = source.sound_power_watts;
        self.auralization_mode = source.auralization_mode;
        self.directivity_id = source.directivity_id;
        self.directivity = source.directivity.clone();
        self.parameters = source.parameters.clone();
        self.muted = source.muted;
        self.modification_time = modification_time;
    }

    fn initialize(&mut self, modification_time: f64) {
        self.reset();
        self.modification_time = modification_time;
    }

    fn modification_time(&self) -> f64 {
        self.modification_time
    }

    fn fix_children(&mut self) {
        self.motion.fix_in_place();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SOUND RECEIVER STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Head geometry used to individualize ITD and HRIR selection, meters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnthropometricData {
    pub head_width: f64,
    pub head_height: f64,
    pub head_depth: f64,
}

impl Default for AnthropometricData {
    fn default() -> Self {
        Self {
            head_width: 0.12,
            head_height: 0.10,
            head_depth: 0.15,
        }
    }
}

impl AnthropometricData {
    /// Deviation of this head width from the default, meters
    pub fn head_width_delta(&self) -> f64 {
        self.head_width - Self::default().head_width
    }
}

/// Scene state of one sound receiver
#[derive(Default)]
pub struct SoundReceiverState {
    motion: MotionSlot,
    auralization_mode: AuralizationMode,
    directivity_id: i32,
    directivity: Option<DirectivityHandle>,
    anthropometrics: AnthropometricData,
    parameters: Struct,
    muted: bool,
    modification_time: f64,
}

impl std::fmt::Debug for SoundReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundReceiverState")
            .field("motion", &self.motion)
            .field("auralization_mode", &self.auralization_mode)
            .field("directivity_id", &self.directivity_id)
            .field("directivity", &self.directivity.is_some())
            .field("anthropometrics", &self.anthropometrics)
            .field("parameters", &self.parameters)
            .field("muted", &self.muted)
            .field("modification_time", &self.modification_time)
            .finish()
    }
}

impl SoundReceiverState {
    pub fn motion(&self) -> Option<&MotionState> {
        self.motion.get()
    }

    pub fn motion_ref(&self) -> Option<&PoolRef<MotionState>> {
        self.motion.fixed_ref()
    }

    pub fn alter_motion(
        &mut self,
        pool: &Pool<MotionState>,
        modification_time: f64,
    ) -> &mut MotionState {
        self.motion.make_working(pool, modification_time)
    }

    pub fn auralization_mode(&self) -> AuralizationMode {
        self.auralization_mode
    }

    pub fn set_auralization_mode(&mut self, mode: AuralizationMode) {
        self.auralization_mode = mode;
    }

    pub fn directivity_id(&self) -> i32 {
        self.directivity_id
    }

    /// HRIR dataset of this receiver
    pub fn directivity(&self) -> Option<&DirectivityHandle> {
        self.directivity.as_ref()
    }

    pub fn set_directivity(&mut self, id: i32, handle: Option<DirectivityHandle>) {
        self.directivity_id = id;
        self.directivity = handle;
    }

    pub fn anthropometrics(&self) -> &AnthropometricData {
        &self.anthropometrics
    }

    pub fn set_anthropometrics(&mut self, data: AnthropometricData) {
        self.anthropometrics = data;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn parameters(&self) -> &Struct {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut Struct {
        &mut self.parameters
    }
}

impl PoolItem for SoundReceiverState {
    fn reset(&mut self) {
        *self = Self::default();
        self.directivity_id = -1;
    }

    fn pre_release(&mut self) {
        self.motion = MotionSlot::None;
        self.directivity = None;
    }
}

impl SceneStateItem for SoundReceiverState {
    fn copy_from(&mut self, source: &Self, modification_time: f64) {
        self.motion = match &source.motion {
            MotionSlot::Fixed(r) => MotionSlot::Fixed(r.clone()),
            _ => MotionSlot::None,
        };
        self.auralization_mode = source.auralization_mode;
        self.directivity_id = source.directivity_id;
        self.directivity = source.directivity.clone();
        self.anthropometrics = source.anthropometrics;
        self.parameters = source.parameters.clone();
        self.muted = source.muted;
        self.modification_time = modification_time;
    }

    fn initialize(&mut self, modification_time: f64) {
        self.reset();
        self.modification_time = modification_time;
    }

    fn modification_time(&self) -> f64 {
        self.modification_time
    }

    fn fix_children(&mut self) {
        self.motion.fix_in_place();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PORTAL AND SURFACE STATES
// ═══════════════════════════════════════════════════════════════════════════

/// Scene state of a portal (door/window style opening)
#[derive(Debug, Default)]
pub struct PortalState {
    /// Open fraction in [0, 1]
    open_state: f64,
    modification_time: f64,
}

impl PortalState {
    pub fn open_state(&self) -> f64 {
        self.open_state
    }

    pub fn set_open_state(&mut self, state: f64) {
        self.open_state = state.clamp(0.0, 1.0);
    }
}

impl PoolItem for PortalState {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl SceneStateItem for PortalState {
    fn copy_from(&mut self, source: &Self, modification_time: f64) {
        self.open_state = source.open_state;
        self.modification_time = modification_time;
    }

    fn initialize(&mut self, modification_time: f64) {
        *self = Self::default();
        self.modification_time = modification_time;
    }

    fn modification_time(&self) -> f64 {
        self.modification_time
    }
}

/// Scene state of an acoustic surface
#[derive(Debug, Default)]
pub struct SurfaceState {
    material_id: i32,
    modification_time: f64,
}

impl SurfaceState {
    pub fn material_id(&self) -> i32 {
        self.material_id
    }

    pub fn set_material_id(&mut self, id: i32) {
        self.material_id = id;
    }
}

impl PoolItem for SurfaceState {
    fn reset(&mut self) {
        *self = Self::default();
        self.material_id = -1;
    }
}

impl SceneStateItem for SurfaceState {
    fn copy_from(&mut self, source: &Self, modification_time: f64) {
        self.material_id = source.material_id;
        self.modification_time = modification_time;
    }

    fn initialize(&mut self, modification_time: f64) {
        self.reset();
        self.modification_time = modification_time;
    }

    fn modification_time(&self) -> f64 {
        self.modification_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_defaults() {
        let m = MotionState::default();
        assert_eq!(m.view(), Vec3::new(0.0, 0.0, -1.0));
        assert_eq!(m.up(), Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_orientation_reorthogonalized() {
        let mut m = MotionState::default();
        // Deliberately skewed up vector
        m.set_orientation_vu(Vec3::new(0.0, 0.0, -2.0), Vec3::new(0.1, 1.0, -0.3));
        assert!(m.view().dot(&m.up()).abs() < 1e-9);
        assert!((m.view().length() - 1.0).abs() < 1e-9);
        assert!((m.up().length() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_source_volume_calibration() {
        let mut s = SoundSourceState::default();
        s.reset();
        // Default power at default calibration is unit gain
        assert!((s.volume(aur_core::DEFAULT_AMPLITUDE_CALIBRATION_DB) - 1.0).abs() < 1e-12);

        // 100x the power is 20 dB, i.e. 10x the amplitude
        s.set_sound_power(DEFAULT_SOUND_POWER_W * 100.0);
        assert!((s.volume(aur_core::DEFAULT_AMPLITUDE_CALIBRATION_DB) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_motion_cow_shares_until_altered() {
        let pool: Pool<MotionState> = Pool::new(4, 2, MotionState::default);

        let mut src = SoundSourceState::default();
        src.initialize(1.0);
        src.alter_motion(&pool, 1.0).set_position(Vec3::new(1.0, 0.0, 0.0));
        src.fix_children();
        let first = src.motion_ref().unwrap().clone();

        // Copy shares the fixed motion state
        let mut derived = SoundSourceState::default();
        derived.copy_from(&src, 2.0);
        assert!(PoolRef::ptr_eq(derived.motion_ref().unwrap(), &first));

        // Altering clones it
        derived
            .alter_motion(&pool, 2.0)
            .set_position(Vec3::new(2.0, 0.0, 0.0));
        derived.fix_children();
        assert!(!PoolRef::ptr_eq(derived.motion_ref().unwrap(), &first));
        assert_eq!(first.position(), Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(
            derived.motion().unwrap().position(),
            Vec3::new(2.0, 0.0, 0.0)
        );
    }
}
