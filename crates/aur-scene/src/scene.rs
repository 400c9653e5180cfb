//! Scene states: published snapshots and mutable drafts
//!
//! A `SceneState` is an immutable snapshot of the world, holding one
//! published container per entity class. A `SceneDraft` is the mutable child
//! derived from a snapshot; every mutation goes through clone-on-write, so
//! untouched containers and leaves stay shared with the base version.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use aur_core::{AurError, AurResult, Pool, PoolRef};

use crate::{
    ContainerDiff, ContainerDraft, ContainerState, MotionState, PortalState, SceneStateItem,
    SoundReceiverState, SoundSourceState, SurfaceState,
};

/// Shared reference to a published scene snapshot
pub type SceneRef = Arc<SceneState>;

/// Pools and id generators shared by all scene versions
pub struct ScenePools {
    pub motion: Pool<MotionState>,
    pub sources: Pool<SoundSourceState>,
    pub receivers: Pool<SoundReceiverState>,
    pub portals: Pool<PortalState>,
    pub surfaces: Pool<SurfaceState>,
    next_source_id: AtomicI32,
    next_receiver_id: AtomicI32,
    next_portal_id: AtomicI32,
    next_surface_id: AtomicI32,
}

impl ScenePools {
    /// Pools with the given initial quota per entity class
    pub fn new(initial_quota: usize) -> Arc<Self> {
        let grow = (initial_quota / 2).max(1);
        Arc::new(Self {
            motion: Pool::new(initial_quota, grow, MotionState::default),
            sources: Pool::new(initial_quota, grow, SoundSourceState::default),
            receivers: Pool::new(initial_quota, grow, SoundReceiverState::default),
            portals: Pool::new(initial_quota, grow, PortalState::default),
            surfaces: Pool::new(initial_quota, grow, SurfaceState::default),
            next_source_id: AtomicI32::new(1),
            next_receiver_id: AtomicI32::new(1),
            next_portal_id: AtomicI32::new(1),
            next_surface_id: AtomicI32::new(1),
        })
    }

    pub fn generate_source_id(&self) -> i32 {
        self.next_source_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn generate_receiver_id(&self) -> i32 {
        self.next_receiver_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn generate_portal_id(&self) -> i32 {
        self.next_portal_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn generate_surface_id(&self) -> i32 {
        self.next_surface_id.fetch_add(1, Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PUBLISHED SCENE STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Difference between two scene snapshots, per entity class
#[derive(Debug, Clone, Default)]
pub struct SceneDiff {
    pub sources: ContainerDiff,
    pub receivers: ContainerDiff,
    pub portals: ContainerDiff,
    pub surfaces: ContainerDiff,
}

/// Immutable scene snapshot
#[derive(Debug)]
pub struct SceneState {
    id: i32,
    modification_time: f64,
    sources: Arc<ContainerState<SoundSourceState>>,
    receivers: Arc<ContainerState<SoundReceiverState>>,
    portals: Arc<ContainerState<PortalState>>,
    surfaces: Arc<ContainerState<SurfaceState>>,
}

impl SceneState {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn modification_time(&self) -> f64 {
        self.modification_time
    }

    pub fn sound_source_ids(&self) -> Vec<i32> {
        self.sources.ids()
    }

    pub fn sound_receiver_ids(&self) -> Vec<i32> {
        self.receivers.ids()
    }

    pub fn portal_ids(&self) -> Vec<i32> {
        self.portals.ids()
    }

    pub fn surface_ids(&self) -> Vec<i32> {
        self.surfaces.ids()
    }

    pub fn num_sound_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn num_sound_receivers(&self) -> usize {
        self.receivers.len()
    }

    pub fn sound_source_state(&self, id: i32) -> Option<&PoolRef<SoundSourceState>> {
        self.sources.get(id)
    }

    pub fn sound_receiver_state(&self, id: i32) -> Option<&PoolRef<SoundReceiverState>> {
        self.receivers.get(id)
    }

    pub fn portal_state(&self, id: i32) -> Option<&PoolRef<PortalState>> {
        self.portals.get(id)
    }

    pub fn surface_state(&self, id: i32) -> Option<&PoolRef<SurfaceState>> {
        self.surfaces.get(id)
    }

    /// Container handles, exposed for pointer-equality based sharing checks
    pub fn sources_container(&self) -> &Arc<ContainerState<SoundSourceState>> {
        &self.sources
    }

    pub fn receivers_container(&self) -> &Arc<ContainerState<SoundReceiverState>> {
        &self.receivers
    }

    pub fn portals_container(&self) -> &Arc<ContainerState<PortalState>> {
        &self.portals
    }

    pub fn surfaces_container(&self) -> &Arc<ContainerState<SurfaceState>> {
        &self.surfaces
    }

    /// Diff this (newer) snapshot against an older one
    ///
    /// Pointer-equal containers mean "no change": the ids land in `common`
    /// without walking the entries pairwise.
    pub fn diff(&self, older: Option<&SceneState>) -> SceneDiff {
        fn diff_one<T: SceneStateItem>(
            newer: &Arc<ContainerState<T>>,
            older: Option<&Arc<ContainerState<T>>>,
        ) -> ContainerDiff {
            match older {
                Some(older) if Arc::ptr_eq(newer, older) => ContainerDiff {
                    common_ids: newer.ids(),
                    ..ContainerDiff::default()
                },
                Some(older) => newer.diff(Some(older)),
                None => newer.diff(None),
            }
        }

        SceneDiff {
            sources: diff_one(&self.sources, older.map(|s| &s.sources)),
            receivers: diff_one(&self.receivers, older.map(|s| &s.receivers)),
            portals: diff_one(&self.portals, older.map(|s| &s.portals)),
            surfaces: diff_one(&self.surfaces, older.map(|s| &s.surfaces)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SCENE DRAFT
// ═══════════════════════════════════════════════════════════════════════════

/// Container slot of a draft: shared until first write
#[derive(Debug)]
enum ContainerSlot<T: SceneStateItem> {
    Shared(Arc<ContainerState<T>>),
    Working(ContainerDraft<T>),
}

impl<T: SceneStateItem> ContainerSlot<T> {
    fn working(&mut self, modification_time: f64) -> &mut ContainerDraft<T> {
        if let ContainerSlot::Shared(shared) = self {
            *self = ContainerSlot::Working(ContainerDraft::from_shared(shared, modification_time));
        }
        match self {
            ContainerSlot::Working(draft) => draft,
            ContainerSlot::Shared(_) => unreachable!("slot was just made working"),
        }
    }

    fn has(&self, id: i32) -> bool {
        match self {
            ContainerSlot::Shared(c) => c.has(id),
            ContainerSlot::Working(d) => d.has(id),
        }
    }

    fn fix(self) -> Arc<ContainerState<T>> {
        match self {
            ContainerSlot::Shared(c) => c,
            ContainerSlot::Working(d) => d.fix(),
        }
    }
}

/// Mutable scene version under construction
pub struct SceneDraft {
    id: i32,
    modification_time: f64,
    pools: Arc<ScenePools>,
    sources: ContainerSlot<SoundSourceState>,
    receivers: ContainerSlot<SoundReceiverState>,
    portals: ContainerSlot<PortalState>,
    surfaces: ContainerSlot<SurfaceState>,
}

impl SceneDraft {
    /// Fresh empty scene version
    pub(crate) fn empty(id: i32, modification_time: f64, pools: Arc<ScenePools>) -> Self {
        Self {
            id,
            modification_time,
            pools,
            sources: ContainerSlot::Working(ContainerDraft::empty(modification_time)),
            receivers: ContainerSlot::Working(ContainerDraft::empty(modification_time)),
            portals: ContainerSlot::Working(ContainerDraft::empty(modification_time)),
            surfaces: ContainerSlot::Working(ContainerDraft::empty(modification_time)),
        }
    }

    /// Derive from a published base, sharing all containers
    pub(crate) fn derived(
        id: i32,
        modification_time: f64,
        pools: Arc<ScenePools>,
        base: &SceneState,
    ) -> Self {
        Self {
            id,
            modification_time,
            pools,
            sources: ContainerSlot::Shared(Arc::clone(&base.sources)),
            receivers: ContainerSlot::Shared(Arc::clone(&base.receivers)),
            portals: ContainerSlot::Shared(Arc::clone(&base.portals)),
            surfaces: ContainerSlot::Shared(Arc::clone(&base.surfaces)),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn modification_time(&self) -> f64 {
        self.modification_time
    }

    // --- sound sources ---

    pub fn add_sound_source(&mut self) -> i32 {
        let id = self.pools.generate_source_id();
        let pool = self.pools.sources.clone();
        self.sources.working(self.modification_time).add(id, &pool);
        id
    }

    pub fn remove_sound_source(&mut self, id: i32) -> AurResult<()> {
        if !self.sources.has(id) {
            return Err(AurError::InvalidParameter(format!(
                "invalid sound source id {id}"
            )));
        }
        self.sources.working(self.modification_time).remove(id);
        Ok(())
    }

    pub fn alter_sound_source(&mut self, id: i32) -> AurResult<&mut SoundSourceState> {
        let pool = self.pools.sources.clone();
        self.sources
            .working(self.modification_time)
            .alter(id, &pool)
            .ok_or_else(|| AurError::InvalidParameter(format!("invalid sound source id {id}")))
    }

    /// Clone-on-write access to a source's motion state
    pub fn alter_sound_source_motion(&mut self, id: i32) -> AurResult<&mut MotionState> {
        let motion_pool = self.pools.motion.clone();
        let mtime = self.modification_time;
        let state = self.alter_sound_source(id)?;
        Ok(state.alter_motion(&motion_pool, mtime))
    }

    // --- sound receivers ---

    pub fn add_sound_receiver(&mut self) -> i32 {
        let id = self.pools.generate_receiver_id();
        let pool = self.pools.receivers.clone();
        self.receivers
            .working(self.modification_time)
            .add(id, &pool);
        id
    }

    pub fn remove_sound_receiver(&mut self, id: i32) -> AurResult<()> {
        if !self.receivers.has(id) {
            return Err(AurError::InvalidParameter(format!(
                "invalid sound receiver id {id}"
            )));
        }
        self.receivers.working(self.modification_time).remove(id);
        Ok(())
    }

    pub fn alter_sound_receiver(&mut self, id: i32) -> AurResult<&mut SoundReceiverState> {
        let pool = self.pools.receivers.clone();
        self.receivers
            .working(self.modification_time)
            .alter(id, &pool)
            .ok_or_else(|| AurError::InvalidParameter(format!("invalid sound receiver id {id}")))
    }

    pub fn alter_sound_receiver_motion(&mut self, id: i32) -> AurResult<&mut MotionState> {
        let motion_pool = self.pools.motion.clone();
        let mtime = self.modification_time;
        let state = self.alter_sound_receiver(id)?;
        Ok(state.alter_motion(&motion_pool, mtime))
    }

    // --- portals ---

    pub fn add_portal(&mut self) -> i32 {
        let id = self.pools.generate_portal_id();
        let pool = self.pools.portals.clone();
        self.portals.working(self.modification_time).add(id, &pool);
        id
    }

    pub fn remove_portal(&mut self, id: i32) -> AurResult<()> {
        if !self.portals.has(id) {
            return Err(AurError::InvalidParameter(format!("invalid portal id {id}")));
        }
        self.portals.working(self.modification_time).remove(id);
        Ok(())
    }

    pub fn alter_portal(&mut self, id: i32) -> AurResult<&mut PortalState> {
        let pool = self.pools.portals.clone();
        self.portals
            .working(self.modification_time)
            .alter(id, &pool)
            .ok_or_else(|| AurError::InvalidParameter(format!("invalid portal id {id}")))
    }

    // --- surfaces ---

    pub fn add_surface(&mut self) -> i32 {
        let id = self.pools.generate_surface_id();
        let pool = self.pools.surfaces.clone();
        self.surfaces.working(self.modification_time).add(id, &pool);
        id
    }

    pub fn remove_surface(&mut self, id: i32) -> AurResult<()> {
        if !self.surfaces.has(id) {
            return Err(AurError::InvalidParameter(format!(
                "invalid surface id {id}"
            )));
        }
        self.surfaces.working(self.modification_time).remove(id);
        Ok(())
    }

    pub fn alter_surface(&mut self, id: i32) -> AurResult<&mut SurfaceState> {
        let pool = self.pools.surfaces.clone();
        self.surfaces
            .working(self.modification_time)
            .alter(id, &pool)
            .ok_or_else(|| AurError::InvalidParameter(format!("invalid surface id {id}")))
    }

    /// Recursively fix all containers and leaves and seal the snapshot
    pub(crate) fn fix(self) -> SceneRef {
        Arc::new(SceneState {
            id: self.id,
            modification_time: self.modification_time,
            sources: self.sources.fix(),
            receivers: self.receivers.fix(),
            portals: self.portals.fix(),
            surfaces: self.surfaces.fix(),
        })
    }
}
