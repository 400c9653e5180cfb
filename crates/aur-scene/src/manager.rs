//! Scene manager: version chain bookkeeping and publication
//!
//! One manager serializes scene mutation per engine. Publication order is the
//! total order renderers observe; the head snapshot is swapped atomically
//! under a short lock while renderers keep reading their own references.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use aur_core::{AurError, AurResult};

use crate::{SceneDraft, ScenePools, SceneRef, SceneState};

pub struct SceneManager {
    pools: Arc<ScenePools>,
    head: Mutex<Option<SceneRef>>,
    /// Published versions by id; weak so unreferenced history can go away
    versions: Mutex<HashMap<i32, Weak<SceneState>>>,
    next_scene_id: AtomicI32,
}

impl SceneManager {
    pub fn new() -> Self {
        Self::with_quota(16)
    }

    pub fn with_quota(initial_quota: usize) -> Self {
        Self {
            pools: ScenePools::new(initial_quota),
            head: Mutex::new(None),
            versions: Mutex::new(HashMap::new()),
            next_scene_id: AtomicI32::new(1),
        }
    }

    pub fn pools(&self) -> &Arc<ScenePools> {
        &self.pools
    }

    /// Id of the most recently published snapshot
    pub fn head_scene_state_id(&self) -> Option<i32> {
        self.head.lock().as_ref().map(|s| s.id())
    }

    pub fn head_scene_state(&self) -> Option<SceneRef> {
        self.head.lock().clone()
    }

    /// Start a fresh, empty scene version
    pub fn create_scene(&self, modification_time: f64) -> SceneDraft {
        let id = self.next_scene_id.fetch_add(1, Ordering::Relaxed);
        SceneDraft::empty(id, modification_time, Arc::clone(&self.pools))
    }

    /// Derive a mutable child from a published snapshot
    pub fn create_derived(&self, base_id: i32, modification_time: f64) -> AurResult<SceneDraft> {
        let base = self
            .versions
            .lock()
            .get(&base_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                AurError::InvalidParameter(format!("unknown base scene state id {base_id}"))
            })?;

        if modification_time < base.modification_time() {
            return Err(AurError::InvalidParameter(format!(
                "modification time {modification_time} runs behind base scene time {}",
                base.modification_time()
            )));
        }

        let id = self.next_scene_id.fetch_add(1, Ordering::Relaxed);
        Ok(SceneDraft::derived(
            id,
            modification_time,
            Arc::clone(&self.pools),
            &base,
        ))
    }

    /// Derive from the head snapshot, or start empty when none exists
    pub fn create_derived_head(&self, modification_time: f64) -> AurResult<SceneDraft> {
        match self.head_scene_state_id() {
            Some(id) => self.create_derived(id, modification_time),
            None => Ok(self.create_scene(modification_time)),
        }
    }

    /// Recursively fix the draft and publish it as the new head
    pub fn publish(&self, draft: SceneDraft) -> SceneRef {
        let scene = draft.fix();

        let mut versions = self.versions.lock();
        versions.retain(|_, weak| weak.strong_count() > 0);
        versions.insert(scene.id(), Arc::downgrade(&scene));
        drop(versions);

        let mut head = self.head.lock();
        if let Some(prev) = head.as_ref() {
            if scene.modification_time() < prev.modification_time() {
                log::warn!(
                    "scene {} published with modification time {} behind head time {}",
                    scene.id(),
                    scene.modification_time(),
                    prev.modification_time()
                );
            }
        }
        *head = Some(Arc::clone(&scene));
        scene
    }
}

impl Default for SceneManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aur_core::{PoolRef, Vec3};

    #[test]
    fn test_publish_sets_head() {
        let mgr = SceneManager::new();
        assert!(mgr.head_scene_state_id().is_none());

        let mut draft = mgr.create_scene(0.0);
        let source_id = draft.add_sound_source();
        let scene = mgr.publish(draft);

        assert_eq!(mgr.head_scene_state_id(), Some(scene.id()));
        assert!(scene.sound_source_state(source_id).is_some());
    }

    #[test]
    fn test_cow_sharing_across_versions() {
        let mgr = SceneManager::new();

        let mut draft = mgr.create_scene(0.0);
        let src = draft.add_sound_source();
        let src2 = draft.add_sound_source();
        let rcv = draft.add_sound_receiver();
        draft.add_portal();
        draft.add_surface();
        let v1 = mgr.publish(draft);

        // Change only one source's parameters
        let mut draft = mgr.create_derived(v1.id(), 1.0).unwrap();
        draft
            .alter_sound_source(src)
            .unwrap()
            .set_sound_power(2e-12);
        let v2 = mgr.publish(draft);

        // Untouched containers are shared by pointer
        assert!(Arc::ptr_eq(v1.receivers_container(), v2.receivers_container()));
        assert!(Arc::ptr_eq(v1.portals_container(), v2.portals_container()));
        assert!(Arc::ptr_eq(v1.surfaces_container(), v2.surfaces_container()));

        // Sources container differs, but the unchanged source state is shared
        assert!(!Arc::ptr_eq(v1.sources_container(), v2.sources_container()));
        assert!(PoolRef::ptr_eq(
            v1.sound_source_state(src2).unwrap(),
            v2.sound_source_state(src2).unwrap()
        ));
        assert!(!PoolRef::ptr_eq(
            v1.sound_source_state(src).unwrap(),
            v2.sound_source_state(src).unwrap()
        ));

        // Receiver state identical by pointer through the shared container
        assert!(PoolRef::ptr_eq(
            v1.sound_receiver_state(rcv).unwrap(),
            v2.sound_receiver_state(rcv).unwrap()
        ));
    }

    #[test]
    fn test_diff_between_versions() {
        let mgr = SceneManager::new();

        let mut draft = mgr.create_scene(0.0);
        let s1 = draft.add_sound_source();
        draft.add_sound_receiver();
        let v1 = mgr.publish(draft);

        let mut draft = mgr.create_derived(v1.id(), 1.0).unwrap();
        let s2 = draft.add_sound_source();
        draft.remove_sound_source(s1).unwrap();
        let v2 = mgr.publish(draft);

        let diff = v2.diff(Some(&v1));
        assert_eq!(diff.sources.new_ids, vec![s2]);
        assert_eq!(diff.sources.deleted_ids, vec![s1]);
        assert!(diff.sources.common_ids.is_empty());

        // Receiver container untouched: everything common via pointer equality
        assert!(diff.receivers.new_ids.is_empty());
        assert!(diff.receivers.deleted_ids.is_empty());
        assert_eq!(diff.receivers.common_ids.len(), 1);
    }

    #[test]
    fn test_motion_alter_through_scene() {
        let mgr = SceneManager::new();

        let mut draft = mgr.create_scene(0.0);
        let src = draft.add_sound_source();
        draft
            .alter_sound_source_motion(src)
            .unwrap()
            .set_position(Vec3::new(1.0, 0.0, -1.0));
        let v1 = mgr.publish(draft);

        let motion_v1 = v1
            .sound_source_state(src)
            .unwrap()
            .motion_ref()
            .unwrap()
            .clone();
        assert_eq!(motion_v1.position(), Vec3::new(1.0, 0.0, -1.0));

        // Version without motion change shares the motion state
        let mut draft = mgr.create_derived(v1.id(), 1.0).unwrap();
        draft.alter_sound_source(src).unwrap().set_muted(true);
        let v2 = mgr.publish(draft);
        assert!(PoolRef::ptr_eq(
            v2.sound_source_state(src).unwrap().motion_ref().unwrap(),
            &motion_v1
        ));

        // Version with motion change gets a new motion state
        let mut draft = mgr.create_derived(v2.id(), 2.0).unwrap();
        draft
            .alter_sound_source_motion(src)
            .unwrap()
            .set_position(Vec3::new(2.0, 0.0, -1.0));
        let v3 = mgr.publish(draft);
        assert!(!PoolRef::ptr_eq(
            v3.sound_source_state(src).unwrap().motion_ref().unwrap(),
            &motion_v1
        ));
    }

    #[test]
    fn test_unknown_base_rejected() {
        let mgr = SceneManager::new();
        assert!(mgr.create_derived(999, 0.0).is_err());
    }

    #[test]
    fn test_pool_reclaim_after_version_drop() {
        let mgr = SceneManager::new();

        let mut draft = mgr.create_scene(0.0);
        let src = draft.add_sound_source();
        let v1 = mgr.publish(draft);

        let mut draft = mgr.create_derived(v1.id(), 1.0).unwrap();
        draft.remove_sound_source(src).unwrap();
        let _v2 = mgr.publish(draft);

        // v1 still holds the source state
        assert_eq!(mgr.pools().sources.live(), 1);
        drop(v1);
        assert_eq!(mgr.pools().sources.live(), 0);
    }
}
