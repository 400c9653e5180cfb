//! Container states: id-ordered collections of scene states with fast diff
//!
//! A published container is immutable and shared between scene versions via
//! `Arc`; a draft container is the copy-on-write working form. Entries stay
//! ordered by id (ids are generated monotonically), which makes the three-way
//! diff a single ordered merge.

use std::sync::Arc;

use aur_core::{Pool, PoolBox, PoolRef};

use crate::SceneStateItem;

/// Three-way difference between two containers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDiff {
    /// Ids only present in the newer container
    pub new_ids: Vec<i32>,
    /// Ids only present in the older container
    pub deleted_ids: Vec<i32>,
    /// Ids present in both
    pub common_ids: Vec<i32>,
}

// ═══════════════════════════════════════════════════════════════════════════
// PUBLISHED CONTAINER
// ═══════════════════════════════════════════════════════════════════════════

/// Immutable, published container of fixed states
#[derive(Debug)]
pub struct ContainerState<T: SceneStateItem> {
    entries: Vec<(i32, PoolRef<T>)>,
    modification_time: f64,
}

impl<T: SceneStateItem> ContainerState<T> {
    pub fn empty(modification_time: f64) -> Self {
        Self {
            entries: Vec::new(),
            modification_time,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn modification_time(&self) -> f64 {
        self.modification_time
    }

    pub fn has(&self, id: i32) -> bool {
        self.entries.iter().any(|(i, _)| *i == id)
    }

    pub fn get(&self, id: i32) -> Option<&PoolRef<T>> {
        self.entries.iter().find(|(i, _)| *i == id).map(|(_, s)| s)
    }

    pub fn ids(&self) -> Vec<i32> {
        self.entries.iter().map(|(i, _)| *i).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &PoolRef<T>)> {
        self.entries.iter().map(|(i, s)| (*i, s))
    }

    /// Three-way diff against an older container
    ///
    /// `None` means "everything is new". Runs as one ordered merge over the
    /// id-sorted entry lists.
    pub fn diff(&self, older: Option<&ContainerState<T>>) -> ContainerDiff {
        let mut diff = ContainerDiff::default();

        let Some(older) = older else {
            diff.new_ids = self.ids();
            return diff;
        };

        let mut a = older.entries.iter().map(|(i, _)| *i).peekable();
        let mut b = self.entries.iter().map(|(i, _)| *i).peekable();

        loop {
            match (a.peek().copied(), b.peek().copied()) {
                (None, None) => return diff,
                (None, Some(id)) => {
                    diff.new_ids.push(id);
                    b.next();
                }
                (Some(id), None) => {
                    diff.deleted_ids.push(id);
                    a.next();
                }
                (Some(old_id), Some(new_id)) => {
                    if old_id < new_id {
                        diff.deleted_ids.push(old_id);
                        a.next();
                    } else if old_id > new_id {
                        diff.new_ids.push(new_id);
                        b.next();
                    } else {
                        diff.common_ids.push(old_id);
                        a.next();
                        b.next();
                    }
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DRAFT CONTAINER
// ═══════════════════════════════════════════════════════════════════════════

/// Entry of a draft container
#[derive(Debug)]
pub enum DraftSlot<T: SceneStateItem> {
    /// Unchanged, still shared with the base version
    Kept(PoolRef<T>),
    /// Cloned or freshly created for this version
    Working(PoolBox<T>),
}

impl<T: SceneStateItem> DraftSlot<T> {
    pub fn get(&self) -> &T {
        match self {
            DraftSlot::Kept(r) => r,
            DraftSlot::Working(b) => b,
        }
    }
}

/// Mutable working form of a container, created on first write
#[derive(Debug)]
pub struct ContainerDraft<T: SceneStateItem> {
    entries: Vec<(i32, DraftSlot<T>)>,
    modification_time: f64,
}

impl<T: SceneStateItem> ContainerDraft<T> {
    pub fn empty(modification_time: f64) -> Self {
        Self {
            entries: Vec::new(),
            modification_time,
        }
    }

    /// Derive from a published container, sharing every entry
    pub fn from_shared(base: &ContainerState<T>, modification_time: f64) -> Self {
        Self {
            entries: base
                .entries
                .iter()
                .map(|(id, r)| (*id, DraftSlot::Kept(r.clone())))
                .collect(),
            modification_time,
        }
    }

    pub fn has(&self, id: i32) -> bool {
        self.entries.iter().any(|(i, _)| *i == id)
    }

    pub fn get(&self, id: i32) -> Option<&T> {
        self.entries
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, s)| s.get())
    }

    pub fn ids(&self) -> Vec<i32> {
        self.entries.iter().map(|(i, _)| *i).collect()
    }

    /// Insert a fresh state under a new id, keeping id order
    pub fn add(&mut self, id: i32, pool: &Pool<T>) -> &mut T {
        let mut state = pool.request();
        state.initialize(self.modification_time);

        let pos = self
            .entries
            .iter()
            .position(|(i, _)| *i > id)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (id, DraftSlot::Working(state)));
        match &mut self.entries[pos].1 {
            DraftSlot::Working(b) => b,
            DraftSlot::Kept(_) => unreachable!("entry was just inserted as working"),
        }
    }

    /// Drop an entry; the state is released with the draft's reference
    pub fn remove(&mut self, id: i32) -> bool {
        match self.entries.iter().position(|(i, _)| *i == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Clone-on-write access to one entry
    pub fn alter(&mut self, id: i32, pool: &Pool<T>) -> Option<&mut T> {
        let pos = self.entries.iter().position(|(i, _)| *i == id)?;
        let (_, slot) = &mut self.entries[pos];

        if let DraftSlot::Kept(shared) = slot {
            let mut clone = pool.request();
            clone.copy_from(shared, self.modification_time);
            *slot = DraftSlot::Working(clone);
        }

        match slot {
            DraftSlot::Working(b) => Some(b),
            DraftSlot::Kept(_) => unreachable!("slot was just made working"),
        }
    }

    /// Fix every working entry and publish as an immutable container
    pub fn fix(self) -> Arc<ContainerState<T>> {
        let entries = self
            .entries
            .into_iter()
            .map(|(id, slot)| {
                let fixed = match slot {
                    DraftSlot::Kept(r) => r,
                    DraftSlot::Working(mut b) => {
                        b.fix_children();
                        b.fix()
                    }
                };
                (id, fixed)
            })
            .collect();
        Arc::new(ContainerState {
            entries,
            modification_time: self.modification_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SurfaceState;

    fn pool() -> Pool<SurfaceState> {
        Pool::new(8, 4, SurfaceState::default)
    }

    fn publish(ids: &[i32], pool: &Pool<SurfaceState>) -> Arc<ContainerState<SurfaceState>> {
        let mut draft = ContainerDraft::empty(0.0);
        for &id in ids {
            draft.add(id, pool);
        }
        draft.fix()
    }

    #[test]
    fn test_diff_partitions_union() {
        let pool = pool();
        let a = publish(&[1, 2, 3, 5], &pool);
        let b = publish(&[2, 3, 4, 6], &pool);

        let diff = b.diff(Some(&a));
        assert_eq!(diff.new_ids, vec![4, 6]);
        assert_eq!(diff.deleted_ids, vec![1, 5]);
        assert_eq!(diff.common_ids, vec![2, 3]);

        // new + deleted + common partition the union exactly
        let mut union: Vec<i32> = diff
            .new_ids
            .iter()
            .chain(&diff.deleted_ids)
            .chain(&diff.common_ids)
            .copied()
            .collect();
        union.sort_unstable();
        assert_eq!(union, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_diff_against_nothing_is_all_new() {
        let pool = pool();
        let b = publish(&[1, 2], &pool);
        let diff = b.diff(None);
        assert_eq!(diff.new_ids, vec![1, 2]);
        assert!(diff.deleted_ids.is_empty());
        assert!(diff.common_ids.is_empty());
    }

    #[test]
    fn test_alter_clones_only_once() {
        let pool = pool();
        let base = publish(&[1], &pool);
        let before = base.get(1).unwrap().clone();

        let mut draft = ContainerDraft::from_shared(&base, 1.0);
        draft.alter(1, &pool).unwrap().set_material_id(7);
        draft.alter(1, &pool).unwrap().set_material_id(8);
        let published = draft.fix();

        // Base entry untouched, derived entry is a different object
        assert_eq!(before.material_id(), -1);
        let after = published.get(1).unwrap();
        assert_eq!(after.material_id(), 8);
        assert!(!PoolRef::ptr_eq(&before, after));
    }

    #[test]
    fn test_unaltered_entries_stay_shared() {
        let pool = pool();
        let base = publish(&[1, 2], &pool);
        let mut draft = ContainerDraft::from_shared(&base, 1.0);
        draft.alter(2, &pool).unwrap().set_material_id(3);
        let published = draft.fix();

        assert!(PoolRef::ptr_eq(base.get(1).unwrap(), published.get(1).unwrap()));
        assert!(!PoolRef::ptr_eq(base.get(2).unwrap(), published.get(2).unwrap()));
    }

    #[test]
    fn test_remove_releases_to_pool() {
        let pool = pool();
        let base = publish(&[1], &pool);
        assert_eq!(pool.live(), 1);

        let mut draft = ContainerDraft::from_shared(&base, 1.0);
        draft.remove(1);
        let published = draft.fix();
        assert!(published.is_empty());

        drop(base);
        assert_eq!(pool.live(), 0);
    }
}
