//! Pose variable assignments keyed by [`PoseKey`].

use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::common::{PoseKey, TrackId};
use crate::geometry::SE3;

/// Ordered mapping from pose variable to its value.
///
/// Used both for the initial guesses of new variables handed to the optimizer
/// and for the global estimate it returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values {
    poses: BTreeMap<PoseKey, SE3>,
}

impl Values {
    pub fn new() -> Self {
        Self {
            poses: BTreeMap::new(),
        }
    }

    /// Insert or overwrite the value of `key`.
    pub fn insert(&mut self, key: PoseKey, pose: SE3) -> Option<SE3> {
        self.poses.insert(key, pose)
    }

    pub fn get(&self, key: &PoseKey) -> Option<&SE3> {
        self.poses.get(key)
    }

    pub fn get_mut(&mut self, key: &PoseKey) -> Option<&mut SE3> {
        self.poses.get_mut(key)
    }

    pub fn contains(&self, key: &PoseKey) -> bool {
        self.poses.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PoseKey> {
        self.poses.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, PoseKey, SE3> {
        self.poses.iter()
    }

    /// Values belonging to one track, in time order.
    pub fn track_values(&self, track_id: TrackId) -> impl Iterator<Item = (&PoseKey, &SE3)> {
        self.poses
            .range(PoseKey::new(track_id, 0)..=PoseKey::new(track_id, u64::MAX))
    }
}

impl IntoIterator for Values {
    type Item = (PoseKey, SE3);
    type IntoIter = btree_map::IntoIter<PoseKey, SE3>;

    fn into_iter(self) -> Self::IntoIter {
        self.poses.into_iter()
    }
}

impl<'a> IntoIterator for &'a Values {
    type Item = (&'a PoseKey, &'a SE3);
    type IntoIter = btree_map::Iter<'a, PoseKey, SE3>;

    fn into_iter(self) -> Self::IntoIter {
        self.poses.iter()
    }
}

impl FromIterator<(PoseKey, SE3)> for Values {
    fn from_iter<I: IntoIterator<Item = (PoseKey, SE3)>>(iter: I) -> Self {
        Self {
            poses: iter.into_iter().collect(),
        }
    }
}
