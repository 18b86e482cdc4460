//! Shared data types.

pub mod types;

pub use types::{PointCloud, PoseKey, RelativePose, Time, TrackId};
