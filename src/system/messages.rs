//! Inter-thread message types.

use crate::common::{PointCloud, Time};
use crate::geometry::SE3;

/// A stamped odometry pose with the scan taken at that pose, sent to the
/// worker that owns the track.
#[derive(Debug, Clone)]
pub struct ScanMsg {
    /// Timestamp in nanoseconds. Must increase strictly per worker.
    pub time_ns: Time,

    /// Odometry pose of the sensor (T_odom_sensor).
    pub odometry: SE3,

    /// Scan in the sensor frame.
    pub scan: PointCloud,
}

impl ScanMsg {
    pub fn new(time_ns: Time, odometry: SE3, scan: PointCloud) -> Self {
        Self {
            time_ns,
            odometry,
            scan,
        }
    }
}
