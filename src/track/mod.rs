//! Laser tracks: one ordered trajectory per SLAM worker.

mod laser_track;

pub use laser_track::{LaserTrack, SharedLaserTrack, TrackError, TrackPose};
