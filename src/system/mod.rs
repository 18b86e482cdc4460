//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem` that spawns one laser
//! SLAM worker per track, along with shared state and inter-thread messaging
//! types.

pub mod messages;
pub mod shared_state;
mod slam_system;
mod worker;

pub use messages::ScanMsg;
pub use shared_state::SharedState;
pub use slam_system::SlamSystem;
pub use worker::{LaserSlamWorker, WorkerStats};
