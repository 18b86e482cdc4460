pub mod common;
pub mod config;
pub mod estimator;
pub mod geometry;
pub mod matching;
pub mod optimizer;
pub mod system;
pub mod track;
