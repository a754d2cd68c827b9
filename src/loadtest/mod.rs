//! Load generation engine.
//!
//! Provides the stage scheduler, the tagged metric registry, checks,
//! thresholds, the VU runner with its HTTP transport seam, and report
//! emission. [`engine::LoadTestEngine`] ties them together.

pub mod check;
pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod report;
pub mod scenario;
pub mod stage;
pub mod summary;
pub mod threshold;
pub mod transport;
pub mod vu;
