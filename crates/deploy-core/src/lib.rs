//! Core types and pure logic for the deployment control plane.

pub mod config;
pub mod report;
pub mod stage_model;
pub mod timeline;
pub mod types;

pub use config::Config;
pub use report::ReportRow;
pub use timeline::{TimelineEntry, TimelineOwner, TimelineStatus};
pub use types::*;
