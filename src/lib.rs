pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliArgs;
pub use config::TomlConfig;

pub use core::{engine::MonitorEngine, pipeline::MonitorPipeline};
pub use domain::model::{MonitorTarget, PersistedState, RunReport};
pub use utils::error::{MonitorError, Result};
