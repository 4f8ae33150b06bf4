pub mod batch;
pub mod cache;
pub mod channels;
pub mod engine;
pub mod pipeline;
pub mod resources;
pub mod retry;
pub mod state_store;

pub use crate::domain::model::{MonitorTarget, PersistedState, RunReport};
pub use crate::domain::ports::{Classifier, FetchChannel, Notifier, PageFetcher, Pipeline};
pub use crate::utils::error::Result;
