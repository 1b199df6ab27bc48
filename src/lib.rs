// Core modules
pub mod api;
pub mod assignments;
pub mod backfill;
pub mod config;
pub mod download;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod pipeline;
pub mod scheduler;
pub mod signals;
pub mod snapshot;

// Re-export commonly used types
pub use api::{AdaptiveRateLimiter, ConnectorHandle, MarketConnector, PaperConnector};
pub use config::Settings;
pub use download::{DownloadCoordinator, DownloadQueue};
pub use error::{ConnectorError, Error, Result};
pub use execution::{Executor, OrderLifecycleManager};
pub use models::*;
pub use persistence::BarCache;
pub use signals::SignalEngine;
