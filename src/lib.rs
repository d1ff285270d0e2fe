//! EnMS Analytics Service
//!
//! Stateful analytics engine for factory energy management:
//!
//! - **Store Adapter**: typed TimescaleDB access (hypertables + continuous aggregates)
//! - **Feature Aggregator**: dense per-bucket feature tables with granularity fallback
//! - **Baseline Engine**: OLS regression baselines with auto feature selection
//! - **Anomaly Engine**: isolation-forest detection with severity classification
//! - **KPI Engine**: SEC, peak demand, load factor, TOU cost, carbon
//! - **Event Bus**: Redis pub/sub publisher + subscriber
//! - **WebSocket Fan-out**: typed topic broadcast to dashboards
//! - **Scheduler**: cron-like retraining, detection, KPI pre-compute, cleanup

pub mod config;
pub mod error;
pub mod types;
pub mod events;
pub mod store;
pub mod features;
pub mod baseline;
pub mod anomaly;
pub mod kpi;
pub mod ws;
pub mod limits;
pub mod scheduler;
pub mod context;
pub mod api;

// Re-export the configuration root
pub use config::AppConfig;

// Re-export commonly used types
pub use types::{
    Anomaly, AnomalySeverity, AnomalyStatus, AnomalyType, BaselineModel, EnergySource,
    EnergySourceFeature, Granularity, JobStatus, Machine, ModelType, Seu, TimeRange, TrainingJob,
};

// Re-export error kinds
pub use error::CoreError;

// Re-export the event vocabulary
pub use events::{BusChannel, BusEvent, WsTopic};

// Re-export the shared context
pub use context::CoreContext;
