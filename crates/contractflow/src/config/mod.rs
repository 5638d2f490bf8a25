pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str};
pub use schema::{
    BackoffCurve, BroadcastSettings, Config, Environment, LoggingConfig, MirrorSettings,
    PipelineSettings, QueueSettings, ResilienceSettings, RetryPolicySettings, RetrySettings,
    WorkerSettings,
};
