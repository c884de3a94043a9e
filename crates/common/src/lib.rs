pub mod config;
pub mod errors;
pub mod structured_logging;

pub use config::{
    ConfigError, FallbackMode, GatewayConfig, PrimarySettings, ProviderKind, ProviderSettings,
    RetrySettings, SessionSettings, TimeoutSettings,
};

pub use errors::{
    FailoverError, FailoverResult, PersistenceError, ProviderError, ProviderErrorKind,
};

pub use structured_logging::{
    init_structured_logging, ExecutionContext, JsonLogLayer, LoggingConfig, OperationTimer,
    RequestContext, StructuredLogEntry,
};
