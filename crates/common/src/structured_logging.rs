use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Write};
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// One JSON log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredLogEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub level: String,
    /// Module that emitted the event
    pub target: String,
    pub message: String,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ExecutionContext>,
}

/// Process-level context attached to JSON log lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub service: String,
    pub app_version: String,
    pub hostname: String,
    pub pid: u32,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            service: "failover-gateway".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
        }
    }
}

/// Layer writing every event as one JSON object per line.
pub struct JsonLogLayer<W> {
    context: ExecutionContext,
    make_writer: W,
}

impl JsonLogLayer<fn() -> io::Stdout> {
    pub fn stdout() -> Self {
        Self::with_writer(io::stdout)
    }
}

impl<W> JsonLogLayer<W>
where
    W: for<'w> MakeWriter<'w> + 'static,
{
    pub fn with_writer(make_writer: W) -> Self {
        Self {
            context: ExecutionContext::default(),
            make_writer,
        }
    }
}

impl<S, W> Layer<S> for JsonLogLayer<W>
where
    S: Subscriber,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let entry = StructuredLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: event.metadata().level().as_str().to_string(),
            target: event.metadata().target().to_string(),
            message: fields.message.unwrap_or_default(),
            fields: fields.values,
            context: Some(self.context.clone()),
        };

        if let Ok(line) = serde_json::to_string(&entry) {
            let _ = writeln!(self.make_writer.make_writer(), "{}", line);
        }
    }
}

/// Splits the `message` field from the structured ones.
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: HashMap<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.values.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

/// Logging setup chosen by the binary at startup.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set
    pub level: Level,
    pub json_output: bool,
    /// Only applies to the human-readable format
    pub color_output: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_output: false,
            color_output: true,
            include_line_numbers: cfg!(debug_assertions),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_structured_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    if config.json_output {
        let subscriber = Registry::default()
            .with(env_filter)
            .with(JsonLogLayer::stdout());
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(config.include_line_numbers)
            .with_ansi(config.color_output)
            .with_span_events(FmtSpan::CLOSE);

        let subscriber = Registry::default().with(env_filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Times one operation and logs the outcome with its fields attached.
pub struct OperationTimer {
    operation: String,
    started: Instant,
    fields: serde_json::Map<String, Value>,
}

impl OperationTimer {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            started: Instant::now(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(key.into(), v);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Log at `info` on success and `warn` on failure; returns the elapsed time.
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: &Result<T, E>) -> Duration {
        let elapsed = self.started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        let fields = Value::Object(self.fields);

        match result {
            Ok(_) => tracing::info!(
                operation = %self.operation,
                duration_ms,
                fields = %fields,
                "{} finished",
                self.operation
            ),
            Err(e) => tracing::warn!(
                operation = %self.operation,
                duration_ms,
                fields = %fields,
                error = %e,
                "{} failed",
                self.operation
            ),
        }
        elapsed
    }
}

/// Per-turn context carried through the router.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub session_id: Option<String>,
    pub start_time: Instant,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
