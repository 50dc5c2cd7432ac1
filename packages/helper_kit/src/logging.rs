use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_ENV: &str = "PRIVILEGED_HELPER_LOG";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// Tracing layer that hands every event's message to a callback
pub struct LogForwardLayer<F> {
    forward: F,
    target_prefix: Option<&'static str>,
}

impl<F> LogForwardLayer<F>
where
    F: Fn(LogLevel, String) + Send + Sync + 'static,
{
    pub fn new(forward: F) -> Self {
        LogForwardLayer {
            forward,
            target_prefix: None,
        }
    }

    /// Only forward events whose target starts with `prefix`.
    pub fn for_target(mut self, prefix: &'static str) -> Self {
        self.target_prefix = Some(prefix);
        self
    }
}

impl<S: Subscriber, F> Layer<S> for LogForwardLayer<F>
where
    F: Fn(LogLevel, String) + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if let Some(prefix) = self.target_prefix {
            if !metadata.target().starts_with(prefix) {
                return;
            }
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        (self.forward)(LogLevel::from(metadata.level()), visitor.message);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl MessageVisitor {
    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if !self.message.is_empty() {
            self.message.push_str(", ");
        }
        self.message.push_str(name);
        self.message.push('=');
        self.message.push_str(&value.to_string());
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let fields = std::mem::take(&mut self.message);
            self.message = format!("{:?}", value);
            if !fields.is_empty() {
                self.message.push_str(", ");
                self.message.push_str(&fields);
            }
        } else {
            self.push_field(field.name(), format_args!("{:?}", value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.record_debug(field, &format_args!("{}", value));
        } else {
            self.push_field(field.name(), format_args!("{}", value));
        }
    }
}

/// Installs the global subscriber for the binaries. Level comes from
/// `PRIVILEGED_HELPER_LOG`, output goes to `log_path` when set, stderr otherwise.
pub fn init_logging(log_path: Option<&str>) -> Option<WorkerGuard> {
    let log_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_path {
        Some(path) => {
            let write_path = match path.rsplit_once('/') {
                Some((dir, file)) => tracing_appender::rolling::never(dir, file),
                None => tracing_appender::rolling::never(".", path),
            };

            let (non_blocking, guard) = tracing_appender::non_blocking(write_path);
            let _ = tracing_subscriber::registry()
                .with(log_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(log_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init();
            None
        }
    }
}
