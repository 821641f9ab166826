use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer as _,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt as _,
};

use crate::config::LoggingConfig;

/// Installs the global subscriber. Keep the returned guard alive for as long
/// as file logging should keep flushing.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let stdout_layer = if config.json {
        fmt::Layer::new()
            .json()
            .with_writer(std::io::stdout)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        fmt::Layer::new()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "jog_bridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::Layer::new()
                .with_writer(writer)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(filter);

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(guard)
}
