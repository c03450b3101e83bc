use std::sync::Mutex;

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{Layer, Registry};

use crate::common::config::LoggingConfigLoader;
use crate::common::get_logger_timer_rfc3339;

fn parse_level(level: Option<String>) -> Result<LevelFilter, anyhow::Error> {
    match level {
        Some(s) => s
            .parse()
            .with_context(|| format!("invalid log level: {}", s)),
        None => Ok(LevelFilter::OFF),
    }
}

fn parse_env_filter(default_level: LevelFilter) -> Result<EnvFilter, anyhow::Error> {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env()
        .with_context(|| "failed to create env filter")
}

/// Install the global subscriber: a pretty console layer on stderr and, when
/// a file level is configured, a plain-text layer appending to a log file.
pub fn init(config: impl LoggingConfigLoader) -> Result<(), anyhow::Error> {
    let file_config = config.get_file_logger_config();
    let file_level = parse_level(file_config.level.clone())?;

    let mut file_layer = None;
    if file_level != LevelFilter::OFF {
        let dir = file_config.dir.as_deref().unwrap_or(".");
        let file = file_config.file.as_deref().unwrap_or("ctxrpc.log");
        let path = std::path::Path::new(dir).join(file);
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir))?;
        let writer = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {:?}", path))?;

        let mut l = tracing_subscriber::fmt::layer();
        l.set_ansi(false);
        file_layer = Some(
            l.with_writer(Mutex::new(writer))
                .with_timer(get_logger_timer_rfc3339())
                .with_filter(parse_env_filter(file_level)?),
        );
    }

    let console_level = parse_level(config.get_console_logger_config().level)?;
    let console_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_timer(get_logger_timer_rfc3339())
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter(console_level)?);

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .with_context(|| "failed to install tracing subscriber")?;

    Ok(())
}
