//! tracing setup: stdout plus an optional daily log file.

use std::path::Path;

use repeater_lib::runtime::SERVICE_NAME;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// HTTP and TLS internals that drown out the agent at info level.
const NOISY_CRATES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls", "tonic", "tower"];

/// Filter directives: quiet the noisy crates, then the configured level,
/// then RUST_LOG so an explicit directive wins.
fn filter_directives(level: &str, env: Option<&str>) -> String {
    let mut directives: Vec<String> = NOISY_CRATES.iter().map(|c| format!("{c}=warn")).collect();
    directives.push(level.to_string());
    if let Some(env) = env.filter(|e| !e.trim().is_empty()) {
        directives.push(env.to_string());
    }
    directives.join(",")
}

/// Install the global subscriber. The returned guard flushes the file writer
/// and must live until exit.
pub fn init(config: &LoggingConfig, log_dir: &Path) -> anyhow::Result<Option<WorkerGuard>> {
    let env = std::env::var("RUST_LOG").ok();
    let filter = EnvFilter::try_new(filter_directives(&config.level, env.as_deref()))?;

    let (file_layer, guard) = if config.file {
        std::fs::create_dir_all(log_dir)?;
        // e.g., repeater-agent.2026-01-15.log
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(SERVICE_NAME)
            .filename_suffix("log")
            .build(log_dir)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    if guard.is_some() {
        info!("Logging to: {}", log_dir.display());
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let directives = filter_directives("info", None);
        assert!(directives.starts_with("hyper=warn,"));
        assert!(directives.ends_with(",tower=warn,info"));

        let directives = filter_directives("info", Some("repeater_lib=trace"));
        assert!(directives.ends_with(",info,repeater_lib=trace"));

        assert_eq!(
            filter_directives("debug", Some("  ")),
            filter_directives("debug", None)
        );
    }

    #[test]
    fn test_directives_parse() {
        let directives = filter_directives("repeater_lib=debug", Some("tonic=info"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
