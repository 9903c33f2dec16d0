//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Level resolution order: `--log-level` flag, then the `TASKMASTER_LOG`
//! environment variable, then `info`.

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Install the global subscriber. Call once at startup.
pub fn init(cli_level: Option<LogLevel>) {
    let level = match cli_level {
        Some(lvl) => to_tracing_level(lvl),
        None => std::env::var("TASKMASTER_LOG")
            .ok()
            .and_then(|s| parse_level(&s))
            .unwrap_or(tracing::Level::INFO),
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn to_tracing_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

fn parse_level(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}
