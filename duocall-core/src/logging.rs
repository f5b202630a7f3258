//! Tracing setup for duocall processes
//!
//! Log records go to stderr so stdout stays free for reports, or are
//! appended to `logging.file_path` when one is configured.

use anyhow::Context;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Engine crates that are chatty at `info` and below
const QUIET_TARGETS: &[&str] = &["webrtc", "webrtc_ice", "webrtc_dtls", "webrtc_sctp", "webrtc_srtp", "webrtc_mdns"];

/// Encoding of log records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(format: &str) -> anyhow::Result<Self> {
        match format.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            _ => Err(anyhow::anyhow!("Invalid log format: {format}")),
        }
    }
}

/// Install the global subscriber described by `config`
///
/// `RUST_LOG` overrides `config.level` when set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let format = LogFormat::parse(&config.format)?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(level)?,
    };
    let writer = make_writer(config.file_path.as_deref())?;
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_writer(writer),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_span_events(FmtSpan::NONE)
                    .with_target(true)
                    .with_file(false)
                    .with_ansi(config.file_path.is_none())
                    .with_writer(writer),
            )
            .try_init()?,
    }

    Ok(())
}

/// `level` for duocall code, capped at `warn` for the WebRTC engine
fn default_filter(level: Level) -> anyhow::Result<EnvFilter> {
    let mut directives = vec![level.to_string().to_lowercase()];
    if level > Level::WARN {
        directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    }
    Ok(EnvFilter::try_new(directives.join(","))?)
}

fn make_writer(file_path: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    let Some(path) = file_path else {
        return Ok(BoxMakeWriter::new(std::io::stderr));
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {path}"))?;
    Ok(BoxMakeWriter::new(Arc::new(file)))
}

/// Parse a level name; `warning` is accepted for `warn`
pub fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    let name = if level.eq_ignore_ascii_case("warning") { "warn" } else { level };
    name.parse::<Level>()
        .map_err(|_| anyhow::anyhow!("Invalid log level: {level}"))
}
