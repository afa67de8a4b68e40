//! Logging initialisation shared by all binaries.

use crate::config::LoggingConfig;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// `crates` are the targets that get the configured level, e.g.
/// `["recorder", "timelapse_common"]`. `RUST_LOG` still takes precedence for
/// anything it names.
pub fn init_logging(config: &LoggingConfig, crates: &[&str]) -> anyhow::Result<()> {
    let level = parse_level(&config.level);

    let mut filter = EnvFilter::from_default_env();
    for krate in crates {
        filter = filter.add_directive(format!("{}={}", krate, level).parse()?);
    }
    filter = filter
        .add_directive("aws_config=warn".parse()?)
        .add_directive("aws_smithy_runtime=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
