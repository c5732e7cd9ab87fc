pub mod cli;

use cli::commands::LogFormatArg;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

pub fn parse_level(level_str: &str) -> Option<Level> {
    match level_str.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, replaces the
/// computed directives entirely.
pub fn init_logging(level: Level, format: LogFormatArg) {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env();
        if std::env::var("RUST_LOG").is_err() {
            for directive in [
                format!("pinbox={}", level),
                "h2=warn".to_string(),
                "hyper=warn".to_string(),
                "reqwest=warn".to_string(),
            ] {
                if let Ok(directive) = directive.parse() {
                    filter = filter.add_directive(directive);
                }
            }
        }

        let registry = tracing_subscriber::registry().with(filter);
        match format {
            LogFormatArg::Text => registry
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .init(),
            LogFormatArg::Json => registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init(),
        }
    });
}
