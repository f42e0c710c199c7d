//! Log output setup.
//!
//! Logs go to stderr so CLI output on stdout stays machine-readable. The
//! filter is taken from `RUST_LOG` when set, else `[logging].filter`, else
//! [`DEFAULT_FILTER`].

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub const DEFAULT_FILTER: &str = "crawldex=info,crawldex_core=info";

fn filter_for(config: &LoggingConfig, env: Option<String>) -> EnvFilter {
    let directives = env
        .filter(|s| !s.trim().is_empty())
        .or_else(|| config.filter.clone())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string());
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Warning: ignoring invalid log filter '{directives}': {e}");
        EnvFilter::new(DEFAULT_FILTER)
    })
}

/// Installs the global subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init(config: &LoggingConfig) {
    let filter = filter_for(config, std::env::var(EnvFilter::DEFAULT_ENV).ok());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_wins_over_config() {
        let config = LoggingConfig {
            filter: Some("crawldex=debug".into()),
        };
        assert_eq!(
            filter_for(&config, Some("warn".into())).to_string(),
            "warn"
        );
        assert_eq!(filter_for(&config, None).to_string(), "crawldex=debug");
        assert_eq!(
            filter_for(&LoggingConfig::default(), Some("  ".into())).to_string(),
            EnvFilter::new(DEFAULT_FILTER).to_string()
        );
    }

    #[test]
    fn bad_filter_falls_back() {
        let config = LoggingConfig {
            filter: Some("crawldex=loud".into()),
        };
        assert_eq!(
            filter_for(&config, None).to_string(),
            EnvFilter::new(DEFAULT_FILTER).to_string()
        );
    }
}
