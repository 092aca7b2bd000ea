//! Process-wide structured logging.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "tagmirror=info";
/// Filter used when verbose output is requested and `RUST_LOG` is unset.
pub const VERBOSE_FILTER: &str = "tagmirror=debug";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Raised when the filter directive cannot be parsed.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Raised when a global subscriber is already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Builds the filter, preferring `RUST_LOG` when it is set.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] when the fallback directive is invalid.
pub fn filter(verbose: bool) -> Result<EnvFilter, LoggingError> {
    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return Ok(from_env);
    }
    let directive = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    EnvFilter::try_new(directive).map_err(|err| LoggingError::Filter(err.to_string()))
}

/// Installs a fmt subscriber writing to stderr.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init_logging(verbose: bool) -> Result<(), LoggingError> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose)?)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false, "tagmirror=info")]
    #[case(true, "tagmirror=debug")]
    fn fallback_filter_follows_verbosity(#[case] verbose: bool, #[case] expected: &str) {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let built = filter(verbose).unwrap_or_else(|err| panic!("filter: {err}"));
        assert_eq!(built.to_string(), expected);
    }
}
