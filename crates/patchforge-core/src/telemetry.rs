//! Tracing initialisation for Patchforge binaries.
//!
//! Call [`init_tracing`] once at startup. Repeated calls are ignored
//! since the global subscriber can only be installed once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence for filtering; `level` is the default
/// verbosity when it is unset. With `json` set, log lines are emitted as
/// newline-delimited JSON for aggregation pipelines.
pub fn init_tracing(json: bool, level: Level) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    // A second call arrives here; the first subscriber stays installed.
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}
