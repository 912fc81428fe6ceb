//! Tracing subscriber setup
//!
//! The port itself only emits `tracing` events; embedders that do not install
//! their own subscriber can call [`init_tracing`].

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::PortConfig;

const DEFAULT_FILTER: &str = "treeport=info";

/// Install a global subscriber filtered by `RUST_LOG`.
///
/// Returns `false` when a subscriber was already installed, so repeated calls
/// (tests, embedders) are harmless.
pub fn init_tracing(config: &PortConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.log_json {
        registry.with(fmt::layer().json()).try_init().is_ok()
    } else {
        registry.with(fmt::layer()).try_init().is_ok()
    };

    if installed {
        tracing::info!(json = config.log_json, "Tracing initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_a_no_op() {
        let config = PortConfig::default();
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
