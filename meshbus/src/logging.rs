use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the process-wide tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from `default_filter`.
/// Only the first call installs anything; later calls return `false`.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_is_set_once() {
        let _ = init_tracing("meshbus=debug");
        assert!(!init_tracing("meshbus=trace"));
    }
}
