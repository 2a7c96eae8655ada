//! Stderr diagnostics for the `pilot` binary.
//!
//! These are developer logs controlled by `RUST_LOG`. Per-cycle records of a
//! task run go through a [`TraceSink`](crate::io::trace::TraceSink) instead
//! and ignore `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Used when `RUST_LOG` is unset or unparsable: run lifecycle events from
/// this crate, warnings from everything else.
pub const DEFAULT_FILTER: &str = "warn,pilot=info";

fn filter_or_default(from_env: Option<EnvFilter>) -> EnvFilter {
    from_env.unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a compact stderr subscriber.
///
/// ```bash
/// RUST_LOG=pilot::engine=debug pilot inspect .pilot/snapshot.json
/// ```
pub fn init() {
    let filter = filter_or_default(EnvFilter::try_from_default_env().ok());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_enables_pilot_info() {
        let filter = filter_or_default(None);
        let rendered = filter.to_string();
        assert!(rendered.contains("pilot=info"), "{rendered}");
        assert!(rendered.contains("warn"), "{rendered}");
    }

    #[test]
    fn explicit_filter_wins() {
        let filter = filter_or_default(Some(EnvFilter::new("pilot=trace")));
        assert_eq!(filter.to_string(), "pilot=trace");
    }
}
