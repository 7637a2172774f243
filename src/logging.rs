//! Logging Setup (tracing)

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Default-Direktiven zusätzlich zu `RUST_LOG`
const DEFAULT_DIRECTIVES: [&str; 2] = ["call_core=debug", "webrtc=warn"];

fn filter() -> EnvFilter {
    DEFAULT_DIRECTIVES
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(EnvFilter::from_default_env(), |filter, directive| {
            filter.add_directive(directive)
        })
}

/// Installiert den globalen Subscriber; weitere Aufrufe sind harmlos
pub fn init() {
    INIT.get_or_init(|| {
        let result = tracing_subscriber::fmt().with_env_filter(filter()).try_init();
        if result.is_ok() {
            tracing::debug!("Logging initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        init();
        init();
        assert!(INIT.get().is_some());
    }
}
