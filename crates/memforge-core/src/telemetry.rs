//! Log output for the `memforge` binary.
//!
//! `--verbose` lowers memforge's own crates to DEBUG; dependencies (SurrealDB,
//! reqwest, hyper) stay at WARN unless `RUST_LOG` says otherwise. `--json`
//! switches to newline-delimited JSON for log shippers: every line carries
//! the enclosing `memforge.session` span, so `session_id` and `owner_id`
//! can be filtered on without parsing messages.
//!
//! The global subscriber can be set once per process; [`init_tracing`]
//! ignores later calls.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const MEMFORGE_TARGETS: [&str; 3] = ["memforge", "memforge_core", "memforge_state"];

/// Filter used when `RUST_LOG` is unset.
fn default_directives(level: Level) -> String {
    let mut directives = String::from("warn");
    for target in MEMFORGE_TARGETS {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}

/// Install the global subscriber.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_scopes_level_to_memforge() {
        let directives = default_directives(Level::DEBUG);
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("memforge_core=DEBUG"));
        assert!(directives.contains("memforge_state=DEBUG"));
        assert!(directives.contains(",memforge=DEBUG"));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }
}
