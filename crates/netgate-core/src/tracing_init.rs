//! Log subscriber setup for the relay binary.
//!
//! Audit records are emitted on their own `audit` target. Crate-scoped
//! filters such as `netgate_relay=info` would silently drop them, so the
//! audit target stays at `info` unless the filter names it explicitly.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{Error, Result};

/// Target used by audit records.
pub const AUDIT_TARGET: &str = "audit";

/// Filter directives from `RUST_LOG` (or `default_filter` when unset),
/// with the audit target enabled unless already configured.
pub fn filter_directives(default_filter: &str, rust_log: Option<&str>) -> String {
    let base = rust_log
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .unwrap_or(default_filter);
    let names_audit = base
        .split(',')
        .filter_map(|directive| directive.split('=').next())
        .any(|target| target.trim() == AUDIT_TARGET);
    if names_audit || base.is_empty() {
        base.to_string()
    } else {
        format!("{base},{AUDIT_TARGET}=info")
    }
}

/// Install the global subscriber: human-readable lines, or one flattened
/// JSON object per event when `log_json` is set.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<()> {
    let directives = filter_directives(default_filter, std::env::var("RUST_LOG").ok().as_deref());
    let filter = EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("invalid log filter {directives:?}: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    installed.map_err(|e| Error::Config(format!("log subscriber already installed: {e}")))
}
