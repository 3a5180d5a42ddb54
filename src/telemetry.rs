//! Tracing initialization (fmt subscriber with env-filter).
//!
//! Filtering is controlled by `RUST_LOG` in the usual way, defaulting to
//! `info` for this crate. Hosts that already install a subscriber should
//! skip this and let their own stack receive the crate's spans and events.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global fmt subscriber. Returns an error if a subscriber is
/// already set.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tollgate=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}
