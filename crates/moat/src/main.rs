//! Moat: Local-Only Network Airlock
//!
//! Loads the preference file, computes the capture policy and prints the
//! tunnel configuration bundle that would be registered on connect.
//!
//! ```text
//! moat [preferences.toml|preferences.json]
//! ```

use anyhow::{Context, Result};
use moat_vpn::{compute_settings, PreferenceStore, TunnelConfiguration};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_PREFERENCES: &str = "moat.toml";

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_PREFERENCES.to_string());

    let store = PreferenceStore::open(&path)
        .with_context(|| format!("cannot use {} as a preference file", path))?;
    let preferences = store
        .load()
        .with_context(|| format!("failed to read {}", store.path().display()))?;

    info!(
        "Preferences: multicast discovery {}, local name resolution {}",
        preferences.allow_multicast_discovery, preferences.allow_local_name_resolution
    );

    let settings = compute_settings(&preferences);
    info!(
        "Policy: {} IPv4 and {} IPv6 exclusions, DNS fallback {}",
        settings.ipv4.excluded.len(),
        settings.ipv6.excluded.len(),
        settings.dns_fallback_to_system()
    );

    let bundle = TunnelConfiguration::new(preferences, settings);
    println!("{}", bundle.to_json()?);

    Ok(())
}
