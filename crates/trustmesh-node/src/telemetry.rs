use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogConfig;

const CRATES: [&str; 5] = [
    "trustmesh_broker",
    "trustmesh_orchestrator",
    "trustmesh_reputation",
    "trustmesh_voting",
    "trustmesh_node",
];

/// Build the filter: `RUST_LOG` wins, otherwise the configured level for the
/// trustmesh crates plus any per-target overrides.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter> {
    if let Ok(directives) = std::env::var(EnvFilter::DEFAULT_ENV) {
        return Ok(EnvFilter::new(directives));
    }
    let own = CRATES
        .iter()
        .map(|target| format!("{target}={}", config.level))
        .collect::<Vec<_>>()
        .join(",");
    let mut filter = EnvFilter::new(format!("warn,{own}"));
    for (target, level) in &config.filters {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber. Call once, before the node starts.
pub fn init(config: &LogConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(config)?);
    if config.json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init()?;
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_overrides() {
        let mut config = LogConfig::default();
        config
            .filters
            .insert("trustmesh_broker".into(), "debug".into());
        assert!(env_filter(&config).is_ok());
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = LogConfig::default();
        config.filters.insert("trustmesh_broker".into(), "loud".into());
        if std::env::var(EnvFilter::DEFAULT_ENV).is_err() {
            assert!(env_filter(&config).is_err());
        }
    }
}
