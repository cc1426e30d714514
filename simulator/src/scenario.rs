//! Scenario files: the tags placed in the simulated field, plus an optional
//! discovery configuration.

use std::path::Path;

use anyhow::Context;
use nfc_discovery::DiscoveryConfig;
use nfc_discovery::sim::SimTag;
use serde::Deserialize;

const DEMO: &str = include_str!("../scenarios/demo.json");

#[derive(Debug, Deserialize)]
pub struct Scenario {
    /// Replaces the environment configuration when present.
    #[serde(default)]
    pub config: Option<DiscoveryConfig>,
    pub tags: Vec<SimTag>,
}

impl Scenario {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading scenario {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing scenario {}", path.display()))
    }

    /// The field used when no scenario file is given.
    pub fn demo() -> anyhow::Result<Self> {
        Self::parse(DEMO).context("parsing built-in demo scenario")
    }

    fn parse(raw: &str) -> anyhow::Result<Self> {
        let scenario: Scenario = serde_json::from_str(raw)?;
        if let Some(config) = &scenario.config {
            config.validate()?;
        }
        Ok(scenario)
    }

    /// Scenario configuration, or the one from `NFC_*` variables.
    pub fn discovery_config(&self) -> anyhow::Result<DiscoveryConfig> {
        match &self.config {
            Some(config) => Ok(config.clone()),
            None => Ok(DiscoveryConfig::from_env()?),
        }
    }
}
