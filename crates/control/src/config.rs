//! TOML config file loading, validation, and seeding of irrigation systems.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::controller::Controller;
use crate::model::{HardwareKind, IrrigationSystem};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub systems: Vec<SystemEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEntry {
    pub system_id: String,
    pub field_id: String,
    #[serde(default)]
    pub zone_id: Option<String>,
    pub kind: HardwareKind,
    /// Liters per minute; the default rate applies when absent.
    #[serde(default)]
    pub flow_rate: Option<f64>,
    /// Defaults to active.
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl SystemEntry {
    pub fn to_system(&self) -> IrrigationSystem {
        let mut system = IrrigationSystem::new(&self.system_id, &self.field_id, self.kind);
        system.zone_id = self.zone_id.clone();
        system.flow_rate = self.flow_rate;
        system.is_active = self.is_active.unwrap_or(true);
        system
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_systems(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_systems(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.systems.iter().enumerate() {
            let ctx = || {
                if s.system_id.is_empty() {
                    format!("systems[{i}]")
                } else {
                    format!("system '{}'", s.system_id)
                }
            };

            for problem in s.to_system().problems() {
                errors.push(format!("{}: {problem}", ctx()));
            }

            if !s.system_id.trim().is_empty() && !seen_ids.insert(&s.system_id) {
                errors.push(format!("{}: duplicate system_id", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file only logs a warning.
pub fn load_if_present(path: &str) -> Result<Option<Config>> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found, no systems seeded");
        return Ok(None);
    }
    load(path).map(Some)
}

/// Insert or refresh every configured system. Existing systems keep their
/// status and water totals.
pub async fn apply(config: &Config, controller: &Controller) -> Result<()> {
    for s in &config.systems {
        controller
            .seed_system(&s.to_system())
            .await
            .with_context(|| format!("failed to seed system '{}'", s.system_id))?;
    }

    tracing::info!(systems = config.systems.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
