// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! WHIP client configuration, loadable from YAML.

use crate::error::{Result, WhipError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How local ICE candidates reach the WHIP endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceMode {
    /// Wait for gathering to finish and embed every candidate in the POSTed offer.
    #[default]
    NoTrickle,
    /// POST the offer immediately, deliver candidates later via PATCH.
    Trickle,
}

/// When a trickle flush is allowed to go out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrickleBatch {
    /// Hold candidates until gathering is complete, then PATCH them in one fragment.
    #[default]
    UntilGatheringComplete,
    /// PATCH whatever is pending as soon as the resource exists; the final
    /// fragment carries end-of-candidates.
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WhipConfig {
    /// Per-request HTTP timeout.
    pub timeout_ms: u64,
    pub ice_mode: IceMode,
    pub trickle_batch: TrickleBatch,
    /// 307/308 redirects followed before giving up.
    pub max_redirects: u32,
    /// STUN/TURN URLs handed to the WebRTC peer connection.
    pub ice_servers: Vec<String>,
    /// Capacity of the session notification broadcast channel.
    pub notification_capacity: usize,
}

impl Default for WhipConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10000,
            ice_mode: IceMode::NoTrickle,
            trickle_batch: TrickleBatch::UntilGatheringComplete,
            max_redirects: 5,
            ice_servers: Vec::new(),
            notification_capacity: 64,
        }
    }
}

impl WhipConfig {
    pub fn trickle() -> Self {
        Self {
            ice_mode: IceMode::Trickle,
            ..Default::default()
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| WhipError::Configuration(format!("Failed to parse WHIP config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WhipError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            WhipError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;

        tracing::info!("Loaded WHIP config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(WhipError::Configuration(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        if self.notification_capacity == 0 {
            return Err(WhipError::Configuration(
                "notification_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}
