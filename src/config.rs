//! Configuration for scanning and connection lifecycle.
//!
//! This module defines the immutable value structures consumed by the scan
//! and session engines, and handles loading and saving them from disk.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Parameters of a single scan session.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ScanConfig {
   /// Raw filter tokens: `MFR:<hex>` adds a manufacturer-data byte suffix,
   /// any other token becomes the (last-wins) name substring filter.
   #[serde(default)]
   pub filters: Vec<String>,

   #[serde(default = "default_scan_duration")]
   pub scan_duration_ms: u64,
}

/// Parameters of a single connect request, snapshotted for the session's
/// lifetime and reused verbatim across reconnect attempts.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConnectionConfig {
   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   /// Transport parameter to negotiate after link-up (e.g. max payload
   /// size). `None` skips negotiation and goes straight to discovery.
   #[serde(default)]
   pub desired_parameter: Option<u16>,

   #[serde(default)]
   pub reconnection: ReconnectionConfig,
}

/// Bounded exponential-backoff reconnection parameters.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReconnectionConfig {
   #[serde(default = "default_reconnect_enabled")]
   pub enabled: bool,

   #[serde(default = "default_reconnect_attempts")]
   pub attempts: u32,

   #[serde(default = "default_initial_delay")]
   pub initial_delay_ms: u64,

   #[serde(default = "default_backoff_multiplier")]
   pub backoff_multiplier: f64,

   #[serde(default = "default_max_delay")]
   pub max_delay_ms: u64,
}

const fn default_scan_duration() -> u64 {
   10_000
}

const fn default_connect_timeout() -> u64 {
   30_000
}

const fn default_reconnect_enabled() -> bool {
   true
}

const fn default_reconnect_attempts() -> u32 {
   3
}

const fn default_initial_delay() -> u64 {
   2_000
}

const fn default_backoff_multiplier() -> f64 {
   2.0
}

const fn default_max_delay() -> u64 {
   30_000
}

impl Default for ScanConfig {
   fn default() -> Self {
      Self {
         filters: vec![],
         scan_duration_ms: default_scan_duration(),
      }
   }
}

impl Default for ConnectionConfig {
   fn default() -> Self {
      Self {
         connect_timeout_ms: default_connect_timeout(),
         desired_parameter: None,
         reconnection: ReconnectionConfig::default(),
      }
   }
}

impl Default for ReconnectionConfig {
   fn default() -> Self {
      Self {
         enabled: default_reconnect_enabled(),
         attempts: default_reconnect_attempts(),
         initial_delay_ms: default_initial_delay(),
         backoff_multiplier: default_backoff_multiplier(),
         max_delay_ms: default_max_delay(),
      }
   }
}

impl ScanConfig {
   pub fn scan_duration(&self) -> Duration {
      Duration::from_millis(self.scan_duration_ms)
   }
}

impl ConnectionConfig {
   pub fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }
}

/// On-disk configuration for hosts embedding the engine.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
   #[serde(default)]
   pub scan: ScanConfig,

   #[serde(default)]
   pub connection: ConnectionConfig,
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         Self::load_from(&config_path)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      let contents = fs::read_to_string(path)?;
      Ok(toml::from_str(&contents)?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(blelink_home) = env::var("BLELINK_HOME") {
         PathBuf::from(blelink_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(LinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("blelink").join("config.toml"))
   }
}
