// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub proxy: ProxyConfig,
    pub playback: PlaybackConfig,
    pub images: ImageCacheConfig,
    pub ads: AdCacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub api_key: String,
    /// Identity key sent in every request body.
    pub mobile: String,
    pub timeout_secs: u64,
    pub public_ip_url: String,
}

/// Streaming host prefix that gets routed through the local reverse proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub upstream_prefix: String,
    pub local_path: String,
    /// Where the local proxy listens, for players that need absolute URLs.
    pub local_origin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Full manifest reloads allowed for transient errors before giving up.
    pub max_reload_attempts: u32,
    pub reload_cooldown_ms: u64,
    pub controls_hide_ms: u64,
    pub retry: RetryConfig,
    pub buffering: BufferingConfig,
    /// Upstream statuses reported to the engine as retryable network errors.
    pub retryable_statuses: Vec<u16>,
}

/// Per-request retry parameters handed to the media engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub fuzz_factor: f64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferingConfig {
    pub buffering_goal_secs: u64,
    pub rebuffering_goal_secs: u64,
    pub buffer_behind_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    pub max_concurrent_fetches: usize,
    /// Images at or above this size stay memory-only.
    pub inline_threshold_bytes: usize,
    pub ttl_secs: u64,
    pub eviction_batch: usize,
    pub store_quota_bytes: usize,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdCacheConfig {
    pub ttl_secs: u64,
    pub key_prefix: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://your-server.com/api".to_string(),
            username: "your-username".to_string(),
            password: "your-password".to_string(),
            api_key: "your-api-key".to_string(),
            mobile: String::new(),
            timeout_secs: 30,
            public_ip_url: "https://api.ipify.org?format=json".to_string(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_prefix: "http://stream.your-server.com".to_string(),
            local_path: "/stream-proxy".to_string(),
            local_origin: String::new(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_reload_attempts: 4,
            reload_cooldown_ms: 1500,
            controls_hide_ms: 4000,
            retry: RetryConfig::default(),
            buffering: BufferingConfig::default(),
            retryable_statuses: vec![502, 503],
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            backoff_factor: 1.5,
            fuzz_factor: 0.5,
            timeout_ms: 30_000,
        }
    }
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            buffering_goal_secs: 30,
            rebuffering_goal_secs: 2,
            buffer_behind_secs: 30,
        }
    }
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            inline_threshold_bytes: 500 * 1024,
            ttl_secs: 7 * 24 * 60 * 60,
            eviction_batch: 10,
            store_quota_bytes: 5 * 1024 * 1024,
            key_prefix: "logo_cache_".to_string(),
        }
    }
}

impl Default for AdCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            key_prefix: "ad_cache_".to_string(),
        }
    }
}

impl PlaybackConfig {
    pub fn reload_cooldown(&self) -> Duration {
        Duration::from_millis(self.reload_cooldown_ms)
    }

    pub fn controls_hide_after(&self) -> Duration {
        Duration::from_millis(self.controls_hide_ms)
    }
}

impl ImageCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl AdCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        Ok(config)
    }

    /// Defaults when `path` does not exist. A file that exists but fails to
    /// read or parse is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("iptv-core").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }
}
