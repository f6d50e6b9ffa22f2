// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;

use iptv_core::ads::AdSource;
use iptv_core::images::HttpImageFetcher;
use iptv_core::{AdMetadataCache, ApiClient, Config, FileStore, ImageCache, KeyValueStore};

pub mod ads;
pub mod cache;
pub mod logos;
pub mod play;

pub use ads::AdsCommand;
pub use cache::CacheCommand;
pub use logos::LogosCommand;
pub use play::PlayCommand;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => anyhow::bail!("Invalid format: {}. Use 'text' or 'json'", s),
        }
    }

    pub fn print<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> Result<()> {
        match self {
            Self::Text => text(value),
            Self::Json => println!("{}", serde_json::to_string_pretty(value)?),
        }
        Ok(())
    }
}

/// Shared services the subcommands are built from.
pub struct CommandContext {
    pub config: Config,
    store: Arc<dyn KeyValueStore>,
}

impl CommandContext {
    pub fn new(config: Config) -> Result<Self> {
        let store = FileStore::open_default(config.images.store_quota_bytes)
            .context("Failed to open the local cache store")?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn with_store(config: Config, store: Arc<dyn KeyValueStore>) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }

    pub fn api(&self) -> Result<ApiClient> {
        ApiClient::new(&self.config.api)
    }

    pub fn images(&self) -> Result<ImageCache> {
        let api = self.api()?;
        Ok(ImageCache::new(
            self.config.images.clone(),
            self.store(),
            Arc::new(HttpImageFetcher::new(api.http_client().clone())),
        ))
    }

    pub fn ads(&self) -> Result<AdMetadataCache> {
        let source: Arc<dyn AdSource> = Arc::new(self.api()?);
        Ok(AdMetadataCache::with_images(
            self.config.ads.clone(),
            source,
            self.store(),
            self.images()?,
        ))
    }
}
