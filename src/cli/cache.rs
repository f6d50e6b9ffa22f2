// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use super::{CommandContext, OutputFormat};
use anyhow::Result;
use serde_json::json;

pub enum CacheCommand {
    /// Drop expired logos from the persistent tier.
    Purge,
    Clear,
    Stats(OutputFormat),
}

impl CacheCommand {
    pub async fn execute(self, context: CommandContext) -> Result<()> {
        let images = context.images()?;

        match self {
            Self::Purge => {
                let purged = images.purge_expired();
                println!("Removed {} expired logo(s)", purged);
            }
            Self::Clear => {
                eprintln!("Clearing cache...");
                images.clear();
                let ads = context.ads()?.clear();
                println!("Cache cleared ({} ad context(s) dropped)", ads);
            }
            Self::Stats(format) => {
                let stats = images.stats();
                let result = json!({
                    "logos": stats.persistent_entries,
                    "store_keys": context.store().keys().len(),
                    "quota_bytes": context.config.images.store_quota_bytes,
                });
                format.print(&result, |r| {
                    println!("Cached logos: {}", r["logos"]);
                    println!("Store entries: {}", r["store_keys"]);
                    println!("Store quota: {} bytes", r["quota_bytes"]);
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iptv_core::{Config, KeyValueStore, MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn clear_removes_logos_and_ads_only() {
        let store = Arc::new(MemoryStore::new());
        store.set("logo_cache_http://img/a.png", "{}").unwrap();
        store.set("ad_cache_home", "{}").unwrap();
        store.set("session", "token").unwrap();

        let context = CommandContext::with_store(Config::default(), store.clone());
        CacheCommand::Clear.execute(context).await.unwrap();

        assert_eq!(store.keys(), vec!["session".to_string()]);
    }
}
