// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use anyhow::Result;

use super::{CommandContext, OutputFormat};

pub struct AdsCommand {
    pub context: String,
    /// Skip the cache and fetch now.
    pub refresh: bool,
    pub format: OutputFormat,
}

impl AdsCommand {
    pub async fn execute(self, context: CommandContext) -> Result<()> {
        let ads = context.ads()?;

        let set = if self.refresh {
            ads.refresh(&self.context)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to fetch ads: {}", e))?
        } else {
            match ads.load(&self.context).await {
                Some(set) => set,
                None => {
                    eprintln!("No ads available for '{}'", self.context);
                    return Ok(());
                }
            }
        };

        let stale = set.is_stale(context.config.ads.ttl());
        self.format.print(&set, |set| {
            println!(
                "{} ad(s) for '{}' fetched {}{}",
                set.items.len(),
                set.context_key,
                set.fetched_at.format("%Y-%m-%d %H:%M:%S UTC"),
                if stale { " (stale, refreshing)" } else { "" }
            );
            for item in &set.items {
                println!(
                    "  {} {} -> {}",
                    item.id,
                    item.title.as_deref().unwrap_or("(untitled)"),
                    item.target_url.as_deref().unwrap_or("-")
                );
            }
        })?;

        ads.dispose();
        Ok(())
    }
}
