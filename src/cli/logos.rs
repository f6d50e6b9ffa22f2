// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use iptv_core::ImageCache;

use super::{CommandContext, OutputFormat};

pub enum LogosCommand {
    /// Warm the cache with every URL given, plus any listed in `file`.
    Preload {
        urls: Vec<String>,
        file: Option<PathBuf>,
    },
    Get {
        url: String,
        format: OutputFormat,
    },
}

fn collect_urls(mut urls: Vec<String>, file: Option<PathBuf>) -> Result<Vec<String>> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read URL list: {}", path.display()))?;
        urls.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }
    urls.sort();
    urls.dedup();
    Ok(urls)
}

async fn wait_for_preload(images: &ImageCache, urls: &[String]) -> usize {
    let pb = ProgressBar::new(urls.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message("Fetching logos...");

    loop {
        let cached = urls
            .iter()
            .filter(|url| images.get_cached(url).is_some())
            .count();
        pb.set_position(cached as u64);

        let stats = images.stats();
        if stats.in_flight == 0 {
            pb.finish_and_clear();
            return cached;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

impl LogosCommand {
    pub async fn execute(self, context: CommandContext) -> Result<()> {
        let images = context.images()?;

        match self {
            Self::Preload { urls, file } => {
                let urls = collect_urls(urls, file)?;
                if urls.is_empty() {
                    anyhow::bail!("No logo URLs given");
                }

                images.preload(&urls);
                let cached = wait_for_preload(&images, &urls).await;

                println!("✓ {} of {} logos cached", cached, urls.len());
                if cached < urls.len() {
                    eprintln!(
                        "Warning: {} logo(s) could not be fetched; run again to retry",
                        urls.len() - cached
                    );
                }
            }
            Self::Get { url, format } => {
                let mut payload = images.get_cached(&url);
                if payload.is_none() {
                    images.preload([url.as_str()]);
                    wait_for_preload(&images, std::slice::from_ref(&url)).await;
                    payload = images.get_cached(&url);
                }

                let data_uri = payload
                    .as_ref()
                    .and_then(|p| p.as_data_uri())
                    .map(str::to_string);
                let result = json!({
                    "url": url,
                    "cached": payload.is_some(),
                    "data_uri": data_uri,
                });
                format.print(&result, |r| match r["data_uri"].as_str() {
                    Some(uri) => println!("{}", uri),
                    None if r["cached"].as_bool() == Some(true) => {
                        println!("Cached in memory only (too large to inline)")
                    }
                    None => println!("Not cached"),
                })?;
            }
        }

        images.dispose();
        Ok(())
    }
}
