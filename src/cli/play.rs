// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use iptv_core::PlaybackController;
use iptv_core::player::mpv::MpvFactory;
use iptv_core::player::{AuthHeaders, PlaybackSnapshot, PlaybackStatus, StreamDescriptor};

use super::CommandContext;

pub struct PlayCommand {
    pub channel: Option<String>,
    pub number: Option<u32>,
    pub url: Option<String>,
    /// `Name: value` pairs sent with every stream request.
    pub headers: Vec<String>,
}

fn parse_headers(raw: &[String]) -> Result<AuthHeaders> {
    raw.iter().try_fold(AuthHeaders::new(), |headers, line| {
        let (name, value) = line
            .split_once(':')
            .with_context(|| format!("Invalid header '{}', expected 'Name: value'", line))?;
        Ok(headers.with(name.trim(), value.trim()))
    })
}

fn describe(snapshot: &PlaybackSnapshot) -> String {
    let mut line = format!("[{}]", snapshot.status.as_str());
    if snapshot.retry_count > 0 {
        line.push_str(&format!(" retry {}", snapshot.retry_count));
    }
    if snapshot.muted {
        line.push_str(" (muted)");
    }
    if let Some(message) = &snapshot.error_message {
        line.push_str(&format!(" {}", message));
    }
    line
}

impl PlayCommand {
    pub async fn execute(self, context: CommandContext) -> Result<()> {
        let descriptor = match (self.url, self.channel) {
            (Some(url), channel) => {
                StreamDescriptor::direct(channel.unwrap_or_else(|| "direct".to_string()), url)
            }
            (None, Some(channel)) => StreamDescriptor::channel(channel, self.number),
            (None, None) => anyhow::bail!("Either --channel or --url is required"),
        };
        let auth = parse_headers(&self.headers)?;

        let api = context.api()?;
        let proxy_origin = match context.config.proxy.local_origin.trim() {
            "" => None,
            origin => Some(Url::parse(origin).context("Invalid proxy.local_origin")?),
        };
        let factory = MpvFactory::new(api.http_client().clone(), proxy_origin);

        let mut controller = PlaybackController::new(
            context.config.playback.clone(),
            context.config.proxy.clone(),
            Arc::new(factory),
        )
        .with_resolver(Arc::new(api));

        let mut updates = controller.subscribe();
        controller.initialize(descriptor, Some(auth)).await;

        eprintln!("Keys: m = mute, p = play/pause, r = retry, q = quit");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut last = String::new();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = updates.borrow_and_update().clone();
                    let line = describe(&snapshot);
                    if line != last {
                        println!("{}", line);
                        last = line;
                    }
                    if snapshot.status == PlaybackStatus::Error {
                        eprintln!("Press r to retry or q to quit");
                    }
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    match line.trim() {
                        "m" => controller.set_muted(!controller.snapshot().muted),
                        "p" => controller.toggle_play(),
                        "r" => controller.retry().await,
                        "q" => break,
                        _ => controller.interact(),
                    }
                }
            }
        }

        controller.teardown().await;
        println!("Playback ended");
        Ok(())
    }
}
