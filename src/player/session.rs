// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use serde::Serialize;
use tracing::debug;

use super::errors::{EngineError, ErrorClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Idle,
    Loading,
    Playing,
    Paused,
    /// Autoplay was refused even when muted; needs a user gesture.
    AwaitingGesture,
    Error,
}

impl PlaybackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackStatus::Idle => "idle",
            PlaybackStatus::Loading => "loading",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::Paused => "paused",
            PlaybackStatus::AwaitingGesture => "tap to play",
            PlaybackStatus::Error => "error",
        }
    }
}

/// What the UI renders for the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackSnapshot {
    pub channel_id: Option<String>,
    pub resolved_url: Option<String>,
    pub status: PlaybackStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub muted: bool,
    pub fullscreen: bool,
    pub controls_visible: bool,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            channel_id: None,
            resolved_url: None,
            status: PlaybackStatus::Idle,
            retry_count: 0,
            error_message: None,
            muted: false,
            fullscreen: false,
            controls_visible: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    Ignore,
    /// Reload the manifest after the cooldown. `attempt` starts at 1.
    Retry { attempt: u32 },
    Fail,
}

/// One playback attempt. Transitions are plain methods so they can be
/// exercised without an engine.
#[derive(Debug, Clone)]
pub struct StreamSession {
    channel_id: String,
    resolved_url: Option<String>,
    status: PlaybackStatus,
    retry_count: u32,
    max_retries: u32,
    error_message: Option<String>,
    muted: bool,
}

impl StreamSession {
    pub fn new(channel_id: impl Into<String>, max_retries: u32) -> Self {
        Self {
            channel_id: channel_id.into(),
            resolved_url: None,
            status: PlaybackStatus::Loading,
            retry_count: 0,
            max_retries,
            error_message: None,
            muted: false,
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn resolved_url(&self) -> Option<&str> {
        self.resolved_url.as_deref()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn resolved(&mut self, url: impl Into<String>) {
        self.resolved_url = Some(url.into());
    }

    pub fn playing(&mut self, muted: bool) {
        self.set_status(PlaybackStatus::Playing);
        self.muted = muted;
        self.error_message = None;
    }

    pub fn paused(&mut self) {
        if self.status == PlaybackStatus::Playing {
            self.set_status(PlaybackStatus::Paused);
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn awaiting_gesture(&mut self) {
        self.set_status(PlaybackStatus::AwaitingGesture);
        self.error_message = Some("Tap to play".to_string());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.set_status(PlaybackStatus::Error);
        self.error_message = Some(message.into());
    }

    pub fn reload_succeeded(&mut self) {
        if self.retry_count > 0 {
            debug!(
                "Reload of {} succeeded after {} attempt(s)",
                self.channel_id, self.retry_count
            );
        }
        self.retry_count = 0;
    }

    /// Applies the retry policy to `error` and records the outcome.
    /// A session that already failed ignores further errors.
    pub fn on_error(&mut self, error: &EngineError) -> ErrorAction {
        if self.status == PlaybackStatus::Error {
            return ErrorAction::Ignore;
        }
        match error.class() {
            ErrorClass::Ignorable => ErrorAction::Ignore,
            ErrorClass::Transient if self.retry_count < self.max_retries => {
                self.retry_count += 1;
                self.set_status(PlaybackStatus::Loading);
                ErrorAction::Retry {
                    attempt: self.retry_count,
                }
            }
            ErrorClass::Transient => {
                self.fail(format!(
                    "Stream unavailable after {} retries. {}",
                    self.max_retries,
                    error.user_message()
                ));
                ErrorAction::Fail
            }
            ErrorClass::Fatal => {
                self.fail(error.user_message());
                ErrorAction::Fail
            }
        }
    }

    fn set_status(&mut self, status: PlaybackStatus) {
        if self.status != status {
            debug!(
                "Session {}: {} -> {}",
                self.channel_id,
                self.status.as_str(),
                status.as_str()
            );
            self.status = status;
        }
    }

    pub fn snapshot(&self, fullscreen: bool, controls_visible: bool) -> PlaybackSnapshot {
        PlaybackSnapshot {
            channel_id: Some(self.channel_id.clone()),
            resolved_url: self.resolved_url.clone(),
            status: self.status,
            retry_count: self.retry_count,
            error_message: self.error_message.clone(),
            muted: self.muted,
            fullscreen,
            controls_visible,
        }
    }
}
