// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::errors::EngineError;
use super::filters::{RequestFilter, ResponseFilter};
use crate::config::{BufferingConfig, PlaybackConfig, RetryConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryParameters {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub fuzz_factor: f64,
    pub timeout: Duration,
}

impl From<&RetryConfig> for RetryParameters {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_factor: config.backoff_factor,
            fuzz_factor: config.fuzz_factor,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferingGoals {
    pub buffering_goal: Duration,
    pub rebuffering_goal: Duration,
    pub buffer_behind: Duration,
}

impl From<&BufferingConfig> for BufferingGoals {
    fn from(config: &BufferingConfig) -> Self {
        Self {
            buffering_goal: Duration::from_secs(config.buffering_goal_secs),
            rebuffering_goal: Duration::from_secs(config.rebuffering_goal_secs),
            buffer_behind: Duration::from_secs(config.buffer_behind_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub retry: RetryParameters,
    pub buffering: BufferingGoals,
}

impl From<&PlaybackConfig> for EngineConfig {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            retry: RetryParameters::from(&config.retry),
            buffering: BufferingGoals::from(&config.buffering),
        }
    }
}

/// Notifications the engine pushes while a session is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    CanPlay,
    Playing,
    Paused,
    Error(EngineError),
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Why `play()` did not start playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayError {
    /// Superseded by a pause or a new load; not a failure.
    Aborted,
    /// Refused by autoplay policy or the device.
    NotAllowed(String),
}

/// The adaptive media player the controller drives. One instance serves one
/// session and is destroyed with it.
#[async_trait]
pub trait MediaEngine: Send {
    fn is_supported(&self) -> bool {
        true
    }

    async fn attach(&mut self, events: EventSender) -> Result<(), EngineError>;

    fn configure(&mut self, config: &EngineConfig);

    fn register_request_filter(&mut self, filter: Arc<dyn RequestFilter>);

    fn register_response_filter(&mut self, filter: Arc<dyn ResponseFilter>);

    /// Resolves once the manifest is loaded.
    async fn load(&mut self, manifest_url: &str) -> Result<(), EngineError>;

    async fn play(&mut self) -> Result<(), PlayError>;

    async fn pause(&mut self) -> Result<(), EngineError>;

    async fn set_muted(&mut self, muted: bool) -> Result<(), EngineError>;

    async fn destroy(&mut self);
}

pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Box<dyn MediaEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Box<dyn MediaEngine> + Send + Sync,
{
    fn create(&self) -> Box<dyn MediaEngine> {
        self()
    }
}
