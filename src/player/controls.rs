// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::session::PlaybackStatus;

/// Auto-hide timer for the on-screen controls.
#[derive(Debug, Clone)]
pub struct ControlsVisibility {
    visible: bool,
    hide_after: Duration,
    deadline: Option<Instant>,
}

impl ControlsVisibility {
    pub fn new(hide_after: Duration) -> Self {
        Self {
            visible: true,
            hide_after,
            deadline: None,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Any tap, key or pointer movement.
    pub fn interact(&mut self, status: PlaybackStatus, now: Instant) {
        self.visible = true;
        self.deadline = (status == PlaybackStatus::Playing).then(|| now + self.hide_after);
    }

    pub fn status_changed(&mut self, status: PlaybackStatus, now: Instant) {
        if status == PlaybackStatus::Playing {
            if self.visible && self.deadline.is_none() {
                self.deadline = Some(now + self.hide_after);
            }
        } else {
            self.visible = true;
            self.deadline = None;
        }
    }

    /// Hides the controls once the deadline has passed. Returns whether
    /// visibility changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                let changed = self.visible;
                self.visible = false;
                changed
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Landscape,
    Portrait,
}

/// Window or screen hosting the video.
pub trait DisplaySurface: Send + Sync {
    fn enter_fullscreen(&self) -> Result<(), String>;
    fn exit_fullscreen(&self) -> Result<(), String>;
    fn lock_orientation(&self, orientation: Orientation) -> Result<(), String>;
    fn unlock_orientation(&self);
}

/// For hosts without a window manager to talk to.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessDisplay;

impl DisplaySurface for HeadlessDisplay {
    fn enter_fullscreen(&self) -> Result<(), String> {
        Ok(())
    }

    fn exit_fullscreen(&self) -> Result<(), String> {
        Ok(())
    }

    fn lock_orientation(&self, _orientation: Orientation) -> Result<(), String> {
        Err("orientation lock not available".to_string())
    }

    fn unlock_orientation(&self) {}
}

/// Fullscreen with a landscape lock, undone when released or dropped.
pub struct FullscreenGuard {
    surface: Arc<dyn DisplaySurface>,
    released: bool,
}

impl FullscreenGuard {
    pub fn enter(surface: Arc<dyn DisplaySurface>) -> Result<Self, String> {
        surface.enter_fullscreen()?;
        if let Err(e) = surface.lock_orientation(Orientation::Landscape) {
            debug!("Orientation lock unavailable: {}", e);
        }
        Ok(Self {
            surface,
            released: false,
        })
    }

    pub fn release(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.surface.unlock_orientation();
        if let Err(e) = self.surface.exit_fullscreen() {
            debug!("Exiting fullscreen failed: {}", e);
        }
    }
}

impl Drop for FullscreenGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

impl std::fmt::Debug for FullscreenGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullscreenGuard")
            .field("released", &self.released)
            .finish()
    }
}
