// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

//! Media engine errors and how the controller treats them.
//!
//! This is the only place that knows the engine's numeric error codes.

use std::fmt;

// Numeric codes reported by adaptive-streaming engines (network 1xxx,
// media 3xxx, manifest 4xxx, DRM 6xxx, player 7xxx).
const BAD_HTTP_STATUS: u32 = 1001;
const HTTP_ERROR: u32 = 1002;
const TIMEOUT: u32 = 1003;
const BROWSER_NOT_SUPPORTED: u32 = 1999;
const LOAD_INTERRUPTED: u32 = 7000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// A load was superseded by teardown or another load.
    LoadInterrupted,
    BadHttpStatus { status: Option<u16> },
    Timeout,
    /// Connection refused, DNS, CORS block and similar.
    Network,
    Decode,
    Manifest,
    Drm,
    Unsupported,
    Other,
}

/// How the controller reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Ignorable,
    Transient,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub code: u32,
    pub detail: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, detail: impl Into<String>) -> Self {
        let code = match kind {
            EngineErrorKind::LoadInterrupted => LOAD_INTERRUPTED,
            EngineErrorKind::BadHttpStatus { .. } => BAD_HTTP_STATUS,
            EngineErrorKind::Timeout => TIMEOUT,
            EngineErrorKind::Network => HTTP_ERROR,
            EngineErrorKind::Decode => 3016,
            EngineErrorKind::Manifest => 4000,
            EngineErrorKind::Drm => 6000,
            EngineErrorKind::Unsupported => BROWSER_NOT_SUPPORTED,
            EngineErrorKind::Other => 0,
        };
        Self {
            kind,
            code,
            detail: detail.into(),
        }
    }

    /// Maps an engine's numeric error code onto [`EngineErrorKind`].
    pub fn from_code(code: u32, detail: impl Into<String>) -> Self {
        let kind = match code {
            LOAD_INTERRUPTED => EngineErrorKind::LoadInterrupted,
            BAD_HTTP_STATUS => EngineErrorKind::BadHttpStatus { status: None },
            TIMEOUT => EngineErrorKind::Timeout,
            BROWSER_NOT_SUPPORTED => EngineErrorKind::Unsupported,
            1000..=1998 => EngineErrorKind::Network,
            3000..=3999 => EngineErrorKind::Decode,
            4000..=4999 => EngineErrorKind::Manifest,
            6000..=6999 => EngineErrorKind::Drm,
            _ => EngineErrorKind::Other,
        };
        Self {
            kind,
            code,
            detail: detail.into(),
        }
    }

    pub fn bad_http_status(status: u16, uri: &str) -> Self {
        Self::new(
            EngineErrorKind::BadHttpStatus {
                status: Some(status),
            },
            format!("HTTP {} from {}", status, uri),
        )
    }

    /// Maps mpv's `end-file` error reason.
    pub fn from_mpv_reason(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        let kind = if lower.contains("loading failed") || lower.contains("http") {
            EngineErrorKind::BadHttpStatus { status: None }
        } else if lower.contains("timeout") || lower.contains("timed out") {
            EngineErrorKind::Timeout
        } else if lower.contains("unrecognized file format") || lower.contains("no audio or video")
        {
            EngineErrorKind::Decode
        } else {
            EngineErrorKind::Other
        };
        Self::new(kind, reason)
    }

    pub fn class(&self) -> ErrorClass {
        classify(&self.kind)
    }

    /// Short text for the player's error overlay.
    pub fn user_message(&self) -> String {
        let summary = match &self.kind {
            EngineErrorKind::LoadInterrupted => "Loading was interrupted",
            EngineErrorKind::BadHttpStatus { .. } => "The stream server returned an error",
            EngineErrorKind::Timeout => "The stream took too long to respond",
            EngineErrorKind::Network => {
                "Could not reach the stream (network or cross-origin block)"
            }
            EngineErrorKind::Decode => "This stream could not be decoded",
            EngineErrorKind::Manifest => "The stream manifest is invalid",
            EngineErrorKind::Drm => "This stream is protected and cannot be played",
            EngineErrorKind::Unsupported => "Playback is not supported on this device",
            EngineErrorKind::Other => "Playback failed",
        };
        format!("{} (code {})", summary, self.code)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "engine error {}", self.code)
        } else {
            write!(f, "engine error {}: {}", self.code, self.detail)
        }
    }
}

impl std::error::Error for EngineError {}

pub fn classify(kind: &EngineErrorKind) -> ErrorClass {
    match kind {
        EngineErrorKind::LoadInterrupted => ErrorClass::Ignorable,
        EngineErrorKind::BadHttpStatus { .. } | EngineErrorKind::Timeout => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}
