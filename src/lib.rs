// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

pub mod ads;
pub mod api;
pub mod config;
pub mod images;
pub mod player;
pub mod store;

pub use ads::AdMetadataCache;
pub use api::ApiClient;
pub use config::Config;
pub use images::ImageCache;
pub use player::PlaybackController;
pub use store::{FileStore, KeyValueStore, MemoryStore};
