// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ads::{AdItem, AdSource};
use crate::config::ApiConfig;
use crate::player::{StreamDescriptor, StreamResolver};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },
    #[error("malformed response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    /// `err_code != 0` in the response envelope.
    #[error("{message}")]
    Domain { code: i64, message: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeStatus {
    pub err_code: i64,
    #[serde(default)]
    pub err_msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub status: EnvelopeStatus,
    #[serde(default)]
    pub body: Value,
}

/// Decodes `{status: {err_code, err_msg}, body}` and returns `body` as `T`.
pub fn decode_envelope<T>(endpoint: &str, text: &str) -> Result<T, ApiError>
where
    T: DeserializeOwned,
{
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| ApiError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })?;

    if envelope.status.err_code != 0 {
        let message = envelope
            .status
            .err_msg
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("Request failed (code {})", envelope.status.err_code));
        return Err(ApiError::Domain {
            code: envelope.status.err_code,
            message,
        });
    }

    serde_json::from_value(envelope.body).map_err(|e| ApiError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamUrlBody {
    pub stream_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdListBody {
    #[serde(default)]
    pub ads: Vec<AdItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct PublicIp {
    ip: String,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    api_key: String,
    mobile: String,
    public_ip_url: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base = reqwest::Url::parse(&config.base_url).with_context(|| "Invalid API base URL")?;

        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .user_agent("Mozilla/5.0")
                .build()
                .with_context(|| "Failed to build HTTP client")?,
            base_url: base.as_str().trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            api_key: config.api_key.clone(),
            mobile: config.mobile.clone(),
            public_ip_url: config.public_ip_url.clone(),
        })
    }

    pub fn http_client(&self) -> &Client {
        &self.client
    }

    /// POSTs `fields` plus the identity key and decodes the envelope.
    pub async fn post<T>(&self, endpoint: &str, fields: Value) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));

        let mut body = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert("mobile".to_string(), Value::String(self.mobile.clone()));

        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status: response.status().as_u16(),
            });
        }

        let text = response.text().await.map_err(|source| ApiError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })?;

        if text.trim().is_empty() {
            return Err(ApiError::Decode {
                endpoint: endpoint.to_string(),
                message: "empty response".to_string(),
            });
        }

        decode_envelope(endpoint, &text)
    }

    /// Caller's public address, as the manifest endpoint expects it.
    pub async fn public_ip(&self) -> Result<String, ApiError> {
        let response = self
            .client
            .get(&self.public_ip_url)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                endpoint: self.public_ip_url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ApiError::Status {
                endpoint: self.public_ip_url.clone(),
                status: response.status().as_u16(),
            });
        }

        let ip: PublicIp = response.json().await.map_err(|e| ApiError::Decode {
            endpoint: self.public_ip_url.clone(),
            message: e.to_string(),
        })?;
        Ok(ip.ip)
    }

    pub async fn stream_url(
        &self,
        channel_id: &str,
        channel_number: Option<u32>,
        ip: &str,
    ) -> Result<String, ApiError> {
        let body: StreamUrlBody = self
            .post(
                "stream/url",
                json!({
                    "channel_id": channel_id,
                    "channel_number": channel_number,
                    "ip": ip,
                }),
            )
            .await?;
        Ok(body.stream_url)
    }

    pub async fn ads(&self, context: &str) -> Result<Vec<AdItem>, ApiError> {
        let body: AdListBody = self.post("ads/list", json!({ "context": context })).await?;
        Ok(body.ads)
    }
}

#[async_trait]
impl StreamResolver for ApiClient {
    async fn resolve(&self, descriptor: &StreamDescriptor) -> Result<String, String> {
        let ip = match self.public_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("Public IP lookup failed, continuing without it: {}", e);
                String::new()
            }
        };

        self.stream_url(&descriptor.channel_id, descriptor.channel_number, &ip)
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl AdSource for ApiClient {
    async fn fetch_ads(&self, context: &str) -> Result<Vec<AdItem>, String> {
        self.ads(context).await.map_err(|e| e.to_string())
    }
}
