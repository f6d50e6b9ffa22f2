// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

//! [`MediaEngine`] backed by an external mpv process driven over its JSON
//! IPC socket.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use url::Url;

use super::engine::{
    EngineConfig, EngineEvent, EngineFactory, EventSender, MediaEngine, PlayError,
};
use super::errors::{EngineError, EngineErrorKind};
use super::filters::{
    NetworkRequest, NetworkResponse, RequestFilter, RequestKind, ResponseFilter,
};

static SESSION_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Drives an mpv process over its JSON IPC socket.
///
/// Request filters only rewrite the manifest URL and its headers before the
/// load. Segment and key requests are made by mpv itself and reach the
/// network unfiltered, so proxied streams rely on the manifest pointing mpv
/// back at the proxy.
pub struct MpvEngine {
    client: reqwest::Client,
    proxy_origin: Option<Url>,
    socket_path: PathBuf,
    process: Option<Child>,
    request_filters: Vec<Arc<dyn RequestFilter>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
}

impl MpvEngine {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            proxy_origin: None,
            socket_path: Self::socket_path(),
            process: None,
            request_filters: Vec::new(),
            response_filters: Vec::new(),
        }
    }

    /// Origin of the local reverse proxy, used to resolve proxied paths.
    /// Only the manifest request passes through it; see [`MpvEngine`].
    pub fn with_proxy_origin(mut self, origin: Url) -> Self {
        self.proxy_origin = Some(origin);
        self
    }

    /// One socket per engine so overlapping sessions never share an mpv.
    fn socket_path() -> PathBuf {
        let base = dirs::runtime_dir()
            .or_else(dirs::state_dir)
            .unwrap_or_else(std::env::temp_dir);
        let dir = base.join("iptv-core");

        if !dir.exists() {
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!("Failed to create socket directory: {}", e);
                return std::env::temp_dir().join(Self::socket_name());
            }
            if let Err(e) = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)) {
                warn!("Failed to set permissions on socket directory: {}", e);
            }
        }

        dir.join(Self::socket_name())
    }

    fn socket_name() -> String {
        format!(
            "mpv-{}-{}.sock",
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn send_command(&self, command: Value) -> Result<Value> {
        let mut socket = UnixStream::connect(&self.socket_path).with_context(|| {
            format!("Failed to connect to MPV socket at {:?}", self.socket_path)
        })?;
        socket.set_read_timeout(Some(Duration::from_secs(5)))?;

        let command_str = serde_json::to_string(&command)?;
        debug!("Sending MPV command: {}", command_str);

        socket.write_all(command_str.as_bytes())?;
        socket.write_all(b"\n")?;

        // Events can arrive on any connection; skip to the reply.
        let reader = BufReader::new(socket);
        for line in reader.lines() {
            let line = line?;
            let parsed: Value = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse MPV response: {}", line))?;
            if parsed.get("event").is_some() {
                continue;
            }
            if let Some(error) = parsed.get("error").and_then(|e| e.as_str())
                && error != "success"
            {
                return Err(anyhow::anyhow!("MPV command failed: {}", error));
            }
            return Ok(parsed);
        }

        Err(anyhow::anyhow!("MPV closed the IPC connection"))
    }

    fn set_property(&self, name: &str, value: Value) -> Result<()> {
        self.send_command(json!({ "command": ["set_property", name, value] }))?;
        Ok(())
    }

    fn is_socket_ready(&self) -> bool {
        self.socket_path.exists() && UnixStream::connect(&self.socket_path).is_ok()
    }

    fn spawn_process(&self) -> Result<Child> {
        let mut cmd = Command::new("mpv");
        cmd.arg(format!("--input-ipc-server={}", self.socket_path.display()))
            .arg("--idle=yes")
            .arg("--pause=yes")
            .arg("--force-window=yes")
            .arg("--keep-open=no")
            .arg("--no-terminal")
            .arg("--osc=yes")
            .arg("--title=IPTV Player (MPV)")
            .arg("--geometry=1280x720")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        debug!("MPV command: {:?}", cmd);
        let mut child = cmd
            .spawn()
            .context("Failed to start MPV. Is MPV installed?")?;

        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines().map_while(Result::ok) {
                    debug!("MPV stderr: {}", line);
                }
            });
        }

        Ok(child)
    }

    /// Connects a second IPC client that forwards mpv events until the
    /// process goes away.
    fn watch_events(&self, events: EventSender) -> Result<()> {
        let mut socket = UnixStream::connect(&self.socket_path)
            .context("Failed to open MPV event connection")?;
        let observe = json!({ "command": ["observe_property", 1, "pause"] });
        socket.write_all(serde_json::to_string(&observe)?.as_bytes())?;
        socket.write_all(b"\n")?;

        thread::spawn(move || {
            let reader = BufReader::new(socket);
            for line in reader.lines().map_while(Result::ok) {
                if let Some(event) = parse_event(&line)
                    && events.send(event).is_err()
                {
                    break;
                }
            }
            debug!("MPV event stream closed");
        });

        Ok(())
    }

    fn request_uri(&self, manifest_url: &str) -> Result<(String, Vec<(String, String)>), EngineError> {
        let mut request = NetworkRequest::new(RequestKind::Manifest, manifest_url);
        for filter in &self.request_filters {
            filter.filter(&mut request);
        }

        let uri = request.uris.first().cloned().unwrap_or_default();
        let uri = resolve_uri(self.proxy_origin.as_ref(), &uri)?;
        Ok((uri, request.headers))
    }
}

/// Maps one line of mpv IPC output onto an engine event.
fn parse_event(line: &str) -> Option<EngineEvent> {
    let value: Value = serde_json::from_str(line).ok()?;

    match value.get("event")?.as_str()? {
        "file-loaded" => Some(EngineEvent::CanPlay),
        "end-file" if value.get("reason").and_then(Value::as_str) == Some("error") => {
            let reason = value
                .get("file_error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Some(EngineEvent::Error(EngineError::from_mpv_reason(reason)))
        }
        "property-change" if value.get("name").and_then(Value::as_str) == Some("pause") => {
            match value.get("data")?.as_bool()? {
                true => Some(EngineEvent::Paused),
                false => Some(EngineEvent::Playing),
            }
        }
        _ => None,
    }
}

/// mpv properties for `config`. mpv bounds its back buffer in bytes only,
/// so `buffer_behind` has no counterpart here.
fn engine_properties(config: &EngineConfig) -> Vec<(&'static str, Value)> {
    let goal = config.buffering.buffering_goal.as_secs();
    vec![
        ("network-timeout", json!(config.retry.timeout.as_secs_f64())),
        ("cache-secs", json!(goal)),
        ("demuxer-readahead-secs", json!(goal)),
        (
            "cache-pause-wait",
            json!(config.buffering.rebuffering_goal.as_secs()),
        ),
    ]
}

fn resolve_uri(origin: Option<&Url>, uri: &str) -> Result<String, EngineError> {
    if Url::parse(uri).is_ok() {
        return Ok(uri.to_string());
    }
    let origin = origin.ok_or_else(|| {
        EngineError::new(
            EngineErrorKind::Other,
            format!("no proxy origin to resolve {}", uri),
        )
    })?;
    origin
        .join(uri)
        .map(String::from)
        .map_err(|e| EngineError::new(EngineErrorKind::Other, e.to_string()))
}

/// mpv's `http-header-fields` list syntax.
fn header_fields(headers: &[(String, String)]) -> Vec<String> {
    headers
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect()
}

/// Fetches the manifest once so HTTP failures surface as engine errors
/// before mpv is asked to play it.
async fn preflight(
    client: &reqwest::Client,
    uri: &str,
    headers: &[(String, String)],
    filters: &[Arc<dyn ResponseFilter>],
) -> Result<(), EngineError> {
    let mut request = client.get(uri);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            EngineError::new(EngineErrorKind::Timeout, e.to_string())
        } else {
            EngineError::new(EngineErrorKind::Network, e.to_string())
        }
    })?;

    let status = response.status();
    let observed = NetworkResponse {
        kind: RequestKind::Manifest,
        uri: uri.to_string(),
        status: status.as_u16(),
    };
    for filter in filters {
        filter.filter(&observed)?;
    }

    if !status.is_success() {
        return Err(EngineError::bad_http_status(status.as_u16(), uri));
    }
    Ok(())
}

#[async_trait]
impl MediaEngine for MpvEngine {
    fn is_supported(&self) -> bool {
        Command::new("mpv")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn attach(&mut self, events: EventSender) -> Result<(), EngineError> {
        debug!("Launching MPV with IPC socket at {:?}", self.socket_path);
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }

        let child = self
            .spawn_process()
            .map_err(|e| EngineError::new(EngineErrorKind::Unsupported, format!("{:#}", e)))?;
        self.process = Some(child);

        for i in 0..20 {
            sleep(Duration::from_millis(500)).await;

            if let Some(proc) = self.process.as_mut()
                && let Ok(Some(status)) = proc.try_wait()
            {
                error!("MPV process exited unexpectedly with status: {:?}", status);
                self.process = None;
                return Err(EngineError::new(
                    EngineErrorKind::Other,
                    format!("mpv exited with {:?}", status),
                ));
            }

            if self.is_socket_ready() {
                debug!("MPV IPC socket ready after {} ms", (i + 1) * 500);
                return self
                    .watch_events(events)
                    .map_err(|e| EngineError::new(EngineErrorKind::Other, format!("{:#}", e)));
            }
        }

        error!("MPV IPC socket failed to start after 10 seconds");
        Err(EngineError::new(
            EngineErrorKind::Timeout,
            "mpv IPC socket did not come up",
        ))
    }

    fn configure(&mut self, config: &EngineConfig) {
        for (name, value) in engine_properties(config) {
            if let Err(e) = self.set_property(name, value) {
                debug!("Could not set {}: {}", name, e);
            }
        }
    }

    fn register_request_filter(&mut self, filter: Arc<dyn RequestFilter>) {
        self.request_filters.push(filter);
    }

    fn register_response_filter(&mut self, filter: Arc<dyn ResponseFilter>) {
        self.response_filters.push(filter);
    }

    async fn load(&mut self, manifest_url: &str) -> Result<(), EngineError> {
        let (uri, headers) = self.request_uri(manifest_url)?;
        preflight(&self.client, &uri, &headers, &self.response_filters).await?;

        if let Err(e) = self.set_property("http-header-fields", json!(header_fields(&headers))) {
            debug!("Could not set request headers: {}", e);
        }
        self.send_command(json!({ "command": ["loadfile", uri, "replace"] }))
            .map_err(|e| EngineError::new(EngineErrorKind::Other, format!("{:#}", e)))?;
        Ok(())
    }

    async fn play(&mut self) -> Result<(), PlayError> {
        self.set_property("pause", json!(false))
            .map_err(|e| PlayError::NotAllowed(e.to_string()))
    }

    async fn pause(&mut self) -> Result<(), EngineError> {
        self.set_property("pause", json!(true))
            .map_err(|e| EngineError::new(EngineErrorKind::Other, e.to_string()))
    }

    async fn set_muted(&mut self, muted: bool) -> Result<(), EngineError> {
        self.set_property("mute", json!(muted))
            .map_err(|e| EngineError::new(EngineErrorKind::Other, e.to_string()))
    }

    async fn destroy(&mut self) {
        debug!("Shutting down MPV engine");
        if self.is_socket_ready() {
            let _ = self.send_command(json!({ "command": ["quit"] }));
        }
        if let Some(mut child) = self.process.take() {
            for _ in 0..10 {
                if let Ok(Some(_)) = child.try_wait() {
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }
            let _ = child.kill();
            let _ = child.wait();
        }
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}

/// Creates a fresh [`MpvEngine`] for every session.
#[derive(Debug, Clone)]
pub struct MpvFactory {
    client: reqwest::Client,
    proxy_origin: Option<Url>,
}

impl MpvFactory {
    pub fn new(client: reqwest::Client, proxy_origin: Option<Url>) -> Self {
        Self {
            client,
            proxy_origin,
        }
    }
}

impl EngineFactory for MpvFactory {
    fn create(&self) -> Box<dyn MediaEngine> {
        let engine = MpvEngine::new(self.client.clone());
        match &self.proxy_origin {
            Some(origin) => Box::new(engine.with_proxy_origin(origin.clone())),
            None => Box::new(engine),
        }
    }
}

impl Drop for MpvEngine {
    fn drop(&mut self) {
        if let Some(mut child) = self.process.take() {
            debug!("Terminating MPV process on cleanup");
            let _ = child.kill();
            let _ = child.wait();
        }
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}
