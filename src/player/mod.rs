// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

//! Playback controller: owns one streaming session at a time, from stream
//! URL resolution through engine setup, error recovery and teardown.

pub mod controls;
pub mod engine;
pub mod errors;
pub mod filters;
pub mod mpv;
pub mod session;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PlaybackConfig, ProxyConfig};
pub use controls::{ControlsVisibility, DisplaySurface, FullscreenGuard, HeadlessDisplay, Orientation};
pub use engine::{
    EngineConfig, EngineEvent, EngineFactory, EventSender, MediaEngine, PlayError,
    RetryParameters,
};
pub use errors::{EngineError, EngineErrorKind, ErrorClass, classify};
pub use filters::{AuthHeaders, ProxyRewriter, RetryableStatusFilter};
pub use session::{ErrorAction, PlaybackSnapshot, PlaybackStatus, StreamSession};

/// What to play: a channel whose manifest URL is looked up, or a known URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub channel_id: String,
    pub channel_number: Option<u32>,
    pub manifest_url: Option<String>,
}

impl StreamDescriptor {
    pub fn channel(channel_id: impl Into<String>, channel_number: Option<u32>) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_number,
            manifest_url: None,
        }
    }

    pub fn direct(channel_id: impl Into<String>, manifest_url: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_number: None,
            manifest_url: Some(manifest_url.into()),
        }
    }
}

/// Looks up the manifest URL for a channel.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(&self, descriptor: &StreamDescriptor) -> Result<String, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionCommand {
    SetMuted(bool),
    TogglePlay,
    Interact,
    EnterFullscreen,
    ExitFullscreen,
}

struct ActiveSession {
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

pub struct PlaybackController {
    config: PlaybackConfig,
    proxy: ProxyConfig,
    factory: Arc<dyn EngineFactory>,
    resolver: Option<Arc<dyn StreamResolver>>,
    display: Arc<dyn DisplaySurface>,
    state: Arc<watch::Sender<PlaybackSnapshot>>,
    active: Option<ActiveSession>,
    last_request: Option<(StreamDescriptor, AuthHeaders)>,
}

impl std::fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackController")
            .field("config", &self.config)
            .field("snapshot", &*self.state.borrow())
            .field("active", &self.active.is_some())
            .finish()
    }
}

impl PlaybackController {
    pub fn new(
        config: PlaybackConfig,
        proxy: ProxyConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let (state, _) = watch::channel(PlaybackSnapshot::default());
        Self {
            config,
            proxy,
            factory,
            resolver: None,
            display: Arc::new(HeadlessDisplay),
            state: Arc::new(state),
            active: None,
            last_request: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn StreamResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_display(mut self, display: Arc<dyn DisplaySurface>) -> Self {
        self.display = display;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.state.borrow().clone()
    }

    /// Starts a new session, tearing down the current one first.
    ///
    /// Failures after this point never surface as errors; they are reported
    /// through the snapshot's status and message.
    pub async fn initialize(&mut self, descriptor: StreamDescriptor, auth: Option<AuthHeaders>) {
        self.teardown().await;

        let auth = auth.unwrap_or_default();
        self.last_request = Some((descriptor.clone(), auth.clone()));

        info!("Starting playback of channel {}", descriptor.channel_id);

        let cancel = CancellationToken::new();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = SessionDriver {
            session: StreamSession::new(
                descriptor.channel_id.clone(),
                self.config.max_reload_attempts,
            ),
            controls: ControlsVisibility::new(self.config.controls_hide_after()),
            descriptor,
            auth,
            config: self.config.clone(),
            proxy: self.proxy.clone(),
            engine: self.factory.create(),
            engine_alive: false,
            resolver: self.resolver.clone(),
            display: self.display.clone(),
            fullscreen: None,
            cancel: cancel.clone(),
            state: self.state.clone(),
        };
        driver.publish();

        let task = tokio::spawn(driver.run(command_rx));
        self.active = Some(ActiveSession {
            cancel,
            commands,
            task,
        });
    }

    /// Re-runs the last `initialize` with a fresh retry budget.
    pub async fn retry(&mut self) {
        if let Some((descriptor, auth)) = self.last_request.clone() {
            self.initialize(descriptor, Some(auth)).await;
        }
    }

    /// Stops the session and releases the engine. Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        if let Err(e) = active.task.await {
            warn!("Playback session task ended abnormally: {}", e);
        }

        self.state.send_replace(PlaybackSnapshot::default());
        debug!("Playback session torn down");
    }

    fn send(&self, command: SessionCommand) {
        if let Some(active) = &self.active
            && active.commands.send(command).is_err()
        {
            debug!("Session is gone, dropping {:?}", command);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.send(SessionCommand::SetMuted(muted));
    }

    pub fn toggle_play(&self) {
        self.send(SessionCommand::TogglePlay);
    }

    pub fn interact(&self) {
        self.send(SessionCommand::Interact);
    }

    pub fn enter_fullscreen(&self) {
        self.send(SessionCommand::EnterFullscreen);
    }

    pub fn exit_fullscreen(&self) {
        self.send(SessionCommand::ExitFullscreen);
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        // The session task releases the engine once it sees the cancellation.
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}

enum StartError {
    Cancelled,
    Failed(String),
    Engine(EngineError),
}

/// Runs `fut` unless the session is cancelled first.
async fn guarded<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}

struct SessionDriver {
    session: StreamSession,
    controls: ControlsVisibility,
    descriptor: StreamDescriptor,
    auth: AuthHeaders,
    config: PlaybackConfig,
    proxy: ProxyConfig,
    engine: Box<dyn MediaEngine>,
    engine_alive: bool,
    resolver: Option<Arc<dyn StreamResolver>>,
    display: Arc<dyn DisplaySurface>,
    fullscreen: Option<FullscreenGuard>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<PlaybackSnapshot>>,
}

impl SessionDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let (events_tx, mut events) = mpsc::unbounded_channel();

        match self.start(events_tx).await {
            Ok(()) => {}
            Err(StartError::Cancelled) => {}
            Err(StartError::Failed(message)) => self.fail(message).await,
            Err(StartError::Engine(error)) => self.handle_error(error).await,
        }

        while !self.cancel.is_cancelled() {
            let deadline = self.controls.deadline();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = events.recv() => self.on_event(event).await,
                Some(command) = commands.recv() => self.on_command(command).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.controls.tick(Instant::now()) {
                        self.publish();
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn start(&mut self, events: EventSender) -> Result<(), StartError> {
        let url = match &self.descriptor.manifest_url {
            Some(url) => url.clone(),
            None => {
                let resolver = self.resolver.clone().ok_or_else(|| {
                    StartError::Failed("No stream source is available for this channel".to_string())
                })?;
                guarded(&self.cancel, resolver.resolve(&self.descriptor))
                    .await
                    .ok_or(StartError::Cancelled)?
                    .map_err(StartError::Failed)?
            }
        };

        debug!("Resolved {} to {}", self.descriptor.channel_id, url);
        self.session.resolved(url.clone());
        self.publish();

        if !self.engine.is_supported() {
            return Err(StartError::Engine(EngineError::new(
                EngineErrorKind::Unsupported,
                "engine reports no support",
            )));
        }

        self.engine_alive = true;
        guarded(&self.cancel, self.engine.attach(events))
            .await
            .ok_or(StartError::Cancelled)?
            .map_err(|e| StartError::Failed(e.user_message()))?;

        self.engine.configure(&EngineConfig::from(&self.config));
        self.engine.register_request_filter(Arc::new(ProxyRewriter::new(
            &self.proxy,
            self.auth.clone(),
        )));
        self.engine
            .register_response_filter(Arc::new(RetryableStatusFilter::new(
                self.config.retryable_statuses.clone(),
            )));

        guarded(&self.cancel, self.engine.load(&url))
            .await
            .ok_or(StartError::Cancelled)?
            .map_err(StartError::Engine)
    }

    async fn on_event(&mut self, event: EngineEvent) {
        if !self.engine_alive || self.session.status() == PlaybackStatus::Error {
            debug!("Dropping {:?} from a stopped engine", event);
            return;
        }
        match event {
            EngineEvent::CanPlay => self.autoplay().await,
            EngineEvent::Playing => {
                let muted = self.session.is_muted();
                self.session.playing(muted);
                self.status_changed();
            }
            EngineEvent::Paused => {
                self.session.paused();
                self.status_changed();
            }
            EngineEvent::Error(error) => self.handle_error(error).await,
        }
    }

    /// Unmuted first, muted as a fallback, then wait for a tap.
    async fn autoplay(&mut self) {
        if !matches!(
            self.session.status(),
            PlaybackStatus::Loading | PlaybackStatus::AwaitingGesture
        ) {
            return;
        }

        let Some(result) = guarded(&self.cancel, self.engine.play()).await else {
            return;
        };
        match result {
            Ok(()) => {
                self.session.playing(false);
                self.status_changed();
                return;
            }
            Err(PlayError::Aborted) => return,
            Err(PlayError::NotAllowed(reason)) => {
                debug!("Unmuted autoplay refused ({}), retrying muted", reason);
            }
        }

        if let Some(Err(e)) = guarded(&self.cancel, self.engine.set_muted(true)).await {
            debug!("Muting before autoplay failed: {}", e);
        }

        let Some(result) = guarded(&self.cancel, self.engine.play()).await else {
            return;
        };
        match result {
            Ok(()) => self.session.playing(true),
            Err(PlayError::Aborted) => return,
            Err(PlayError::NotAllowed(reason)) => {
                info!("Autoplay refused even when muted: {}", reason);
                self.session.set_muted(true);
                self.session.awaiting_gesture();
            }
        }
        self.status_changed();
    }

    async fn handle_error(&mut self, error: EngineError) {
        let mut error = error;

        loop {
            match self.session.on_error(&error) {
                ErrorAction::Ignore => {
                    debug!("Ignoring {}", error);
                    return;
                }
                ErrorAction::Fail => {
                    warn!("Playback failed: {}", error);
                    self.status_changed();
                    self.stop_engine().await;
                    return;
                }
                ErrorAction::Retry { attempt } => {
                    warn!(
                        "Transient stream error ({}), reload {}/{} in {:?}",
                        error,
                        attempt,
                        self.config.max_reload_attempts,
                        self.config.reload_cooldown()
                    );
                    self.status_changed();

                    if guarded(&self.cancel, sleep(self.config.reload_cooldown()))
                        .await
                        .is_none()
                    {
                        return;
                    }

                    let Some(url) = self.session.resolved_url().map(str::to_string) else {
                        return;
                    };
                    match guarded(&self.cancel, self.engine.load(&url)).await {
                        None => return,
                        Some(Ok(())) => {
                            self.session.reload_succeeded();
                            self.publish();
                            return;
                        }
                        Some(Err(next)) => error = next,
                    }
                }
            }
        }
    }

    async fn fail(&mut self, message: String) {
        warn!("Playback failed: {}", message);
        self.session.fail(message);
        self.status_changed();
        self.stop_engine().await;
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Interact => {
                self.controls.interact(self.session.status(), Instant::now());
            }
            SessionCommand::SetMuted(muted) => {
                if !self.engine_alive {
                    return;
                }
                match guarded(&self.cancel, self.engine.set_muted(muted)).await {
                    Some(Ok(())) => self.session.set_muted(muted),
                    Some(Err(e)) => debug!("Changing mute failed: {}", e),
                    None => return,
                }
            }
            SessionCommand::TogglePlay => {
                if !self.engine_alive {
                    return;
                }
                self.toggle_play().await;
                self.controls.interact(self.session.status(), Instant::now());
            }
            SessionCommand::EnterFullscreen => {
                if self.fullscreen.is_none() {
                    match FullscreenGuard::enter(self.display.clone()) {
                        Ok(guard) => self.fullscreen = Some(guard),
                        Err(e) => debug!("Fullscreen request failed: {}", e),
                    }
                }
            }
            SessionCommand::ExitFullscreen => {
                if let Some(guard) = self.fullscreen.take() {
                    guard.release();
                }
            }
        }
        self.publish();
    }

    async fn toggle_play(&mut self) {
        match self.session.status() {
            PlaybackStatus::Playing => {
                match guarded(&self.cancel, self.engine.pause()).await {
                    Some(Ok(())) => self.session.paused(),
                    Some(Err(e)) => debug!("Pause failed: {}", e),
                    None => return,
                }
            }
            PlaybackStatus::Paused | PlaybackStatus::AwaitingGesture => {
                match guarded(&self.cancel, self.engine.play()).await {
                    Some(Ok(())) => {
                        let muted = self.session.is_muted();
                        self.session.playing(muted);
                    }
                    Some(Err(e)) => debug!("Play failed: {:?}", e),
                    None => return,
                }
            }
            _ => return,
        }
        self.status_changed();
    }

    fn status_changed(&mut self) {
        self.controls
            .status_changed(self.session.status(), Instant::now());
        self.publish();
    }

    fn publish(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let snapshot = self
            .session
            .snapshot(self.fullscreen.is_some(), self.controls.is_visible());
        self.state.send_replace(snapshot);
    }

    async fn stop_engine(&mut self) {
        if self.engine_alive {
            self.engine_alive = false;
            self.engine.destroy().await;
        }
    }

    async fn shutdown(&mut self) {
        if let Some(guard) = self.fullscreen.take() {
            guard.release();
        }
        self.stop_engine().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::filters::{NetworkRequest, RequestFilter, RequestKind, ResponseFilter};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum LoadStep {
        Ok,
        Fail(EngineError),
        Hang,
    }

    #[derive(Default)]
    struct Script {
        loads: VecDeque<LoadStep>,
        plays: VecDeque<Result<(), PlayError>>,
    }

    #[derive(Default)]
    struct Shared {
        log: Mutex<Vec<String>>,
        script: Mutex<Script>,
        events: Mutex<Option<EventSender>>,
        request_filters: Mutex<Vec<Arc<dyn RequestFilter>>>,
        loads: AtomicUsize,
        created: AtomicUsize,
    }

    impl Shared {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn emit(&self, event: EngineEvent) {
            self.events
                .lock()
                .unwrap()
                .as_ref()
                .expect("engine not attached")
                .send(event)
                .unwrap();
        }

        /// Sends through the most recent sender, which may outlive its session.
        fn emit_late(&self, event: EngineEvent) {
            if let Some(events) = self.events.lock().unwrap().as_ref() {
                let _ = events.send(event);
            }
        }

        fn sender(&self) -> EventSender {
            self.events.lock().unwrap().clone().expect("engine not attached")
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    struct FakeEngine {
        id: usize,
        shared: Arc<Shared>,
    }

    impl FakeEngine {
        fn record(&self, what: &str) {
            self.shared
                .log
                .lock()
                .unwrap()
                .push(format!("{}#{}", what, self.id));
        }
    }

    #[async_trait]
    impl MediaEngine for FakeEngine {
        async fn attach(&mut self, events: EventSender) -> Result<(), EngineError> {
            self.record("attach");
            *self.shared.events.lock().unwrap() = Some(events);
            Ok(())
        }

        fn configure(&mut self, config: &EngineConfig) {
            assert_eq!(config.retry.max_attempts, 5);
            self.record("configure");
        }

        fn register_request_filter(&mut self, filter: Arc<dyn RequestFilter>) {
            self.shared.request_filters.lock().unwrap().push(filter);
        }

        fn register_response_filter(&mut self, _filter: Arc<dyn ResponseFilter>) {}

        async fn load(&mut self, _manifest_url: &str) -> Result<(), EngineError> {
            self.shared.loads.fetch_add(1, Ordering::SeqCst);
            self.record("load");
            let step = self
                .shared
                .script
                .lock()
                .unwrap()
                .loads
                .pop_front()
                .unwrap_or(LoadStep::Ok);
            match step {
                LoadStep::Ok => Ok(()),
                LoadStep::Fail(e) => Err(e),
                LoadStep::Hang => std::future::pending().await,
            }
        }

        async fn play(&mut self) -> Result<(), PlayError> {
            self.record("play");
            self.shared
                .script
                .lock()
                .unwrap()
                .plays
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn pause(&mut self) -> Result<(), EngineError> {
            self.record("pause");
            Ok(())
        }

        async fn set_muted(&mut self, muted: bool) -> Result<(), EngineError> {
            self.record(if muted { "mute" } else { "unmute" });
            Ok(())
        }

        async fn destroy(&mut self) {
            self.record("destroy");
        }
    }

    #[derive(Default)]
    struct RecordingDisplay {
        calls: Mutex<Vec<&'static str>>,
    }

    impl DisplaySurface for RecordingDisplay {
        fn enter_fullscreen(&self) -> Result<(), String> {
            self.calls.lock().unwrap().push("enter");
            Ok(())
        }

        fn exit_fullscreen(&self) -> Result<(), String> {
            self.calls.lock().unwrap().push("exit");
            Ok(())
        }

        fn lock_orientation(&self, orientation: Orientation) -> Result<(), String> {
            assert_eq!(orientation, Orientation::Landscape);
            self.calls.lock().unwrap().push("lock");
            Ok(())
        }

        fn unlock_orientation(&self) {
            self.calls.lock().unwrap().push("unlock");
        }
    }

    struct FixedResolver(Result<String, String>);

    #[async_trait]
    impl StreamResolver for FixedResolver {
        async fn resolve(&self, _descriptor: &StreamDescriptor) -> Result<String, String> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.0.clone()
        }
    }

    fn controller(shared: &Arc<Shared>) -> PlaybackController {
        let factory_shared = shared.clone();
        let factory = move || -> Box<dyn MediaEngine> {
            let id = factory_shared.created.fetch_add(1, Ordering::SeqCst) + 1;
            Box::new(FakeEngine {
                id,
                shared: factory_shared.clone(),
            })
        };
        PlaybackController::new(
            PlaybackConfig::default(),
            ProxyConfig {
                upstream_prefix: "http://cdn.example.com".to_string(),
                local_path: "/stream-proxy".to_string(),
                ..ProxyConfig::default()
            },
            Arc::new(factory),
        )
    }

    fn direct(channel: &str) -> StreamDescriptor {
        StreamDescriptor::direct(channel, format!("http://cdn.example.com/{}/manifest.mpd", channel))
    }

    async fn wait_for(
        controller: &PlaybackController,
        pred: impl FnMut(&PlaybackSnapshot) -> bool,
    ) -> PlaybackSnapshot {
        let mut rx = controller.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(pred))
            .await
            .expect("timed out waiting for playback state")
            .unwrap()
            .clone();
        snapshot
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn transient() -> EngineError {
        EngineError::from_code(1001, "HTTP 503")
    }

    #[tokio::test(start_paused = true)]
    async fn plays_after_can_play() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        assert_eq!(controller.snapshot().status, PlaybackStatus::Loading);

        shared.emit(EngineEvent::CanPlay);
        let snapshot = wait_for(&controller, |s| s.status == PlaybackStatus::Playing).await;
        assert!(!snapshot.muted);
        assert_eq!(snapshot.channel_id.as_deref(), Some("ch1"));
        assert_eq!(
            shared.log(),
            vec!["attach#1", "configure#1", "load#1", "play#1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_twice_is_harmless() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;

        controller.teardown().await;
        controller.teardown().await;

        let destroys = shared.log().iter().filter(|l| l.starts_with("destroy")).count();
        assert_eq!(destroys, 1);
        assert_eq!(controller.snapshot().status, PlaybackStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn reinitialize_destroys_previous_engine_first() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("a"), None).await;
        settle().await;
        controller.initialize(direct("b"), None).await;
        settle().await;

        let log = shared.log();
        let destroy_a = log.iter().position(|l| l == "destroy#1").unwrap();
        let attach_b = log.iter().position(|l| l == "attach#2").unwrap();
        assert!(destroy_a < attach_b);
        assert_eq!(controller.snapshot().channel_id.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_mid_load_releases_engine() {
        let shared = Arc::new(Shared::default());
        shared.script.lock().unwrap().loads.push_back(LoadStep::Hang);
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        controller.teardown().await;

        assert_eq!(
            shared.log(),
            vec!["attach#1", "configure#1", "load#1", "destroy#1"]
        );
        assert_eq!(controller.snapshot(), PlaybackSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_reloads_once_after_cooldown() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        shared.emit(EngineEvent::CanPlay);
        wait_for(&controller, |s| s.status == PlaybackStatus::Playing).await;

        shared.emit(transient_event());
        let snapshot = wait_for(&controller, |s| s.retry_count == 1).await;
        assert_eq!(snapshot.status, PlaybackStatus::Loading);
        assert_eq!(shared.loads(), 1);

        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert_eq!(shared.loads(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(shared.loads(), 2);
        assert_eq!(controller.snapshot().retry_count, 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(shared.loads(), 2);
    }

    fn transient_event() -> EngineEvent {
        EngineEvent::Error(transient())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_terminal() {
        let shared = Arc::new(Shared::default());
        {
            let mut script = shared.script.lock().unwrap();
            script.loads.push_back(LoadStep::Ok);
            for _ in 0..4 {
                script.loads.push_back(LoadStep::Fail(transient()));
            }
        }
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        shared.emit(transient_event());

        let snapshot = wait_for(&controller, |s| s.status == PlaybackStatus::Error).await;
        assert_eq!(shared.loads(), 5);
        assert_eq!(snapshot.retry_count, 4);
        assert!(
            snapshot
                .error_message
                .unwrap()
                .starts_with("Stream unavailable after 4 retries")
        );
        assert!(shared.log().contains(&"destroy#1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_load_failure_goes_through_retry_policy() {
        let shared = Arc::new(Shared::default());
        shared
            .script
            .lock()
            .unwrap()
            .loads
            .push_back(LoadStep::Fail(EngineError::from_code(1003, "timeout")));
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        wait_for(&controller, |s| s.retry_count == 1).await;
        tokio::time::sleep(Duration::from_millis(1600)).await;

        assert_eq!(shared.loads(), 2);
        assert_eq!(controller.snapshot().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_load_is_silent() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        shared.emit(EngineEvent::CanPlay);
        let before = wait_for(&controller, |s| s.status == PlaybackStatus::Playing).await;

        shared.emit(EngineEvent::Error(EngineError::from_code(7000, "interrupted")));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let after = controller.snapshot();
        assert_eq!(after.status, before.status);
        assert!(after.error_message.is_none());
        assert_eq!(shared.loads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_error_is_fatal_immediately() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        shared.emit(EngineEvent::Error(EngineError::from_code(3016, "decode")));

        let snapshot = wait_for(&controller, |s| s.status == PlaybackStatus::Error).await;
        assert_eq!(snapshot.retry_count, 0);
        assert!(snapshot.controls_visible);
        assert_eq!(shared.loads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_session_ignores_late_engine_events() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        shared.emit(EngineEvent::Error(EngineError::from_code(3016, "decode")));
        let failed = wait_for(&controller, |s| s.status == PlaybackStatus::Error).await;

        shared.emit(transient_event());
        shared.emit(EngineEvent::CanPlay);
        shared.emit(EngineEvent::Playing);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let after = controller.snapshot();
        assert_eq!(after.status, PlaybackStatus::Error);
        assert_eq!(after.error_message, failed.error_message);
        assert_eq!(after.retry_count, 0);
        assert_eq!(shared.loads(), 1);
        assert_eq!(
            shared.log(),
            vec!["attach#1", "configure#1", "load#1", "destroy#1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn events_after_teardown_change_nothing() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        controller.teardown().await;

        shared.emit_late(transient_event());
        shared.emit_late(EngineEvent::CanPlay);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(controller.snapshot(), PlaybackSnapshot::default());
        assert_eq!(shared.loads(), 1);
        assert_eq!(
            shared.log(),
            vec!["attach#1", "configure#1", "load#1", "destroy#1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn previous_engine_events_do_not_reach_new_session() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("a"), None).await;
        settle().await;
        let stale = shared.sender();

        controller.initialize(direct("b"), None).await;
        settle().await;
        let _ = stale.send(EngineEvent::Error(EngineError::from_code(3016, "decode")));
        let _ = stale.send(EngineEvent::CanPlay);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.channel_id.as_deref(), Some("b"));
        assert_eq!(snapshot.status, PlaybackStatus::Loading);
        assert!(snapshot.error_message.is_none());
        assert!(!shared.log().contains(&"play#2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn autoplay_falls_back_to_muted() {
        let shared = Arc::new(Shared::default());
        shared
            .script
            .lock()
            .unwrap()
            .plays
            .push_back(Err(PlayError::NotAllowed("policy".to_string())));
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        shared.emit(EngineEvent::CanPlay);

        let snapshot = wait_for(&controller, |s| s.status == PlaybackStatus::Playing).await;
        assert!(snapshot.muted);
        assert!(shared.log().ends_with(&[
            "play#1".to_string(),
            "mute#1".to_string(),
            "play#1".to_string()
        ]));
    }

    #[tokio::test(start_paused = true)]
    async fn autoplay_refused_twice_waits_for_tap() {
        let shared = Arc::new(Shared::default());
        {
            let mut script = shared.script.lock().unwrap();
            script.plays.push_back(Err(PlayError::NotAllowed("policy".to_string())));
            script.plays.push_back(Err(PlayError::NotAllowed("policy".to_string())));
        }
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        shared.emit(EngineEvent::CanPlay);

        let snapshot =
            wait_for(&controller, |s| s.status == PlaybackStatus::AwaitingGesture).await;
        assert_eq!(snapshot.error_message.as_deref(), Some("Tap to play"));

        controller.toggle_play();
        wait_for(&controller, |s| s.status == PlaybackStatus::Playing).await;
    }

    #[tokio::test(start_paused = true)]
    async fn controls_hide_after_idle_while_playing() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        shared.emit(EngineEvent::CanPlay);
        wait_for(&controller, |s| s.status == PlaybackStatus::Playing).await;
        assert!(controller.snapshot().controls_visible);

        tokio::time::sleep(Duration::from_millis(3900)).await;
        assert!(controller.snapshot().controls_visible);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!controller.snapshot().controls_visible);

        controller.interact();
        wait_for(&controller, |s| s.controls_visible).await;

        controller.toggle_play();
        let paused = wait_for(&controller, |s| s.status == PlaybackStatus::Paused).await;
        assert!(paused.controls_visible);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(controller.snapshot().controls_visible);
    }

    #[tokio::test(start_paused = true)]
    async fn fullscreen_is_released_on_teardown() {
        let shared = Arc::new(Shared::default());
        let display = Arc::new(RecordingDisplay::default());
        let mut controller = controller(&shared).with_display(display.clone());

        controller.initialize(direct("ch1"), None).await;
        controller.enter_fullscreen();
        wait_for(&controller, |s| s.fullscreen).await;

        controller.teardown().await;
        assert_eq!(
            *display.calls.lock().unwrap(),
            vec!["enter", "lock", "unlock", "exit"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resolver_failure_surfaces_message() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared)
            .with_resolver(Arc::new(FixedResolver(Err("Subscription expired".to_string()))));

        controller
            .initialize(StreamDescriptor::channel("42", Some(7)), None)
            .await;
        let snapshot = wait_for(&controller, |s| s.status == PlaybackStatus::Error).await;

        assert_eq!(snapshot.error_message.as_deref(), Some("Subscription expired"));
        assert!(shared.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_url_is_proxied_with_auth_headers() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared).with_resolver(Arc::new(FixedResolver(Ok(
            "http://cdn.example.com/live/42.mpd".to_string(),
        ))));

        controller
            .initialize(
                StreamDescriptor::channel("42", None),
                Some(AuthHeaders::new().with("X-Token", "abc")),
            )
            .await;
        let snapshot = wait_for(&controller, |s| s.resolved_url.is_some()).await;
        assert_eq!(
            snapshot.resolved_url.as_deref(),
            Some("http://cdn.example.com/live/42.mpd")
        );
        settle().await;

        let filters = shared.request_filters.lock().unwrap();
        let mut request = NetworkRequest::new(
            RequestKind::Manifest,
            "http://cdn.example.com/live/42.mpd",
        );
        filters[0].filter(&mut request);
        assert_eq!(request.uris, vec!["/stream-proxy/live/42.mpd".to_string()]);
        assert_eq!(
            request.headers,
            vec![("X-Token".to_string(), "abc".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_starts_a_fresh_session() {
        let shared = Arc::new(Shared::default());
        let mut controller = controller(&shared);

        controller.initialize(direct("ch1"), None).await;
        settle().await;
        shared.emit(EngineEvent::Error(EngineError::from_code(4001, "bad manifest")));
        wait_for(&controller, |s| s.status == PlaybackStatus::Error).await;

        controller.retry().await;
        settle().await;
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, PlaybackStatus::Loading);
        assert!(snapshot.error_message.is_none());
        assert!(shared.log().contains(&"attach#2".to_string()));
    }
}
