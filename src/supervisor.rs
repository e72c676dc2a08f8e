use crate::{
    catalog::Catalog,
    error::{Result, SyncError},
    session::{Session, SessionEffect, SessionEvent, SessionOptions},
    sink::ResultSink,
    transport::{Transport, TransportEvent},
    types::{SessionResult, SyncConfig},
};
use chrono::Utc;
use std::{fmt, sync::Arc};
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

/// Coarse lifecycle of a [`Supervisor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Not scanning, no session
    Stopped,
    /// Waiting for the target console to be discovered
    Scanning,
    /// Connection attempt in flight
    Connecting,
    /// Session exchanging frames with the console
    SessionActive,
    /// Quiet period after a session
    Cooldown,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::SessionActive => write!(f, "Session Active"),
            Self::Cooldown => write!(f, "Cooldown"),
        }
    }
}

/// Control message for a running [`Supervisor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Start or stop listening for the console
    SetListening(bool),
    /// Stop listening and exit the run loop
    Shutdown,
}

/// Cloneable handle controlling a [`Supervisor::run`] loop
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl SupervisorHandle {
    /// Create a handle and the receiving end to pass to [`Supervisor::run`]
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Control>) {
        let (control, receiver) = mpsc::unbounded_channel();
        (Self { control }, receiver)
    }

    /// Start or stop listening
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Protocol`] if the supervisor has exited.
    pub fn set_listening(&self, listening: bool) -> Result<()> {
        self.send(Control::SetListening(listening))
    }

    /// Stop the supervisor
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Protocol`] if the supervisor has already exited.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Control::Shutdown)
    }

    fn send(&self, message: Control) -> Result<()> {
        self.control
            .send(message)
            .map_err(|_| SyncError::Protocol("supervisor is not running".to_string()))
    }
}

struct ActiveSession<D> {
    device: D,
    session: Session,
}

/// Drives discovery, sessions, and result delivery for one console at a time
///
/// The supervisor is a single-threaded state machine fed by transport events.
/// It keeps at most one [`Session`] alive, disconnects after every session,
/// waits out a cooldown before scanning again, and forwards only results that
/// recorded steps. Downstream failures are logged, never propagated.
///
/// ```text
/// Stopped <-> Scanning -> Connecting -> SessionActive -> Cooldown -> Scanning
/// ```
pub struct Supervisor<T: Transport, S: ResultSink> {
    transport: T,
    sink: S,
    config: SyncConfig,
    catalog: Arc<Catalog>,
    state: SupervisorState,
    listening: bool,
    adapter_ready: bool,
    active: Option<ActiveSession<T::Device>>,
    cooldown_until: Option<Instant>,
}

impl<T: Transport, S: ResultSink> Supervisor<T, S> {
    /// Create a supervisor with the LifeSpan command catalog
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Encoding`] if the catalog cannot be built.
    pub fn new(transport: T, sink: S, config: SyncConfig) -> Result<Self> {
        let mut catalog = Catalog::lifespan()?;
        if config.diagnostic_queries {
            catalog = catalog.with_diagnostics();
        }
        Ok(Self::with_catalog(transport, sink, config, catalog))
    }

    /// Create a supervisor with an explicit catalog
    #[must_use]
    pub fn with_catalog(transport: T, sink: S, config: SyncConfig, catalog: Catalog) -> Self {
        Self {
            transport,
            sink,
            config,
            catalog: Arc::new(catalog),
            state: SupervisorState::Stopped,
            listening: false,
            adapter_ready: false,
            active: None,
            cooldown_until: None,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Whether the supervisor is listening
    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.listening
    }

    /// Whether a session is in progress
    #[must_use]
    pub const fn has_active_session(&self) -> bool {
        self.active.is_some()
    }

    /// When the current cooldown ends
    #[must_use]
    pub const fn cooldown_deadline(&self) -> Option<Instant> {
        self.cooldown_until
    }

    /// Underlying transport
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Result sink
    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Start or stop listening for the console
    ///
    /// Stopping cancels any scan, session, or cooldown in progress.
    pub async fn set_listening(&mut self, listening: bool) {
        if listening == self.listening {
            return;
        }
        self.listening = listening;

        if listening {
            info!("Listening for {}", self.config.target_name);
            self.start_scanning().await;
        } else {
            info!("Stopped listening");
            self.stop_all().await;
        }
    }

    /// Process one transport event
    pub async fn handle_event(&mut self, event: TransportEvent<T::Device>) {
        match event {
            TransportEvent::AdapterStateChanged { ready } => self.on_adapter_state(ready).await,
            TransportEvent::Discovered { device, name } => self.on_discovered(device, name).await,
            TransportEvent::Connected(device) => {
                if self.is_active(&device) && self.state == SupervisorState::Connecting {
                    info!("Connected to {:?}", device);
                    self.state = SupervisorState::SessionActive;
                }
            }
            TransportEvent::Subscribed(device) => {
                if self.is_active(&device) {
                    self.state = SupervisorState::SessionActive;
                    self.drive(SessionEvent::Subscribed).await;
                }
            }
            TransportEvent::ValueUpdated { device, value } => {
                if self.is_active(&device) {
                    debug!("Received {:02X?}", &value[..]);
                    self.drive(SessionEvent::Response(value)).await;
                } else {
                    debug!("Ignoring value from inactive device {:?}", device);
                }
            }
            TransportEvent::Disconnected(device) => {
                if self.is_active(&device) {
                    warn!("Device {:?} disconnected mid-session", device);
                    self.drive(SessionEvent::Disconnected).await;
                }
            }
        }
    }

    /// End the cooldown and resume scanning if still listening
    pub async fn cooldown_elapsed(&mut self) {
        if self.state != SupervisorState::Cooldown {
            return;
        }

        debug!("Cooldown elapsed");
        self.cooldown_until = None;
        self.state = SupervisorState::Stopped;
        self.start_scanning().await;
    }

    /// Run until shut down
    ///
    /// Multiplexes transport events, control messages, and the cooldown
    /// timer. Dropping every [`SupervisorHandle`] also shuts the loop down.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent<T::Device>>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        info!("Supervisor started");
        loop {
            let deadline = self.cooldown_until;
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event).await,
                message = control.recv() => match message {
                    Some(Control::SetListening(listening)) => self.set_listening(listening).await,
                    Some(Control::Shutdown) | None => {
                        self.set_listening(false).await;
                        break;
                    }
                },
                () = wait_until(deadline) => self.cooldown_elapsed().await,
            }
        }
        info!("Supervisor stopped");
    }

    async fn on_adapter_state(&mut self, ready: bool) {
        self.adapter_ready = ready;
        if ready {
            debug!("Adapter ready");
            self.start_scanning().await;
        } else {
            warn!("Adapter unavailable");
            if self.active.is_some() {
                // Losing the radio ends the session like any other abort
                self.drive(SessionEvent::Disconnected).await;
            } else if self.state != SupervisorState::Cooldown {
                self.state = SupervisorState::Stopped;
            }
        }
    }

    async fn on_discovered(&mut self, device: T::Device, name: Option<String>) {
        if !self.listening || self.state != SupervisorState::Scanning {
            return;
        }
        if name.as_deref() != Some(self.config.target_name.as_str()) {
            debug!("Ignoring {:?} ({:?})", device, name);
            return;
        }

        info!("Found {} at {:?}", self.config.target_name, device);
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let session = Session::new(
            Arc::clone(&self.catalog),
            SessionOptions::from(&self.config),
            Utc::now(),
        );
        self.active = Some(ActiveSession {
            device: device.clone(),
            session,
        });
        self.state = SupervisorState::Connecting;

        if let Err(e) = self.transport.connect(&device).await {
            warn!("Failed to connect to {:?}: {}", device, e);
            self.end_session().await;
        }
    }

    async fn drive(&mut self, event: SessionEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let device = active.device.clone();
        let effects = active.session.handle(event);

        for effect in effects {
            match effect {
                SessionEffect::Write { channel, frame } => {
                    if let Err(e) = self.transport.write(&device, channel, &frame).await {
                        warn!("Write to {} channel failed, abandoning session: {}", channel, e);
                        self.end_session().await;
                        return;
                    }
                }
                SessionEffect::Finished(result) => {
                    self.end_session().await;
                    self.forward(result).await;
                }
                SessionEffect::Aborted(reason) => {
                    info!("Session aborted: {}", reason);
                    self.end_session().await;
                }
            }
        }
    }

    async fn forward(&self, result: SessionResult) {
        if !result.has_steps() {
            info!("No steps recorded since the last sync, nothing to relay");
            return;
        }

        let steps = result.steps().unwrap_or_default();
        match self.sink.deliver(result).await {
            Ok(()) => info!("Relayed workout with {} steps", steps),
            Err(e) => error!("Failed to relay workout: {}", e),
        }
    }

    async fn end_session(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(e) = self.transport.disconnect(&active.device).await {
                debug!("Disconnect from {:?} failed: {}", active.device, e);
            }
        }

        let cooldown = self.config.cooldown();
        info!("Cooling down for {:?}", cooldown);
        self.state = SupervisorState::Cooldown;
        self.cooldown_until = Some(Instant::now() + cooldown);
    }

    async fn start_scanning(&mut self) {
        if !self.listening || !self.adapter_ready || self.state != SupervisorState::Stopped {
            return;
        }

        match self.transport.start_scan().await {
            Ok(()) => {
                info!("Scanning for {}", self.config.target_name);
                self.state = SupervisorState::Scanning;
            }
            Err(e) => warn!("Failed to start scan: {}", e),
        }
    }

    async fn stop_all(&mut self) {
        if self.state == SupervisorState::Scanning {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        }
        if let Some(active) = self.active.take() {
            if let Err(e) = self.transport.disconnect(&active.device).await {
                warn!("Failed to disconnect {:?}: {}", active.device, e);
            }
        }
        self.cooldown_until = None;
        self.state = SupervisorState::Stopped;
    }

    fn is_active(&self, device: &T::Device) -> bool {
        self.active.as_ref().is_some_and(|a| a.device == *device)
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{Decimal, Frame},
        sim::{SimulatedTransport, VirtualTreadmill, SIMULATED_DEVICE_ID},
        sink::{ChannelBroadcaster, RecordAssembler, RelaySink, END_OF_MESSAGE},
        transport::Channel,
        types::Field,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<SessionResult>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn deliver(&self, result: SessionResult) -> Result<()> {
            self.delivered.lock().await.push(result);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ResultSink for FailingSink {
        async fn deliver(&self, _result: SessionResult) -> Result<()> {
            Err(SyncError::SinkUnavailable("offline".to_string()))
        }
    }

    type Events = mpsc::UnboundedReceiver<TransportEvent<String>>;

    fn walked(steps: u16) -> VirtualTreadmill {
        VirtualTreadmill::new().with_workout(steps, Decimal::from_parts(0, 14), 12, 245)
    }

    fn supervisor<S: ResultSink>(
        treadmill: VirtualTreadmill,
        sink: S,
    ) -> (Supervisor<SimulatedTransport, S>, Events) {
        let (transport, events) = SimulatedTransport::new(treadmill);
        let config = SyncConfig {
            cooldown_ms: 50,
            ..SyncConfig::default()
        };
        (Supervisor::new(transport, sink, config).unwrap(), events)
    }

    async fn pump<S: ResultSink>(
        supervisor: &mut Supervisor<SimulatedTransport, S>,
        events: &mut Events,
    ) {
        while let Ok(event) = events.try_recv() {
            supervisor.handle_event(event).await;
        }
    }

    #[tokio::test]
    async fn test_zero_steps_are_not_relayed() {
        let (mut supervisor, mut events) = supervisor(walked(0), RecordingSink::default());
        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;

        assert!(supervisor.sink().delivered.lock().await.is_empty());
        assert_eq!(supervisor.state(), SupervisorState::Cooldown);
        assert!(supervisor.cooldown_deadline().is_some());
        assert!(!supervisor.has_active_session());
        assert!(!supervisor.transport().is_connected().await);

        supervisor.cooldown_elapsed().await;
        assert_eq!(supervisor.state(), SupervisorState::Scanning);
        assert_eq!(supervisor.transport().scans_started().await, 2);
    }

    #[tokio::test]
    async fn test_steps_are_relayed_once() {
        let (mut supervisor, mut events) = supervisor(walked(312), RecordingSink::default());
        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;

        let delivered = supervisor.sink().delivered.lock().await.clone();
        assert_eq!(delivered.len(), 1);
        let result = &delivered[0];
        assert_eq!(result.steps(), Some(312));
        for field in [
            Field::SpeedInMph,
            Field::DistanceInMiles,
            Field::Calories,
            Field::Steps,
            Field::TimeInSeconds,
        ] {
            assert!(result.contains(field), "missing {field}");
        }

        let writes = supervisor.transport().writes().await;
        assert_eq!(writes.len(), 6);
        assert!(writes.iter().all(|(channel, _)| *channel == Channel::Command));
        assert_eq!(writes[5].1.to_string(), "e200000000");
        assert_eq!(supervisor.transport().treadmill().await.steps(), 0);
    }

    #[tokio::test]
    async fn test_cooldown_precedes_second_session() {
        let (mut supervisor, mut events) = supervisor(walked(312), RecordingSink::default());
        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;
        assert_eq!(supervisor.transport().connections().await, 1);

        // A straggling advertisement during cooldown must not start a session
        supervisor
            .handle_event(TransportEvent::Discovered {
                device: SIMULATED_DEVICE_ID.to_string(),
                name: Some("LifeSpan".to_string()),
            })
            .await;
        pump(&mut supervisor, &mut events).await;
        assert_eq!(supervisor.transport().connections().await, 1);
        assert_eq!(supervisor.state(), SupervisorState::Cooldown);

        supervisor.cooldown_elapsed().await;
        pump(&mut supervisor, &mut events).await;
        assert_eq!(supervisor.transport().connections().await, 2);

        // The first session reset the console, so nothing new is relayed
        assert_eq!(supervisor.sink().delivered.lock().await.len(), 1);
        assert_eq!(supervisor.transport().treadmill().await.resets(), 2);
    }

    #[tokio::test]
    async fn test_motion_aborts_and_cools_down() {
        let (mut supervisor, mut events) = supervisor(walked(312), RecordingSink::default());
        supervisor
            .transport()
            .update_treadmill(|t| t.set_speed(Decimal::from_parts(1, 20)))
            .await;

        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;

        assert!(supervisor.sink().delivered.lock().await.is_empty());
        assert_eq!(supervisor.state(), SupervisorState::Cooldown);
        assert_eq!(supervisor.transport().writes().await, vec![(Channel::Command, Frame::query(0x82))]);
        assert_eq!(supervisor.transport().treadmill().await.resets(), 0);
    }

    #[tokio::test]
    async fn test_invalid_reads_are_retried() {
        let (mut supervisor, mut events) = supervisor(walked(40), RecordingSink::default());
        supervisor.transport().update_treadmill(|t| t.fail_next_reads(2)).await;

        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;

        let writes = supervisor.transport().writes().await;
        assert_eq!(writes.len(), 8);
        assert_eq!(writes[0].1, writes[1].1);
        assert_eq!(writes[1].1, writes[2].1);
        assert_eq!(supervisor.sink().delivered.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_handshake_and_diagnostics() {
        let (transport, mut events) = SimulatedTransport::new(walked(75));
        let config = SyncConfig {
            handshake: true,
            diagnostic_queries: true,
            ..SyncConfig::default()
        };
        let mut supervisor = Supervisor::new(transport, RecordingSink::default(), config).unwrap();
        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;

        let writes = supervisor.transport().writes().await;
        assert_eq!(writes.len(), 2 + 5 + 8 + 1);
        assert_eq!(writes[0], (Channel::Handshake, Frame::new([0x02, 0, 0, 0, 0])));
        assert_eq!(writes[1].0, Channel::Handshake);
        assert!(writes[2..].iter().all(|(channel, _)| *channel == Channel::Command));

        let delivered = supervisor.sink().delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].contains(Field::Unknown(0x91)));
        assert_eq!(delivered[0].len(), 13);
    }

    #[tokio::test]
    async fn test_other_devices_are_ignored() {
        let treadmill = walked(312).with_name("WalkingPad");
        let (mut supervisor, mut events) = supervisor(treadmill, RecordingSink::default());
        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;

        assert_eq!(supervisor.state(), SupervisorState::Scanning);
        assert_eq!(supervisor.transport().connections().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_mid_session_aborts() {
        let (mut supervisor, mut events) = supervisor(walked(312), RecordingSink::default());
        supervisor.transport().disconnect_after_writes(3).await;

        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;

        assert!(supervisor.sink().delivered.lock().await.is_empty());
        assert_eq!(supervisor.state(), SupervisorState::Cooldown);
        assert_eq!(supervisor.transport().writes().await.len(), 3);
    }

    #[tokio::test]
    async fn test_connect_failure_cools_down() {
        let (mut supervisor, mut events) = supervisor(walked(312), RecordingSink::default());
        supervisor.transport().set_fail_connect(true).await;

        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;

        assert_eq!(supervisor.state(), SupervisorState::Cooldown);
        assert!(!supervisor.has_active_session());
    }

    #[tokio::test]
    async fn test_stop_listening_cancels_everything() {
        let (mut supervisor, mut events) = supervisor(walked(312), RecordingSink::default());
        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;
        assert_eq!(supervisor.state(), SupervisorState::Cooldown);

        supervisor.set_listening(false).await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(supervisor.cooldown_deadline().is_none());

        supervisor.cooldown_elapsed().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);

        supervisor
            .handle_event(TransportEvent::Discovered {
                device: SIMULATED_DEVICE_ID.to_string(),
                name: Some("LifeSpan".to_string()),
            })
            .await;
        assert!(!supervisor.has_active_session());
        assert_eq!(supervisor.transport().scans_started().await, 1);
    }

    #[tokio::test]
    async fn test_scan_waits_for_adapter() {
        let (mut supervisor, mut events) = supervisor(walked(312), RecordingSink::default());

        // Adapter state not yet delivered
        supervisor.set_listening(true).await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);

        pump(&mut supervisor, &mut events).await;
        assert_eq!(supervisor.transport().connections().await, 1);

        // Outage during cooldown keeps the deadline
        supervisor.transport().set_adapter_ready(false).await;
        pump(&mut supervisor, &mut events).await;
        assert_eq!(supervisor.state(), SupervisorState::Cooldown);
        assert!(supervisor.cooldown_deadline().is_some());

        supervisor.cooldown_elapsed().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(supervisor.transport().scans_started().await, 1);

        supervisor.transport().set_adapter_ready(true).await;
        supervisor.handle_event(events.try_recv().unwrap()).await;
        assert_eq!(supervisor.state(), SupervisorState::Scanning);
        assert_eq!(supervisor.transport().scans_started().await, 2);
    }

    #[tokio::test]
    async fn test_adapter_loss_mid_session_cools_down() {
        let (mut supervisor, mut events) = supervisor(walked(312), RecordingSink::default());
        supervisor.set_listening(true).await;

        // Run until the first query has been answered
        loop {
            let event = events.try_recv().unwrap();
            let answered = matches!(event, TransportEvent::ValueUpdated { .. });
            supervisor.handle_event(event).await;
            if answered {
                break;
            }
        }
        assert_eq!(supervisor.state(), SupervisorState::SessionActive);
        assert!(supervisor.has_active_session());

        supervisor
            .handle_event(TransportEvent::AdapterStateChanged { ready: false })
            .await;
        pump(&mut supervisor, &mut events).await;

        assert_eq!(supervisor.state(), SupervisorState::Cooldown);
        assert!(supervisor.cooldown_deadline().is_some());
        assert!(!supervisor.has_active_session());
        assert!(!supervisor.transport().is_connected().await);
        assert!(supervisor.sink().delivered.lock().await.is_empty());

        // Adapter coming back does not cut the cooldown short
        supervisor
            .handle_event(TransportEvent::AdapterStateChanged { ready: true })
            .await;
        assert_eq!(supervisor.state(), SupervisorState::Cooldown);
        assert_eq!(supervisor.transport().scans_started().await, 1);

        supervisor.cooldown_elapsed().await;
        assert_eq!(supervisor.state(), SupervisorState::Scanning);
        assert_eq!(supervisor.transport().scans_started().await, 2);
    }

    #[tokio::test]
    async fn test_sink_failures_are_swallowed() {
        let (mut supervisor, mut events) = supervisor(walked(312), FailingSink);
        supervisor.set_listening(true).await;
        pump(&mut supervisor, &mut events).await;
        assert_eq!(supervisor.state(), SupervisorState::Cooldown);
    }

    #[tokio::test]
    async fn test_run_loop_relays_json_with_eom() {
        let (broadcaster, mut subscriber) = ChannelBroadcaster::new();
        let (sink, _worker) = RelaySink::spawn(broadcaster, 64);
        let (supervisor, events) = supervisor(walked(312), sink);
        let (handle, control) = SupervisorHandle::new();
        let task = tokio::spawn(supervisor.run(events, control));

        handle.set_listening(true).unwrap();

        let mut chunks: Vec<Bytes> = Vec::new();
        let mut assembler = RecordAssembler::new();
        let records = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let chunk = subscriber.recv().await.unwrap();
                chunks.push(chunk.clone());
                if let Some(records) = assembler.push(&chunk).unwrap() {
                    break records;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].steps, 312);
        assert_eq!(chunks.last().unwrap().as_ref(), END_OF_MESSAGE);
        let json = chunks[..chunks.len() - 1].concat();
        assert!(String::from_utf8(json).unwrap().contains("\"steps\":312"));

        handle.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_loop_resumes_scanning_after_cooldown() {
        let (supervisor, events) = supervisor(walked(0), RecordingSink::default());
        let transport = supervisor.transport().clone();
        let (handle, control) = SupervisorHandle::new();
        let task = tokio::spawn(supervisor.run(events, control));

        handle.set_listening(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.scans_started().await < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(!transport.is_scanning().await);
    }
}
