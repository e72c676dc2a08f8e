//! In-process stand-in for a LifeSpan console
//!
//! [`VirtualTreadmill`] answers request frames the way the real console does,
//! and [`SimulatedTransport`] wires it behind the [`Transport`] trait so the
//! supervisor can run end to end without a radio.

use crate::{
    error::{Result, SyncError},
    protocol::{
        Decimal, Frame, INVALID_READ, QUERY_TAG, RESET_TAG, SET_SPEED_TAG, START_TAG, STOP_TAG,
        VALID_READ,
    },
    transport::{Channel, Transport, TransportEvent},
    TARGET_DEVICE_NAME,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Device handle reported by [`SimulatedTransport`]
pub const SIMULATED_DEVICE_ID: &str = "sim:lifespan";

/// Counters and behavior of a simulated console
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualTreadmill {
    name: String,
    speed: Decimal,
    distance: Decimal,
    calories: u16,
    steps: u16,
    elapsed_seconds: u32,
    invalid_reads: u32,
    resets: u32,
}

impl Default for VirtualTreadmill {
    fn default() -> Self {
        Self {
            name: TARGET_DEVICE_NAME.to_string(),
            speed: Decimal::default(),
            distance: Decimal::default(),
            calories: 0,
            steps: 0,
            elapsed_seconds: 0,
            invalid_reads: 0,
            resets: 0,
        }
    }
}

impl VirtualTreadmill {
    /// Create an idle console with zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise under a different name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the counters of a finished walk
    #[must_use]
    pub fn with_workout(
        mut self,
        steps: u16,
        distance: Decimal,
        calories: u16,
        elapsed_seconds: u32,
    ) -> Self {
        self.steps = steps;
        self.distance = distance;
        self.calories = calories;
        self.elapsed_seconds = elapsed_seconds;
        self
    }

    /// Set the current belt speed
    pub fn set_speed(&mut self, speed: Decimal) {
        self.speed = speed;
    }

    /// Answer the next `count` queries with an invalid read
    pub fn fail_next_reads(&mut self, count: u32) {
        self.invalid_reads = count;
    }

    /// Advertised name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current step counter
    #[must_use]
    pub const fn steps(&self) -> u16 {
        self.steps
    }

    /// Number of acknowledged resets
    #[must_use]
    pub const fn resets(&self) -> u32 {
        self.resets
    }

    /// Produce the notification the console sends for a request
    ///
    /// Control commands are not acknowledged and return `None`.
    pub fn respond(&mut self, frame: &Frame) -> Option<Bytes> {
        let response = match (frame.tag(), frame.sub_command()) {
            (0x02, _) => [0x02, VALID_READ, 0x11, 0x18, 0x00, 0x00],
            (0xC0, _) => [0xC0, INVALID_READ, 0x00, 0x00, 0x00, 0x00],
            (RESET_TAG, _) => {
                self.reset_counters();
                [RESET_TAG, VALID_READ, 0x00, 0x00, 0x00, 0x00]
            }
            (START_TAG | STOP_TAG | SET_SPEED_TAG, _) => return None,
            (QUERY_TAG, _) if self.invalid_reads > 0 => {
                self.invalid_reads -= 1;
                invalid_read()
            }
            (QUERY_TAG, 0x82) => decimal_read(self.speed),
            (QUERY_TAG, 0x85) => decimal_read(self.distance),
            (QUERY_TAG, 0x87) => u16_read(self.calories),
            (QUERY_TAG, 0x88) => u16_read(self.steps),
            (QUERY_TAG, 0x89) => duration_read(self.elapsed_seconds),
            (QUERY_TAG, 0x91) => [QUERY_TAG, VALID_READ, 0x05, 0x00, 0x00, 0x00],
            (QUERY_TAG, 0x81 | 0x61 | 0x62 | 0x63 | 0x64 | 0x8B | 0x86) => u16_read(0),
            _ => invalid_read(),
        };
        Some(Bytes::copy_from_slice(&response))
    }

    fn reset_counters(&mut self) {
        // The console cannot clear its counters while the belt runs
        if self.speed.is_zero() {
            self.distance = Decimal::default();
            self.calories = 0;
            self.steps = 0;
            self.elapsed_seconds = 0;
        }
        self.resets += 1;
    }
}

const fn invalid_read() -> [u8; 6] {
    [QUERY_TAG, INVALID_READ, 0x00, 0x00, 0x00, 0x00]
}

const fn u16_read(value: u16) -> [u8; 6] {
    let [hi, lo] = value.to_be_bytes();
    [QUERY_TAG, VALID_READ, hi, lo, 0x00, 0x00]
}

fn decimal_read(value: Decimal) -> [u8; 6] {
    let whole = u8::try_from(value.hundredths() / 100).unwrap_or(u8::MAX);
    let fraction = u8::try_from(value.hundredths() % 100).unwrap_or_default();
    [QUERY_TAG, VALID_READ, whole, fraction, 0x00, 0x00]
}

fn duration_read(seconds: u32) -> [u8; 6] {
    let hours = u8::try_from(seconds / 3600).unwrap_or(u8::MAX);
    let minutes = u8::try_from(seconds % 3600 / 60).unwrap_or_default();
    let secs = u8::try_from(seconds % 60).unwrap_or_default();
    [QUERY_TAG, VALID_READ, hours, minutes, secs, 0x00]
}

#[derive(Debug)]
struct SimState {
    treadmill: VirtualTreadmill,
    ready: bool,
    scanning: bool,
    connected: bool,
    fail_connect: bool,
    drop_after_writes: Option<usize>,
    scans_started: usize,
    connections: usize,
    writes: Vec<(Channel, Frame)>,
}

/// [`Transport`] backed by a [`VirtualTreadmill`]
///
/// Responses are emitted synchronously on the event channel while the write
/// call is in flight, so a test can drain the channel after every step and
/// observe a deterministic event order.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
    events: mpsc::UnboundedSender<TransportEvent<String>>,
}

impl SimulatedTransport {
    /// Create a transport with a powered-on adapter
    #[must_use]
    pub fn new(
        treadmill: VirtualTreadmill,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent<String>>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::AdapterStateChanged { ready: true });

        let state = SimState {
            treadmill,
            ready: true,
            scanning: false,
            connected: false,
            fail_connect: false,
            drop_after_writes: None,
            scans_started: 0,
            connections: 0,
            writes: Vec::new(),
        };

        (
            Self {
                state: Arc::new(Mutex::new(state)),
                events,
            },
            receiver,
        )
    }

    /// Mutate the simulated console
    pub async fn update_treadmill<R>(&self, f: impl FnOnce(&mut VirtualTreadmill) -> R) -> R {
        f(&mut self.state.lock().await.treadmill)
    }

    /// Snapshot of the simulated console
    pub async fn treadmill(&self) -> VirtualTreadmill {
        self.state.lock().await.treadmill.clone()
    }

    /// Toggle adapter power, reporting the change as an event
    pub async fn set_adapter_ready(&self, ready: bool) {
        let mut state = self.state.lock().await;
        state.ready = ready;
        if !ready {
            state.scanning = false;
            state.connected = false;
        }
        let _ = self.events.send(TransportEvent::AdapterStateChanged { ready });
    }

    /// Make subsequent connection attempts fail
    pub async fn set_fail_connect(&self, fail: bool) {
        self.state.lock().await.fail_connect = fail;
    }

    /// Drop the link once `count` frames have been written in total
    pub async fn disconnect_after_writes(&self, count: usize) {
        self.state.lock().await.drop_after_writes = Some(count);
    }

    /// Every frame written so far
    pub async fn writes(&self) -> Vec<(Channel, Frame)> {
        self.state.lock().await.writes.clone()
    }

    /// Number of scans started
    pub async fn scans_started(&self) -> usize {
        self.state.lock().await.scans_started
    }

    /// Number of successful connections
    pub async fn connections(&self) -> usize {
        self.state.lock().await.connections
    }

    /// Whether a scan is running
    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.scanning
    }

    /// Whether the console is connected
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    fn emit(&self, event: TransportEvent<String>) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    type Device = String;

    async fn start_scan(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.ready {
            return Err(SyncError::Protocol("adapter is powered off".to_string()));
        }

        state.scanning = true;
        state.scans_started += 1;
        debug!("Simulated scan #{}", state.scans_started);
        self.emit(TransportEvent::Discovered {
            device: SIMULATED_DEVICE_ID.to_string(),
            name: Some(state.treadmill.name().to_string()),
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state.lock().await.scanning = false;
        Ok(())
    }

    async fn connect(&self, device: &String) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_connect || device != SIMULATED_DEVICE_ID {
            return Err(SyncError::ConnectionFailed(format!("{device} unreachable")));
        }

        state.connected = true;
        state.connections += 1;
        self.emit(TransportEvent::Connected(device.clone()));
        self.emit(TransportEvent::Subscribed(device.clone()));
        Ok(())
    }

    async fn disconnect(&self, device: &String) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            state.connected = false;
            self.emit(TransportEvent::Disconnected(device.clone()));
        }
        Ok(())
    }

    async fn write(&self, device: &String, channel: Channel, frame: &Frame) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(SyncError::Disconnected);
        }

        state.writes.push((channel, *frame));
        if state
            .drop_after_writes
            .is_some_and(|limit| state.writes.len() >= limit)
        {
            state.connected = false;
            self.emit(TransportEvent::Disconnected(device.clone()));
            return Ok(());
        }

        if let Some(value) = state.treadmill.respond(frame) {
            self.emit(TransportEvent::ValueUpdated {
                device: device.clone(),
                value,
            });
        }
        Ok(())
    }
}
