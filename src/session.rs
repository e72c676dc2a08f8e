use crate::{
    catalog::Catalog,
    error::SyncError,
    protocol::{encode_hex, is_valid_read, Frame, Value},
    transport::Channel,
    types::{Field, SessionResult, SyncConfig},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};

/// Position of a session in the command sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the command channel subscription
    Idle,
    /// Running handshake command `step`
    Initializing {
        /// Index into the initialization commands
        step: usize,
    },
    /// Waiting for the response to query `step`
    Querying {
        /// Index into the query commands
        step: usize,
    },
    /// Waiting for the reset acknowledgement
    Resetting,
    /// Terminal; the session is discarded
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Initializing { step } => write!(f, "initializing[{step}]"),
            Self::Querying { step } => write!(f, "querying[{step}]"),
            Self::Resetting => write!(f, "resetting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Input to the session state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Command channel notifications are enabled
    Subscribed,
    /// Notification payload received on the command channel
    Response(Bytes),
    /// Link lost
    Disconnected,
}

/// Why a session ended without a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Belt was moving; counters cannot be reset without double counting
    InMotion {
        /// Field that reported motion
        field: Field,
        /// Reading that triggered the abort
        reading: Value,
    },
    /// Link dropped mid-session
    Disconnected,
    /// A step kept failing past the retry budget
    RetriesExhausted {
        /// State the session was stuck in
        state: SessionState,
    },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMotion { field, reading } => {
                write!(f, "treadmill in motion ({field} = {reading})")
            }
            Self::Disconnected => write!(f, "device disconnected"),
            Self::RetriesExhausted { state } => write!(f, "retries exhausted while {state}"),
        }
    }
}

impl From<&AbortReason> for SyncError {
    fn from(reason: &AbortReason) -> Self {
        match reason {
            AbortReason::InMotion { reading, .. } => Self::InMotion {
                speed_mph: reading.as_f64().unwrap_or_default(),
            },
            AbortReason::Disconnected => Self::Disconnected,
            AbortReason::RetriesExhausted { state } => {
                Self::Protocol(format!("retries exhausted while {state}"))
            }
        }
    }
}

/// Output of the session state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// Write a frame to the device
    Write {
        /// Target channel
        channel: Channel,
        /// Request frame
        frame: Frame,
    },
    /// Sequence completed and the device acknowledged its reset
    Finished(SessionResult),
    /// Sequence abandoned
    Aborted(AbortReason),
}

/// Per-session tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Run the initialization commands before querying
    pub handshake: bool,
    /// Resends allowed per step before aborting
    pub max_step_retries: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SessionOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            handshake: config.handshake,
            max_step_retries: config.max_step_retries,
        }
    }
}

/// One run of the command sequence against a connected console
///
/// The session performs no I/O. Each call to [`Session::handle`] consumes
/// one event and returns the effects the caller must carry out, at most one
/// write per event, which keeps the exchange strictly half-duplex:
///
/// ```text
/// Idle --Subscribed--> [Initializing(0..n)] --> Querying(0..m) --> Resetting --> Closed
/// ```
///
/// Malformed or unexpected responses resend the current request without
/// moving the cursor, up to [`SessionOptions::max_step_retries`] times.
#[derive(Debug)]
pub struct Session {
    catalog: Arc<Catalog>,
    options: SessionOptions,
    state: SessionState,
    result: SessionResult,
    retries: u32,
}

impl Session {
    /// Create a session stamped with its start time
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, options: SessionOptions, started_at: DateTime<Utc>) -> Self {
        Self {
            catalog,
            options,
            state: SessionState::Idle,
            result: SessionResult::new(started_at),
            retries: 0,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Fields collected so far
    #[must_use]
    pub const fn result(&self) -> &SessionResult {
        &self.result
    }

    /// Whether the session reached its terminal state
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    /// Advance the state machine by one event
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionEffect> {
        match (self.state, event) {
            (SessionState::Closed, event) => {
                debug!("Ignoring {:?} on closed session", event);
                Vec::new()
            }
            (_, SessionEvent::Disconnected) => self.abort(AbortReason::Disconnected),
            (SessionState::Idle, SessionEvent::Subscribed) => self.begin(),
            (state, SessionEvent::Subscribed) => {
                debug!("Ignoring repeated subscription while {}", state);
                Vec::new()
            }
            (SessionState::Idle, SessionEvent::Response(value)) => {
                warn!("Unsolicited response before subscription: {:02X?}", &value[..]);
                Vec::new()
            }
            (SessionState::Initializing { step }, SessionEvent::Response(value)) => {
                self.on_handshake(step, &value)
            }
            (SessionState::Querying { step }, SessionEvent::Response(value)) => {
                self.on_query(step, &value)
            }
            (SessionState::Resetting, SessionEvent::Response(value)) => self.on_reset(&value),
        }
    }

    fn begin(&mut self) -> Vec<SessionEffect> {
        if self.options.handshake && !self.catalog.initialization().is_empty() {
            debug!("Starting handshake");
            self.enter(SessionState::Initializing { step: 0 })
        } else {
            self.enter(SessionState::Querying { step: 0 })
        }
    }

    fn on_handshake(&mut self, step: usize, response: &[u8]) -> Vec<SessionEffect> {
        let catalog = Arc::clone(&self.catalog);
        let commands = catalog.initialization();

        if let Err(e) = commands[step].verify(response) {
            return self.retry(&e);
        }

        debug!("Handshake step {} acknowledged", commands[step].name);
        if step + 1 < commands.len() {
            self.enter(SessionState::Initializing { step: step + 1 })
        } else {
            self.enter(SessionState::Querying { step: 0 })
        }
    }

    fn on_query(&mut self, step: usize, response: &[u8]) -> Vec<SessionEffect> {
        let catalog = Arc::clone(&self.catalog);
        let queries = catalog.queries();
        let query = &queries[step];

        if !is_valid_read(response) {
            return self.retry(&SyncError::MalformedResponse(format!(
                "{} response {} lacks the valid-read tag",
                query.field,
                encode_hex(response)
            )));
        }

        let value = match query.decode(response) {
            Ok(value) => value,
            Err(e) => return self.retry(&e),
        };

        if query.field.is_motion_indicator() && value.is_positive() {
            info!("Treadmill is running ({} = {}), not syncing", query.field, value);
            return self.abort(AbortReason::InMotion {
                field: query.field,
                reading: value,
            });
        }

        debug!("Decoded {} = {}", query.field, value);
        self.result.insert(query.field, value);

        if step + 1 < queries.len() {
            self.enter(SessionState::Querying { step: step + 1 })
        } else {
            debug!("Collected {} fields, resetting counters", self.result.len());
            self.enter(SessionState::Resetting)
        }
    }

    fn on_reset(&mut self, response: &[u8]) -> Vec<SessionEffect> {
        if let Err(e) = self.catalog.reset().verify(response) {
            return self.retry(&e);
        }

        let started_at = self.result.timestamp();
        let result = std::mem::replace(&mut self.result, SessionResult::new(started_at));
        self.state = SessionState::Closed;
        info!("Session finished with {} fields", result.len());
        vec![SessionEffect::Finished(result)]
    }

    fn enter(&mut self, state: SessionState) -> Vec<SessionEffect> {
        self.state = state;
        self.retries = 0;
        self.current_request().into_iter().collect()
    }

    fn retry(&mut self, error: &SyncError) -> Vec<SessionEffect> {
        if self.retries >= self.options.max_step_retries {
            warn!("Giving up while {}: {}", self.state, error);
            return self.abort(AbortReason::RetriesExhausted { state: self.state });
        }

        self.retries += 1;
        warn!(
            "{} while {}, resending (attempt {}/{})",
            error, self.state, self.retries, self.options.max_step_retries
        );
        self.current_request().into_iter().collect()
    }

    fn abort(&mut self, reason: AbortReason) -> Vec<SessionEffect> {
        self.state = SessionState::Closed;
        vec![SessionEffect::Aborted(reason)]
    }

    fn current_request(&self) -> Option<SessionEffect> {
        let (channel, frame) = match self.state {
            SessionState::Initializing { step } => (
                Channel::Handshake,
                self.catalog.initialization()[step].request,
            ),
            SessionState::Querying { step } => {
                (Channel::Command, self.catalog.queries()[step].request)
            }
            SessionState::Resetting => (Channel::Command, self.catalog.reset().request),
            SessionState::Idle | SessionState::Closed => return None,
        };

        debug!("Sending {} frame {}", channel, frame);
        Some(SessionEffect::Write { channel, frame })
    }
}
