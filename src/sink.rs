use crate::{
    error::{Result, SyncError},
    types::SessionResult,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// End-of-data marker written after the queue drains
pub const END_OF_MESSAGE: &[u8] = b"EOM";

/// Downstream consumer of finished session results
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Hand over a finished result
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot accept the result. Callers treat
    /// delivery as best effort.
    async fn deliver(&self, result: SessionResult) -> Result<()>;
}

#[async_trait]
impl<S: ResultSink + ?Sized> ResultSink for Arc<S> {
    async fn deliver(&self, result: SessionResult) -> Result<()> {
        (**self).deliver(result).await
    }
}

/// Announcing side of the relay link
///
/// Mirrors a GATT server exposing the sync characteristic: it advertises
/// only while data is pending and pushes notifications to one subscriber.
#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    /// Start announcing that data is available
    async fn start_advertising(&self) -> Result<()>;

    /// Stop announcing
    async fn stop_advertising(&self) -> Result<()>;

    /// Wait until a subscriber is listening
    async fn wait_for_subscriber(&self) -> Result<()>;

    /// Push one notification to the subscriber
    async fn notify(&self, chunk: Bytes) -> Result<()>;
}

/// Sink relaying results to a subscriber through a [`Broadcaster`]
///
/// Results are queued with a single outstanding slot and drained by a
/// dedicated worker task. Each result is written as a JSON object split into
/// notifications of at most `chunk_size` bytes; once the queue is empty the
/// worker writes [`END_OF_MESSAGE`] and stops advertising.
#[derive(Debug, Clone)]
pub struct RelaySink {
    queue: mpsc::Sender<SessionResult>,
}

impl RelaySink {
    /// Spawn the relay worker
    pub fn spawn<B: Broadcaster>(broadcaster: B, chunk_size: usize) -> (Self, JoinHandle<()>) {
        let (queue, pending) = mpsc::channel(1);
        let worker = tokio::spawn(relay_worker(broadcaster, pending, chunk_size.max(1)));
        (Self { queue }, worker)
    }
}

#[async_trait]
impl ResultSink for RelaySink {
    async fn deliver(&self, result: SessionResult) -> Result<()> {
        self.queue.try_send(result).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SyncError::SinkUnavailable("relay already has a pending result".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                SyncError::SinkUnavailable("relay worker stopped".to_string())
            }
        })
    }
}

async fn relay_worker<B: Broadcaster>(
    broadcaster: B,
    mut pending: mpsc::Receiver<SessionResult>,
    chunk_size: usize,
) {
    while let Some(first) = pending.recv().await {
        if let Err(e) = drain(&broadcaster, &mut pending, first, chunk_size).await {
            warn!("Relay delivery failed: {}", e);
            if let Err(e) = broadcaster.stop_advertising().await {
                debug!("Failed to stop advertising: {}", e);
            }
        }
    }
    debug!("Relay queue closed");
}

async fn drain<B: Broadcaster>(
    broadcaster: &B,
    pending: &mut mpsc::Receiver<SessionResult>,
    first: SessionResult,
    chunk_size: usize,
) -> Result<()> {
    broadcaster.start_advertising().await?;
    broadcaster.wait_for_subscriber().await?;

    let mut next = Some(first);
    while let Some(result) = next {
        let payload = Bytes::from(result.to_json()?);
        debug!("Relaying {} byte record", payload.len());

        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + chunk_size).min(payload.len());
            broadcaster.notify(payload.slice(offset..end)).await?;
            offset = end;
        }

        next = pending.try_recv().ok();
    }

    broadcaster.notify(Bytes::from_static(END_OF_MESSAGE)).await?;
    broadcaster.stop_advertising().await?;
    info!("Relay queue drained");
    Ok(())
}

/// In-process [`Broadcaster`] backed by a channel
///
/// The receiving half plays the subscriber. Advertising state is published
/// on a watch channel so observers can verify the announce discipline.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    notifications: mpsc::UnboundedSender<Bytes>,
    advertising: Arc<watch::Sender<bool>>,
}

impl ChannelBroadcaster {
    /// Create a broadcaster and its subscriber end
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (notifications, subscriber) = mpsc::unbounded_channel();
        let (advertising, _) = watch::channel(false);
        (
            Self {
                notifications,
                advertising: Arc::new(advertising),
            },
            subscriber,
        )
    }

    /// Observe the advertising flag
    #[must_use]
    pub fn advertising(&self) -> watch::Receiver<bool> {
        self.advertising.subscribe()
    }

    /// Whether the broadcaster is currently advertising
    #[must_use]
    pub fn is_advertising(&self) -> bool {
        *self.advertising.borrow()
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn start_advertising(&self) -> Result<()> {
        self.advertising.send_replace(true);
        debug!("Advertising sync service");
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        self.advertising.send_replace(false);
        debug!("Stopped advertising sync service");
        Ok(())
    }

    async fn wait_for_subscriber(&self) -> Result<()> {
        if self.notifications.is_closed() {
            return Err(SyncError::SinkUnavailable("subscriber went away".to_string()));
        }
        Ok(())
    }

    async fn notify(&self, chunk: Bytes) -> Result<()> {
        self.notifications
            .send(chunk)
            .map_err(|_| SyncError::SinkUnavailable("subscriber went away".to_string()))
    }
}

/// Workout reconstructed by the downstream consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkoutRecord {
    /// Workout start, derived from the end time and elapsed seconds
    pub start: DateTime<Utc>,
    /// Sync time, treated as the workout end
    pub end: DateTime<Utc>,
    /// Elapsed time
    pub duration: Duration,
    /// Step count
    pub steps: u64,
    /// Distance in miles
    pub distance_miles: f64,
    /// Energy burned in kilocalories
    pub calories: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    timestamp: DateTime<Utc>,
    time_in_seconds: f64,
    steps: u64,
    distance_in_miles: f64,
    calories: u64,
}

impl TryFrom<WireRecord> for WorkoutRecord {
    type Error = SyncError;

    fn try_from(wire: WireRecord) -> Result<Self> {
        if !wire.time_in_seconds.is_finite() || wire.time_in_seconds < 0.0 {
            return Err(SyncError::InvalidRecord(format!(
                "timeInSeconds {} is not a duration",
                wire.time_in_seconds
            )));
        }
        if !wire.distance_in_miles.is_finite() || wire.distance_in_miles < 0.0 {
            return Err(SyncError::InvalidRecord(format!(
                "distanceInMiles {} is not a distance",
                wire.distance_in_miles
            )));
        }

        let duration = Duration::try_from_secs_f64(wire.time_in_seconds)
            .map_err(|e| SyncError::InvalidRecord(format!("timeInSeconds out of range: {e}")))?;
        let elapsed = chrono::Duration::from_std(duration)
            .map_err(|e| SyncError::InvalidRecord(format!("timeInSeconds out of range: {e}")))?;

        Ok(Self {
            start: wire.timestamp - elapsed,
            end: wire.timestamp,
            duration,
            steps: wire.steps,
            distance_miles: wire.distance_in_miles,
            calories: wire.calories,
        })
    }
}

impl WorkoutRecord {
    /// Parse a single relayed JSON object
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Json`] if a key is missing or mistyped, or
    /// [`SyncError::InvalidRecord`] if a value is out of range.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        serde_json::from_slice::<WireRecord>(json)?.try_into()
    }
}

impl fmt::Display for WorkoutRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} steps in {}m, {:.2} miles, {} calories",
            self.steps,
            self.duration.as_secs() / 60,
            self.distance_miles,
            self.calories
        )
    }
}

/// Reassembles relayed notifications into workout records
///
/// Chunks are buffered until the [`END_OF_MESSAGE`] marker arrives; the
/// buffer may hold several concatenated JSON objects.
#[derive(Debug, Default)]
pub struct RecordAssembler {
    buffer: BytesMut,
}

impl RecordAssembler {
    /// Create an empty assembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one notification
    ///
    /// Returns the records completed by an end marker, or `None` while data
    /// is still being buffered.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered data does not parse into records.
    /// The buffer is cleared either way.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<WorkoutRecord>>> {
        if chunk != END_OF_MESSAGE {
            self.buffer.extend_from_slice(chunk);
            return Ok(None);
        }

        let buffered = self.buffer.split().freeze();
        serde_json::Deserializer::from_slice(&buffered)
            .into_iter::<WireRecord>()
            .map(|wire| -> Result<WorkoutRecord> { WorkoutRecord::try_from(wire?) })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Bytes buffered since the last end marker
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{Decimal, Value},
        types::Field,
    };
    use chrono::TimeZone;

    fn result(steps: u16) -> SessionResult {
        let timestamp = Utc.with_ymd_and_hms(2022, 12, 8, 9, 0, 0).unwrap();
        let mut result = SessionResult::new(timestamp);
        result.insert(Field::SpeedInMph, Value::Decimal(Decimal::default()));
        result.insert(Field::DistanceInMiles, Value::Decimal(Decimal::from_parts(1, 25)));
        result.insert(Field::Calories, Value::Int(88));
        result.insert(Field::Steps, Value::Int(steps));
        result.insert(Field::TimeInSeconds, Value::Duration(1_800));
        result
    }

    async fn collect_until_eom(subscriber: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        while let Some(chunk) = subscriber.recv().await {
            let done = chunk.as_ref() == END_OF_MESSAGE;
            chunks.push(chunk);
            if done {
                break;
            }
        }
        chunks
    }

    #[tokio::test]
    async fn test_relay_writes_json_then_eom() {
        let (broadcaster, mut subscriber) = ChannelBroadcaster::new();
        let mut advertising = broadcaster.advertising();
        let (sink, _worker) = RelaySink::spawn(broadcaster.clone(), 16);

        sink.deliver(result(312)).await.unwrap();
        let chunks = collect_until_eom(&mut subscriber).await;

        assert!(chunks.len() > 2);
        assert!(chunks[..chunks.len() - 1].iter().all(|c| c.len() <= 16));
        assert_eq!(chunks.last().unwrap().as_ref(), b"EOM");

        let json: Vec<u8> = chunks[..chunks.len() - 1].concat();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["steps"], 312);
        assert_eq!(value["timestamp"], "2022-12-08T09:00:00Z");

        advertising.wait_for(|on| !*on).await.unwrap();
        assert!(!broadcaster.is_advertising());
    }

    #[tokio::test]
    async fn test_relay_round_trips_through_assembler() {
        let (broadcaster, mut subscriber) = ChannelBroadcaster::new();
        let (sink, _worker) = RelaySink::spawn(broadcaster, 20);

        sink.deliver(result(312)).await.unwrap();

        let mut assembler = RecordAssembler::new();
        let records = loop {
            let chunk = subscriber.recv().await.unwrap();
            if let Some(records) = assembler.push(&chunk).unwrap() {
                break records;
            }
        };

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.steps, 312);
        assert_eq!(record.calories, 88);
        assert!((record.distance_miles - 1.25).abs() < 1e-9);
        assert_eq!(record.duration, Duration::from_secs(1_800));
        assert_eq!(record.end - record.start, chrono::Duration::seconds(1_800));
        assert_eq!(record.to_string(), "312 steps in 30m, 1.25 miles, 88 calories");
        assert_eq!(assembler.pending(), 0);
    }

    #[tokio::test]
    async fn test_relay_rejects_when_slot_taken() {
        let (queue, _pending) = mpsc::channel(1);
        let sink = RelaySink { queue };

        sink.deliver(result(1)).await.unwrap();
        let err = sink.deliver(result(2)).await.unwrap_err();
        assert!(matches!(err, SyncError::SinkUnavailable(_)));
    }

    #[tokio::test]
    async fn test_broadcaster_notices_missing_subscriber() {
        let (broadcaster, subscriber) = ChannelBroadcaster::new();
        assert!(broadcaster.wait_for_subscriber().await.is_ok());

        drop(subscriber);
        assert!(broadcaster.wait_for_subscriber().await.is_err());
        assert!(broadcaster.notify(Bytes::from_static(b"{}")).await.is_err());
    }

    #[tokio::test]
    async fn test_relay_reports_stopped_worker() {
        let (queue, pending) = mpsc::channel(1);
        drop(pending);
        let sink = RelaySink { queue };
        assert!(matches!(
            sink.deliver(result(1)).await,
            Err(SyncError::SinkUnavailable(_))
        ));
    }

    #[test]
    fn test_assembler_handles_concatenated_records() {
        let mut assembler = RecordAssembler::new();
        let first = result(10).to_json().unwrap();
        let second = result(20).to_json().unwrap();

        assert!(assembler.push(&first).unwrap().is_none());
        assert!(assembler.push(&second).unwrap().is_none());
        let records = assembler.push(END_OF_MESSAGE).unwrap().unwrap();
        assert_eq!(records.iter().map(|r| r.steps).collect::<Vec<_>>(), vec![10, 20]);
    }

    #[test]
    fn test_record_requires_all_keys() {
        let err = WorkoutRecord::from_json(br#"{"timestamp":"2022-12-08T09:00:00Z","steps":5}"#)
            .unwrap_err();
        assert!(matches!(err, SyncError::Json(_)));

        let err = WorkoutRecord::from_json(
            br#"{"timestamp":"2022-12-08T09:00:00Z","timeInSeconds":-4,"steps":5,"distanceInMiles":0.1,"calories":1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRecord(_)));

        let err = WorkoutRecord::from_json(
            br#"{"timestamp":"2022-12-08T09:00:00Z","timeInSeconds":1e300,"steps":5,"distanceInMiles":0.1,"calories":1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRecord(_)));
    }

    #[test]
    fn test_assembler_clears_buffer_on_error() {
        let mut assembler = RecordAssembler::new();
        assembler.push(b"{not json").unwrap();
        assert!(assembler.push(END_OF_MESSAGE).is_err());
        assert_eq!(assembler.pending(), 0);
    }
}
