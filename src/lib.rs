#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # LifeSpan Sync
//!
//! A Rust library for pulling workout counters off LifeSpan treadmill consoles
//! via Bluetooth Low Energy and relaying them to a downstream consumer.
//!
//! The console keeps running totals (steps, distance, calories, elapsed time)
//! until they are reset. This library waits for a console to appear, reads
//! every counter with a fixed sequence of 5-byte query frames, resets the
//! console so the next walk starts from zero, and hands the record to a
//! [`ResultSink`].
//!
//! ## Protocol Overview
//!
//! - **GATT layout**: service `FFF0`, notify + write characteristic `FFF1`
//!   for queries, write-only characteristic `FFF2` for the optional handshake
//! - **Requests**: `A1 xx 00 00 00`, where `xx` selects the counter
//! - **Responses**: `A1 AA d2 d3 d4 00`; `A1 FF ...` marks an invalid read
//! - **Reset**: `E2 00 00 00 00`, acknowledged with `E2 AA 00 00 00 00`
//!
//! Responses carry no correlation id, so exactly one request is in flight at
//! any time and responses are matched by order.
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: A console must never be reset while someone is walking.
//! Sessions abort without resetting as soon as the belt is seen moving.
//!
//! ## Quick Start
//!
//! ```no_run
//! use lifespan_sync::{
//!     BtleTransport, ChannelBroadcaster, RelaySink, Supervisor, SupervisorHandle, SyncConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::default();
//!
//!     // Radio side
//!     let (transport, events) = BtleTransport::new(&config).await?;
//!
//!     // Downstream side
//!     let (broadcaster, _subscriber) = ChannelBroadcaster::new();
//!     let (sink, _worker) = RelaySink::spawn(broadcaster, config.relay_chunk_size);
//!
//!     let supervisor = Supervisor::new(transport, sink, config)?;
//!     let (handle, control) = SupervisorHandle::new();
//!     handle.set_listening(true)?;
//!
//!     supervisor.run(events, control).await;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport
#[cfg(feature = "ble")]
pub mod ble;
/// Command tables for the LifeSpan console
pub mod catalog;
/// Error types and handling
pub mod error;
/// Wire frames and response decoding
pub mod protocol;
/// Per-connection command/response state machine
pub mod session;
pub mod sim;
/// Result delivery and relay
pub mod sink;
/// Discovery, cooldown, and session lifecycle
pub mod supervisor;
/// Transport abstraction consumed by the supervisor
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
#[cfg(feature = "ble")]
pub use ble::BtleTransport;
pub use catalog::{Catalog, ImperativeCommand, QueryCommand};
pub use error::{Result, SyncError};
pub use protocol::{Decimal, Decoder, Frame, Value};
pub use session::{AbortReason, Session, SessionEffect, SessionEvent, SessionOptions, SessionState};
pub use sim::{SimulatedTransport, VirtualTreadmill};
pub use sink::{
    Broadcaster, ChannelBroadcaster, RecordAssembler, RelaySink, ResultSink, WorkoutRecord,
    END_OF_MESSAGE,
};
pub use supervisor::{Control, Supervisor, SupervisorHandle, SupervisorState};
pub use transport::{Channel, Transport, TransportEvent};
pub use types::{Field, SessionResult, SyncConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Advertised local name of LifeSpan consoles
pub const TARGET_DEVICE_NAME: &str = "LifeSpan";

/// LifeSpan console service UUID (16-bit alias `FFF0`)
pub const LIFESPAN_SERVICE_UUID: &str = "0000FFF0-0000-1000-8000-00805F9B34FB";

/// Command characteristic UUID (16-bit alias `FFF1`)
///
/// Queries and the reset command are written here, and the console answers
/// each of them with a notification on the same characteristic.
pub const COMMAND_CHAR_UUID: &str = "0000FFF1-0000-1000-8000-00805F9B34FB";

/// Handshake characteristic UUID (16-bit alias `FFF2`)
///
/// Only used when [`SyncConfig::handshake`] is enabled.
pub const HANDSHAKE_CHAR_UUID: &str = "0000FFF2-0000-1000-8000-00805F9B34FB";

/// Service advertised while relaying finished workouts downstream
pub const SYNC_SERVICE_UUID: &str = "b0779ed8-f74a-44f5-a9bf-eeb0c76a502e";

/// Characteristic carrying relayed workout JSON and the [`END_OF_MESSAGE`] marker
pub const SYNC_CHAR_UUID: &str = "1bc63fa8-b79d-461c-8cf3-839fc5fba809";

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::block_on;

    #[test]
    fn test_uuids_are_distinct() {
        let uuids = [
            LIFESPAN_SERVICE_UUID,
            COMMAND_CHAR_UUID,
            HANDSHAKE_CHAR_UUID,
            SYNC_SERVICE_UUID,
            SYNC_CHAR_UUID,
        ];
        for (i, a) in uuids.iter().enumerate() {
            for b in &uuids[i + 1..] {
                assert!(!a.eq_ignore_ascii_case(b));
            }
            assert!(uuid::Uuid::parse_str(a).is_ok());
        }
    }

    #[test]
    fn test_default_target_name() {
        assert_eq!(SyncConfig::default().target_name, TARGET_DEVICE_NAME);
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_session_result_reaches_relay_subscriber() {
        let (broadcaster, mut subscriber) = ChannelBroadcaster::new();

        let record = block_on(async move {
            let (sink, worker) = RelaySink::spawn(broadcaster, 20);

            let mut result = SessionResult::new(chrono::Utc::now());
            result.insert(Field::Steps, Value::Int(1200));
            result.insert(Field::DistanceInMiles, Value::Decimal(Decimal::from_parts(0, 55)));
            result.insert(Field::Calories, Value::Int(40));
            result.insert(Field::TimeInSeconds, Value::Duration(900));
            sink.deliver(result).await.unwrap();

            let mut assembler = RecordAssembler::new();
            let records = loop {
                let chunk = subscriber.recv().await.unwrap();
                if let Some(records) = assembler.push(&chunk).unwrap() {
                    break records;
                }
            };

            drop(sink);
            worker.await.unwrap();
            records
        });

        assert_eq!(record.len(), 1);
        assert_eq!(record[0].steps, 1200);
        assert_eq!(record[0].end - record[0].start, chrono::Duration::seconds(900));
    }
}
