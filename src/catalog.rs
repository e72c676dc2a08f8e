use crate::{
    error::{Result, SyncError},
    protocol::{decode_hex, encode_hex, Decoder, Frame, Value},
    types::Field,
};
use bytes::Bytes;

/// Query whose response decodes into a measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCommand {
    /// Result key the decoded value is stored under
    pub field: Field,
    /// Request frame
    pub request: Frame,
    /// Response decoder
    pub decoder: Decoder,
}

impl QueryCommand {
    /// Build a query from a hex request literal
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Encoding`] if the literal is not a 5-byte hex frame.
    pub fn from_hex(field: Field, request_hex: &str, decoder: Decoder) -> Result<Self> {
        Ok(Self {
            field,
            request: Frame::from_hex(request_hex)?,
            decoder,
        })
    }

    /// Decode a response to this query
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MalformedResponse`] if the response is too short.
    pub fn decode(&self, response: &[u8]) -> Result<Value> {
        self.decoder.decode(response)
    }
}

/// Command acknowledged by a fixed literal response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImperativeCommand {
    /// Human-readable name used in logs
    pub name: &'static str,
    /// Request frame
    pub request: Frame,
    /// Exact acknowledgement; empty when the console sends none
    pub expected_response: Bytes,
}

impl ImperativeCommand {
    /// Build a command from hex request and acknowledgement literals
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Encoding`] if either literal is malformed.
    pub fn from_hex(name: &'static str, request_hex: &str, response_hex: &str) -> Result<Self> {
        Ok(Self {
            name,
            request: Frame::from_hex(request_hex)?,
            expected_response: Bytes::from(decode_hex(response_hex)?),
        })
    }

    /// Check a response against the expected acknowledgement
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnexpectedAcknowledgement`] on any mismatch.
    pub fn verify(&self, response: &[u8]) -> Result<()> {
        if response == self.expected_response.as_ref() {
            Ok(())
        } else {
            Err(SyncError::UnexpectedAcknowledgement {
                command: self.name.to_string(),
                received: encode_hex(response),
                expected: encode_hex(&self.expected_response),
            })
        }
    }
}

/// Ordered command tables for the LifeSpan console
///
/// The console is a simple stateful responder: responses carry no request id,
/// so commands must be issued one at a time in catalog order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    initialization: Vec<ImperativeCommand>,
    queries: Vec<QueryCommand>,
    diagnostics: Vec<QueryCommand>,
    reset: ImperativeCommand,
    start: ImperativeCommand,
    stop: ImperativeCommand,
}

impl Catalog {
    /// Build the LifeSpan command tables
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Encoding`] if any literal is malformed. This is a
    /// programming error and should surface at startup.
    pub fn lifespan() -> Result<Self> {
        let initialization = vec![
            ImperativeCommand::from_hex("firstInitialization", "0200000000", "02aa11180000")?,
            ImperativeCommand::from_hex("secondInitialization", "c000000000", "c0ff00000000")?,
        ];

        let queries = vec![
            QueryCommand::from_hex(Field::SpeedInMph, "a182000000", Decoder::Decimal)?,
            QueryCommand::from_hex(Field::DistanceInMiles, "a185000000", Decoder::Decimal)?,
            QueryCommand::from_hex(Field::Calories, "a187000000", Decoder::UInt16)?,
            QueryCommand::from_hex(Field::Steps, "a188000000", Decoder::UInt16)?,
            QueryCommand::from_hex(Field::TimeInSeconds, "a189000000", Decoder::Seconds)?,
        ];

        // Responses to these vary between sessions but nobody knows what they count
        let diagnostics = [0x91, 0x81, 0x61, 0x62, 0x8B, 0x86, 0x63, 0x64]
            .into_iter()
            .map(|sub_command| QueryCommand {
                field: Field::Unknown(sub_command),
                request: Frame::query(sub_command),
                decoder: Decoder::Hex,
            })
            .collect();

        Ok(Self {
            initialization,
            queries,
            diagnostics,
            reset: ImperativeCommand::from_hex("reset", "e200000000", "e2aa00000000")?,
            start: ImperativeCommand::from_hex("startTreadmill", "e100000000", "")?,
            stop: ImperativeCommand::from_hex("stopTreadmill", "e000000000", "")?,
        })
    }

    /// Build a catalog from explicit tables
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidParameters`] if there are no queries.
    pub fn new(
        initialization: Vec<ImperativeCommand>,
        queries: Vec<QueryCommand>,
        reset: ImperativeCommand,
    ) -> Result<Self> {
        if queries.is_empty() {
            return Err(SyncError::InvalidParameters(
                "catalog needs at least one query".to_string(),
            ));
        }

        let lifespan = Self::lifespan()?;
        Ok(Self {
            initialization,
            queries,
            diagnostics: Vec::new(),
            reset,
            start: lifespan.start,
            stop: lifespan.stop,
        })
    }

    /// Append the diagnostic queries to the query sequence
    #[must_use]
    pub fn with_diagnostics(mut self) -> Self {
        let diagnostics = std::mem::take(&mut self.diagnostics);
        self.queries.extend(diagnostics);
        self
    }

    /// Handshake commands, in order
    #[must_use]
    pub fn initialization(&self) -> &[ImperativeCommand] {
        &self.initialization
    }

    /// Query commands, in order
    #[must_use]
    pub fn queries(&self) -> &[QueryCommand] {
        &self.queries
    }

    /// Diagnostic queries not yet merged into the sequence
    #[must_use]
    pub fn diagnostics(&self) -> &[QueryCommand] {
        &self.diagnostics
    }

    /// Terminal reset command
    #[must_use]
    pub const fn reset(&self) -> &ImperativeCommand {
        &self.reset
    }

    /// Belt start command
    #[must_use]
    pub const fn start(&self) -> &ImperativeCommand {
        &self.start
    }

    /// Belt stop command
    #[must_use]
    pub const fn stop(&self) -> &ImperativeCommand {
        &self.stop
    }

    /// Set speed command for the given belt speed
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidParameters`] if the speed is out of range.
    pub fn set_speed(&self, speed_mph: f64) -> Result<ImperativeCommand> {
        Ok(ImperativeCommand {
            name: "adjustSpeed",
            request: Frame::set_speed(speed_mph)?,
            expected_response: Bytes::new(),
        })
    }
}
