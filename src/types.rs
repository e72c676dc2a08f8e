use crate::{
    error::Result,
    protocol::Value,
    TARGET_DEVICE_NAME,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};
use std::{borrow::Cow, collections::BTreeMap, fmt, path::Path, time::Duration};

/// Measurement field reported by the treadmill console
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    /// Current belt speed in miles per hour
    SpeedInMph,
    /// Distance walked since the last reset, in miles
    DistanceInMiles,
    /// Calories burned since the last reset
    Calories,
    /// Steps since the last reset
    Steps,
    /// Elapsed time since the last reset
    TimeInSeconds,
    /// Query of undetermined meaning, keyed by its sub-command byte
    Unknown(u8),
}

impl Field {
    /// Key used for this field in the relayed JSON record
    #[must_use]
    pub fn name(self) -> Cow<'static, str> {
        match self {
            Self::SpeedInMph => Cow::Borrowed("speedInMph"),
            Self::DistanceInMiles => Cow::Borrowed("distanceInMiles"),
            Self::Calories => Cow::Borrowed("calories"),
            Self::Steps => Cow::Borrowed("steps"),
            Self::TimeInSeconds => Cow::Borrowed("timeInSeconds"),
            Self::Unknown(sub_command) => Cow::Owned(format!("unknown{sub_command:02X}")),
        }
    }

    /// Whether a positive reading of this field means the belt is moving
    #[must_use]
    pub const fn is_motion_indicator(self) -> bool {
        matches!(self, Self::SpeedInMph)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

/// Measurements collected during one session
///
/// Serializes to the flat JSON object consumed downstream: an ISO-8601
/// `timestamp` followed by one key per decoded field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    timestamp: DateTime<Utc>,
    fields: BTreeMap<Field, Value>,
}

impl SessionResult {
    /// Create an empty result stamped with the session start time
    #[must_use]
    pub const fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Session start time
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Store a decoded value, replacing any previous one
    pub fn insert(&mut self, field: Field, value: Value) {
        self.fields.insert(field, value);
    }

    /// Look up a decoded value
    #[must_use]
    pub fn get(&self, field: Field) -> Option<&Value> {
        self.fields.get(&field)
    }

    /// Check whether a field was recorded
    #[must_use]
    pub fn contains(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    /// Recorded step count
    #[must_use]
    pub fn steps(&self) -> Option<u64> {
        self.get(Field::Steps).and_then(Value::as_u64)
    }

    /// Whether the session recorded any steps at all
    #[must_use]
    pub fn has_steps(&self) -> bool {
        self.steps().is_some_and(|steps| steps > 0)
    }

    /// Iterate over recorded fields in `Field` order
    ///
    /// The five named fields come first, then diagnostic fields by ascending
    /// sub-command byte.
    pub fn fields(&self) -> impl Iterator<Item = (Field, &Value)> {
        self.fields.iter().map(|(field, value)| (*field, value))
    }

    /// Number of recorded fields, not counting the timestamp
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no field has been recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encode as the JSON object relayed downstream
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Serialize for SessionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry(
            "timestamp",
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        )?;
        for (field, value) in &self.fields {
            map.serialize_entry(field, value)?;
        }
        map.end()
    }
}

/// Sync configuration
///
/// Every key is optional when loading from JSON; missing keys take the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Advertised name identifying the treadmill console
    pub target_name: String,
    /// Quiet period after each session before scanning resumes, in milliseconds
    pub cooldown_ms: u64,
    /// Resends allowed per protocol step before the session aborts
    pub max_step_retries: u32,
    /// Run the two-command handshake before querying
    pub handshake: bool,
    /// Also issue the diagnostic queries of undetermined meaning
    pub diagnostic_queries: bool,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Maximum bytes per relay notification
    pub relay_chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            target_name: TARGET_DEVICE_NAME.to_string(),
            cooldown_ms: 15_000,
            max_step_retries: 3,
            handshake: false,
            diagnostic_queries: false,
            connect_timeout_ms: 30_000,
            relay_chunk_size: 182,
        }
    }
}

impl SyncConfig {
    /// Parse a configuration from JSON
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Json`] if the document is not valid JSON or
    /// a key has the wrong type.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration file
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Io`] if the file cannot be read, or
    /// [`crate::SyncError::Json`] if it cannot be parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Cooldown as a [`Duration`]
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Connection timeout as a [`Duration`]
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
