use crate::error::{Result, SyncError};
use bytes::{Buf, Bytes};
use serde::{Serialize, Serializer};
use std::fmt;

/// Request frame size in bytes
pub const FRAME_SIZE: usize = 5;

/// Tag byte shared by every query request and response
pub const QUERY_TAG: u8 = 0xA1;

/// Status byte marking a query response that carries a valid reading
pub const VALID_READ: u8 = 0xAA;

/// Status byte marking a query the device could not answer
pub const INVALID_READ: u8 = 0xFF;

/// Tag byte of the counter reset command
pub const RESET_TAG: u8 = 0xE2;

/// Tag byte of the belt start command
pub const START_TAG: u8 = 0xE1;

/// Tag byte of the belt stop command
pub const STOP_TAG: u8 = 0xE0;

/// Tag byte of the set speed command
pub const SET_SPEED_TAG: u8 = 0xD0;

/// Lowest belt speed accepted by the set speed command, in mph
pub const MIN_SPEED_MPH: f64 = 0.4;

/// Highest belt speed accepted by the set speed command, in mph
pub const MAX_SPEED_MPH: f64 = 4.0;

/// Fixed-size request frame written to the treadmill
///
/// The LifeSpan console speaks a strictly half-duplex protocol of 5-byte
/// requests:
/// - Byte 0: command tag (`0xA1` for queries, `0xE2` reset, `0x02`/`0xC0` handshake)
/// - Byte 1: sub-command (the queried counter for `0xA1`)
/// - Bytes 2-4: zero for queries, arguments for control commands
///
/// Responses carry no correlation id; they are paired with requests purely
/// by delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame([u8; FRAME_SIZE]);

impl Frame {
    /// Create a frame from raw bytes
    #[must_use]
    pub const fn new(bytes: [u8; FRAME_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a query frame for the given sub-command
    #[must_use]
    pub const fn query(sub_command: u8) -> Self {
        Self([QUERY_TAG, sub_command, 0x00, 0x00, 0x00])
    }

    /// Parse a frame from a hex literal such as `"a188000000"`
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Encoding`] if the literal is not valid hex or does
    /// not encode exactly [`FRAME_SIZE`] bytes.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let bytes = decode_hex(hex)?;
        let array: [u8; FRAME_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            SyncError::Encoding(format!(
                "frame literal {hex:?} is {} bytes, expected {FRAME_SIZE}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Create a set speed frame
    ///
    /// Speed is encoded as big-endian hundredths of a mile per hour in bytes 1-2.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidParameters`] if the speed lies outside
    /// [`MIN_SPEED_MPH`]..=[`MAX_SPEED_MPH`].
    pub fn set_speed(speed_mph: f64) -> Result<Self> {
        if !(MIN_SPEED_MPH..=MAX_SPEED_MPH).contains(&speed_mph) {
            return Err(SyncError::InvalidParameters(format!(
                "speed {speed_mph:.2} mph outside {MIN_SPEED_MPH:.1}..={MAX_SPEED_MPH:.1}"
            )));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let hundredths = (speed_mph * 100.0).round() as u16;
        let [hi, lo] = hundredths.to_be_bytes();
        Ok(Self([SET_SPEED_TAG, hi, lo, 0x00, 0x00]))
    }

    /// Command tag byte
    #[must_use]
    pub const fn tag(&self) -> u8 {
        self.0[0]
    }

    /// Sub-command byte
    #[must_use]
    pub const fn sub_command(&self) -> u8 {
        self.0[1]
    }

    /// Raw frame bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.0
    }

    /// Serialize the frame for a transport write
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

/// Decode a hex literal, accepting an optional `0x` or `x` prefix
///
/// # Errors
///
/// Returns [`SyncError::Encoding`] on a non-hex digit or an odd number of digits.
pub fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let digits = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .or_else(|| hex.strip_prefix('x'))
        .or_else(|| hex.strip_prefix('X'))
        .unwrap_or(hex);

    if digits.len() % 2 != 0 {
        return Err(SyncError::Encoding(format!(
            "hex literal {hex:?} has an odd number of digits"
        )));
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| SyncError::Encoding(format!("invalid hex digits in {hex:?}")))
        })
        .collect()
}

/// Encode bytes as lowercase hex
#[must_use]
pub fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Check whether a response carries the valid-read sentinel `A1 AA`
#[must_use]
pub fn is_valid_read(payload: &[u8]) -> bool {
    matches!(payload, [QUERY_TAG, VALID_READ, ..])
}

/// Exact fixed-point decimal with two fractional digits
///
/// Speed and distance counters are reported as a whole byte plus a byte of
/// hundredths. Keeping them as an integer count of hundredths avoids float
/// drift until the value leaves the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Decimal {
    hundredths: u32,
}

impl Decimal {
    /// Build from a whole part and a hundredths part
    #[must_use]
    pub const fn from_parts(whole: u8, fraction: u8) -> Self {
        Self {
            hundredths: whole as u32 * 100 + fraction as u32,
        }
    }

    /// Build from a raw count of hundredths
    #[must_use]
    pub const fn from_hundredths(hundredths: u32) -> Self {
        Self { hundredths }
    }

    /// Raw count of hundredths
    #[must_use]
    pub const fn hundredths(self) -> u32 {
        self.hundredths
    }

    /// Value as a float
    #[must_use]
    pub fn as_f64(self) -> f64 {
        f64::from(self.hundredths) / 100.0
    }

    /// Check for zero
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.hundredths == 0
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.hundredths / 100, self.hundredths % 100)
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

/// Decoded measurement value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Unsigned counter such as steps or calories
    Int(u16),
    /// Fixed-point counter such as speed or distance
    Decimal(Decimal),
    /// Elapsed time in seconds
    Duration(u32),
    /// Raw response of undetermined meaning
    Bytes(Bytes),
}

impl Value {
    /// Integral view of the value, if it has one
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(v) => Some(u64::from(*v)),
            Self::Duration(v) => Some(u64::from(*v)),
            Self::Decimal(_) | Self::Bytes(_) => None,
        }
    }

    /// Numeric view of the value, if it has one
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(f64::from(*v)),
            Self::Decimal(d) => Some(d.as_f64()),
            Self::Duration(v) => Some(f64::from(*v)),
            Self::Bytes(_) => None,
        }
    }

    /// Check whether a numeric value is strictly greater than zero
    #[must_use]
    pub fn is_positive(&self) -> bool {
        match self {
            Self::Int(v) => *v > 0,
            Self::Decimal(d) => !d.is_zero(),
            Self::Duration(v) => *v > 0,
            Self::Bytes(_) => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Duration(v) => write!(f, "{v}s"),
            Self::Bytes(b) => f.write_str(&encode_hex(b)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Int(v) => serializer.serialize_u16(*v),
            Self::Decimal(d) => d.serialize(serializer),
            Self::Duration(v) => serializer.serialize_u32(*v),
            Self::Bytes(b) => serializer.serialize_str(&encode_hex(b)),
        }
    }
}

/// Response decoder attached to a query command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    /// Big-endian `u16` from bytes 2-3
    UInt16,
    /// Whole byte 2 plus hundredths byte 3
    Decimal,
    /// Hours, minutes, seconds in bytes 2-4
    Seconds,
    /// Whole payload kept verbatim
    Hex,
}

impl Decoder {
    /// Minimum payload length this decoder reads
    #[must_use]
    pub const fn required_len(self) -> usize {
        match self {
            Self::UInt16 | Self::Decimal => 4,
            Self::Seconds => 5,
            Self::Hex => 0,
        }
    }

    /// Decode a response payload
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MalformedResponse`] if the payload is shorter than
    /// [`Decoder::required_len`].
    pub fn decode(self, payload: &[u8]) -> Result<Value> {
        match self {
            Self::UInt16 => to_u16(payload).map(Value::Int),
            Self::Decimal => to_decimal(payload).map(Value::Decimal),
            Self::Seconds => to_seconds(payload).map(Value::Duration),
            Self::Hex => Ok(Value::Bytes(Bytes::copy_from_slice(payload))),
        }
    }
}

fn data_section(payload: &[u8], required: usize) -> Result<&[u8]> {
    if payload.len() < required {
        return Err(SyncError::MalformedResponse(format!(
            "payload too short: {} bytes, expected at least {required}",
            payload.len()
        )));
    }
    Ok(&payload[2..])
}

/// Decode a big-endian `u16` from bytes 2-3
///
/// # Errors
///
/// Returns [`SyncError::MalformedResponse`] if the payload is shorter than 4 bytes.
pub fn to_u16(payload: &[u8]) -> Result<u16> {
    let mut buf = data_section(payload, Decoder::UInt16.required_len())?;
    Ok(buf.get_u16())
}

/// Decode a fixed-point decimal, `byte2 + byte3 / 100`
///
/// # Errors
///
/// Returns [`SyncError::MalformedResponse`] if the payload is shorter than 4 bytes.
pub fn to_decimal(payload: &[u8]) -> Result<Decimal> {
    let mut buf = data_section(payload, Decoder::Decimal.required_len())?;
    let whole = buf.get_u8();
    let fraction = buf.get_u8();
    Ok(Decimal::from_parts(whole, fraction))
}

/// Decode an `h:m:s` triple from bytes 2-4 into total seconds
///
/// # Errors
///
/// Returns [`SyncError::MalformedResponse`] if the payload is shorter than 5 bytes.
pub fn to_seconds(payload: &[u8]) -> Result<u32> {
    let mut buf = data_section(payload, Decoder::Seconds.required_len())?;
    let hours = u32::from(buf.get_u8());
    let minutes = u32::from(buf.get_u8());
    let seconds = u32::from(buf.get_u8());
    Ok(3600 * hours + 60 * minutes + seconds)
}

/// Hex encoding of the whole payload
#[must_use]
pub fn to_hex(payload: &[u8]) -> String {
    encode_hex(payload)
}
