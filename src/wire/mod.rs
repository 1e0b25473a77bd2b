//! Wire protocol for the streaming endpoint.
//!
//! Tag-length-value binary format. Every frame is a sequence of fields, each
//! introduced by a single varint header `(field_number << 3) | wire_type`.
//! Varints are base-128, least-significant 7 bits first, high bit set on
//! continuation octets. Only two wire types appear:
//!
//! ```text
//! 0 = varint payload
//! 2 = length-delimited: varint length n, then n payload octets
//!     (bytes, UTF-8 string, or a nested frame)
//! ```
//!
//! Subscription request (client -> server), one top-level frame:
//!
//! ```text
//! field 1  varint  user id
//! field 2  len     nested frame of repeated (field 2, len) channel entries:
//!                  each ticker in four forms, in order:
//!                  TICKER, 2TICKER, :TICKER, JTICKER
//! field 3  len     trading key (UTF-8)
//! field 5  len     bearer token (UTF-8)
//! ```
//!
//! The server rejects any other shape.
//!
//! Orderbook update (server -> client): top-level field 10 is a nested frame:
//!
//! ```text
//! sub-field 1        len  ticker symbol (UTF-8)
//! sub-field 2        len  orderbook payload string (see `orderbook`)
//! sub-fields 3,4,5,8,9    timestamps / opaque values, preserved verbatim
//! ```

pub mod orderbook;

pub use orderbook::{OrderbookLevel, OrderbookUpdate, Side};

use std::fmt;

use crate::error::IngestError;

// =============================================================================
// Constants
// =============================================================================

/// Wire type 0: varint payload.
pub const WIRE_VARINT: u8 = 0;
/// Wire type 2: length-delimited payload.
pub const WIRE_LEN: u8 = 2;

/// Subscription frame field numbers.
pub const SUB_FIELD_USER_ID: u32 = 1;
pub const SUB_FIELD_CHANNELS: u32 = 2;
pub const SUB_FIELD_TRADING_KEY: u32 = 3;
pub const SUB_FIELD_TOKEN: u32 = 5;
/// Repeated entry number inside the nested channel frame.
pub const CHANNEL_ENTRY_FIELD: u32 = 2;

/// Top-level field carrying an orderbook update.
pub const ORDERBOOK_FIELD: u32 = 10;
/// Sub-fields of the orderbook frame.
pub const OB_FIELD_TICKER: u32 = 1;
pub const OB_FIELD_PAYLOAD: u32 = 2;

/// Channel prefix characters. Every subscribed ticker is announced in four
/// forms: plain, numeric-prefixed, colon-prefixed, and J-prefixed.
pub const CHANNEL_PREFIX_NUMERIC: char = '2';
pub const CHANNEL_PREFIX_COLON: char = ':';
pub const CHANNEL_PREFIX_BOARD: char = 'J';

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while decoding a frame. Any of these fails the whole frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Varint ran past the end of the buffer or exceeded 64 bits.
    TruncatedVarint,
    /// A declared length exceeds the remaining frame.
    LengthOverrun { declared: u64, remaining: usize },
    /// Header carried a wire type other than 0 or 2.
    UnsupportedWireType(u8),
    /// A required field is absent.
    MissingField(u32),
    /// A string field is not valid UTF-8.
    InvalidUtf8(u32),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedVarint => write!(f, "truncated varint"),
            Self::LengthOverrun { declared, remaining } => write!(
                f,
                "declared length {} overruns remaining {} bytes",
                declared, remaining
            ),
            Self::UnsupportedWireType(t) => write!(f, "unsupported wire type {}", t),
            Self::MissingField(n) => write!(f, "missing field {}", n),
            Self::InvalidUtf8(n) => write!(f, "field {} is not valid UTF-8", n),
        }
    }
}

impl std::error::Error for WireError {}

impl From<WireError> for IngestError {
    fn from(e: WireError) -> Self {
        IngestError::Malformed(e.to_string())
    }
}

// =============================================================================
// Varints
// =============================================================================

/// Append `v` as a base-128 varint.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Read a base-128 varint at `*pos`, advancing it.
pub fn read_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64, WireError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    loop {
        let byte = *buf.get(*pos).ok_or(WireError::TruncatedVarint)?;
        *pos += 1;

        if shift >= 64 {
            return Err(WireError::TruncatedVarint);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

// =============================================================================
// Generic fields
// =============================================================================

/// One decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    Varint(u64),
    Bytes(Vec<u8>),
}

impl WireValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            Self::Varint(_) => None,
        }
    }

    /// Opaque rendering: varints as decimal, bytes as lossy UTF-8.
    pub fn to_opaque_string(&self) -> String {
        match self {
            Self::Varint(v) => v.to_string(),
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// A `(field_number, value)` pair in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub number: u32,
    pub value: WireValue,
}

impl Field {
    pub fn varint(number: u32, v: u64) -> Self {
        Self {
            number,
            value: WireValue::Varint(v),
        }
    }

    pub fn bytes(number: u32, b: impl Into<Vec<u8>>) -> Self {
        Self {
            number,
            value: WireValue::Bytes(b.into()),
        }
    }

    pub fn string(number: u32, s: &str) -> Self {
        Self::bytes(number, s.as_bytes().to_vec())
    }
}

/// Decode an entire frame into its fields, preserving wire order.
/// Unknown field numbers are kept (their payload is consumed, never parsed);
/// any length overrun fails the whole frame.
pub fn decode_fields(buf: &[u8]) -> Result<Vec<Field>, WireError> {
    let mut fields = Vec::new();
    let mut pos = 0usize;

    while pos < buf.len() {
        let header = read_uvarint(buf, &mut pos)?;
        let number = (header >> 3) as u32;
        let wire_type = (header & 0x7) as u8;

        match wire_type {
            WIRE_VARINT => {
                let v = read_uvarint(buf, &mut pos)?;
                fields.push(Field::varint(number, v));
            }
            WIRE_LEN => {
                let len = read_uvarint(buf, &mut pos)?;
                let remaining = buf.len() - pos;
                if len as usize > remaining {
                    return Err(WireError::LengthOverrun {
                        declared: len,
                        remaining,
                    });
                }
                let end = pos + len as usize;
                fields.push(Field::bytes(number, buf[pos..end].to_vec()));
                pos = end;
            }
            other => return Err(WireError::UnsupportedWireType(other)),
        }
    }

    Ok(fields)
}

/// Encode fields in order. The exact inverse of `decode_fields`.
pub fn encode_fields(fields: &[Field]) -> Vec<u8> {
    let mut buf = Vec::new();
    for field in fields {
        match &field.value {
            WireValue::Varint(v) => {
                put_uvarint(&mut buf, u64::from(field.number) << 3 | u64::from(WIRE_VARINT));
                put_uvarint(&mut buf, *v);
            }
            WireValue::Bytes(b) => {
                put_uvarint(&mut buf, u64::from(field.number) << 3 | u64::from(WIRE_LEN));
                put_uvarint(&mut buf, b.len() as u64);
                buf.extend_from_slice(b);
            }
        }
    }
    buf
}

// =============================================================================
// Subscription frame
// =============================================================================

/// The four channel forms announced for one ticker, in wire order.
pub fn channel_forms(ticker: &str) -> [String; 4] {
    [
        ticker.to_string(),
        format!("{}{}", CHANNEL_PREFIX_NUMERIC, ticker),
        format!("{}{}", CHANNEL_PREFIX_COLON, ticker),
        format!("{}{}", CHANNEL_PREFIX_BOARD, ticker),
    ]
}

/// Encode the single subscription frame sent after connecting.
pub fn encode_subscribe(user_id: u64, tickers: &[String], trading_key: &str, token: &str) -> Vec<u8> {
    let mut channels = Vec::with_capacity(tickers.len() * 4);
    for ticker in tickers {
        for form in channel_forms(ticker) {
            channels.push(Field::string(CHANNEL_ENTRY_FIELD, &form));
        }
    }

    let fields = [
        Field::varint(SUB_FIELD_USER_ID, user_id),
        Field::bytes(SUB_FIELD_CHANNELS, encode_fields(&channels)),
        Field::string(SUB_FIELD_TRADING_KEY, trading_key),
        Field::string(SUB_FIELD_TOKEN, token),
    ];
    encode_fields(&fields)
}

/// Decoded view of a subscription frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFrame {
    pub user_id: u64,
    pub channels: Vec<String>,
    pub trading_key: String,
    pub token: String,
}

/// Decode a subscription frame (the codec's own output; used to verify the
/// round-trip law and by test servers).
pub fn decode_subscribe(buf: &[u8]) -> Result<SubscribeFrame, WireError> {
    let fields = decode_fields(buf)?;

    let mut user_id = None;
    let mut channels = Vec::new();
    let mut trading_key = None;
    let mut token = None;

    for field in &fields {
        match (field.number, &field.value) {
            (SUB_FIELD_USER_ID, WireValue::Varint(v)) => user_id = Some(*v),
            (SUB_FIELD_CHANNELS, WireValue::Bytes(nested)) => {
                for entry in decode_fields(nested)? {
                    if entry.number == CHANNEL_ENTRY_FIELD {
                        let s = entry
                            .value
                            .as_str()
                            .ok_or(WireError::InvalidUtf8(CHANNEL_ENTRY_FIELD))?;
                        channels.push(s.to_string());
                    }
                }
            }
            (SUB_FIELD_TRADING_KEY, WireValue::Bytes(_)) => {
                trading_key = Some(
                    field
                        .value
                        .as_str()
                        .ok_or(WireError::InvalidUtf8(SUB_FIELD_TRADING_KEY))?
                        .to_string(),
                );
            }
            (SUB_FIELD_TOKEN, WireValue::Bytes(_)) => {
                token = Some(
                    field
                        .value
                        .as_str()
                        .ok_or(WireError::InvalidUtf8(SUB_FIELD_TOKEN))?
                        .to_string(),
                );
            }
            _ => {}
        }
    }

    Ok(SubscribeFrame {
        user_id: user_id.ok_or(WireError::MissingField(SUB_FIELD_USER_ID))?,
        channels,
        trading_key: trading_key.ok_or(WireError::MissingField(SUB_FIELD_TRADING_KEY))?,
        token: token.ok_or(WireError::MissingField(SUB_FIELD_TOKEN))?,
    })
}

// =============================================================================
// Orderbook frame
// =============================================================================

/// A decoded server frame carrying one orderbook update.
///
/// All fields are preserved in wire order so re-encoding yields the original
/// bytes; only sub-fields 1 (ticker) and 2 (payload) are interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderbookFrame {
    /// Top-level fields, in wire order. One of them is field 10.
    top: Vec<Field>,
    /// Sub-fields of field 10, in wire order.
    update: Vec<Field>,
}

impl OrderbookFrame {
    /// Decode a binary server message. Fails if field 10 is absent.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let top = decode_fields(buf)?;

        let nested = top
            .iter()
            .find(|f| f.number == ORDERBOOK_FIELD)
            .ok_or(WireError::MissingField(ORDERBOOK_FIELD))?;
        let update = match &nested.value {
            WireValue::Bytes(b) => decode_fields(b)?,
            WireValue::Varint(_) => return Err(WireError::MissingField(ORDERBOOK_FIELD)),
        };

        Ok(Self { top, update })
    }

    /// Re-encode through the schema (not from cached bytes). Byte-identical
    /// to the original message for frames this codec decoded.
    pub fn encode(&self) -> Vec<u8> {
        let nested = encode_fields(&self.update);
        let top: Vec<Field> = self
            .top
            .iter()
            .map(|f| {
                if f.number == ORDERBOOK_FIELD {
                    Field::bytes(ORDERBOOK_FIELD, nested.clone())
                } else {
                    f.clone()
                }
            })
            .collect();
        encode_fields(&top)
    }

    /// Build a frame from parts (test servers and fixtures).
    pub fn from_parts(ticker: &str, payload: &str, extra: Vec<Field>) -> Self {
        let mut update = vec![
            Field::string(OB_FIELD_TICKER, ticker),
            Field::string(OB_FIELD_PAYLOAD, payload),
        ];
        update.extend(extra);
        let nested = encode_fields(&update);
        Self {
            top: vec![Field::bytes(ORDERBOOK_FIELD, nested)],
            update,
        }
    }

    /// Ticker symbol (sub-field 1).
    pub fn ticker(&self) -> Result<&str, WireError> {
        self.sub_str(OB_FIELD_TICKER)
    }

    /// Raw orderbook payload string (sub-field 2).
    pub fn payload(&self) -> Result<&str, WireError> {
        self.sub_str(OB_FIELD_PAYLOAD)
    }

    /// Opaque sub-field rendered as a string (timestamps in fields 5 and 9
    /// among them); `None` if the field is absent.
    pub fn opaque(&self, number: u32) -> Option<String> {
        self.update
            .iter()
            .find(|f| f.number == number)
            .map(|f| f.value.to_opaque_string())
    }

    /// Server timestamp carried on the frame, if any. Field 5 is preferred,
    /// field 9 is the fallback; both vary in format so the value stays opaque.
    pub fn server_timestamp(&self) -> Option<String> {
        self.opaque(5).or_else(|| self.opaque(9))
    }

    fn sub_str(&self, number: u32) -> Result<&str, WireError> {
        let field = self
            .update
            .iter()
            .find(|f| f.number == number)
            .ok_or(WireError::MissingField(number))?;
        field.value.as_str().ok_or(WireError::InvalidUtf8(number))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(read_uvarint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        // Continuation bit set on the last byte.
        let buf = [0x80u8, 0x80];
        let mut pos = 0;
        assert_eq!(
            read_uvarint(&buf, &mut pos).unwrap_err(),
            WireError::TruncatedVarint
        );
    }

    #[test]
    fn test_fields_roundtrip() {
        let fields = vec![
            Field::varint(1, 4_826_457),
            Field::string(2, "BBCA"),
            Field::bytes(7, vec![0x00, 0xff, 0x80]),
        ];
        let encoded = encode_fields(&fields);
        let decoded = decode_fields(&encoded).unwrap();
        assert_eq!(decoded, fields);
        assert_eq!(encode_fields(&decoded), encoded);
    }

    #[test]
    fn test_length_overrun_fails_frame() {
        // Field 1, wire type 2, declared length 200, only 2 bytes follow.
        let mut buf = Vec::new();
        put_uvarint(&mut buf, 1 << 3 | u64::from(WIRE_LEN));
        put_uvarint(&mut buf, 200);
        buf.extend_from_slice(&[0xaa, 0xbb]);

        match decode_fields(&buf).unwrap_err() {
            WireError::LengthOverrun { declared, remaining } => {
                assert_eq!(declared, 200);
                assert_eq!(remaining, 2);
            }
            other => panic!("expected LengthOverrun, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_fields_skipped_not_lost() {
        // Frame with an unknown field number between known ones.
        let fields = vec![
            Field::varint(1, 9),
            Field::bytes(99, vec![1, 2, 3]),
            Field::string(3, "K"),
        ];
        let encoded = encode_fields(&fields);
        let decoded = decode_fields(&encoded).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[1].number, 99);
    }

    #[test]
    fn test_subscribe_frame_shape() {
        // user_id=4826457, three tickers => 12 channel entries in rotation.
        let tickers = vec!["BBCA".to_string(), "TLKM".to_string(), "BBRI".to_string()];
        let encoded = encode_subscribe(4_826_457, &tickers, "K", "T");
        let frame = decode_subscribe(&encoded).unwrap();

        assert_eq!(frame.user_id, 4_826_457);
        assert_eq!(frame.trading_key, "K");
        assert_eq!(frame.token, "T");
        assert_eq!(frame.channels.len(), 12);
        assert_eq!(frame.channels[..4], ["BBCA", "2BBCA", ":BBCA", "JBBCA"]);
        assert_eq!(frame.channels[4..8], ["TLKM", "2TLKM", ":TLKM", "JTLKM"]);
        assert_eq!(frame.channels[8..], ["BBRI", "2BBRI", ":BBRI", "JBBRI"]);
    }

    #[test]
    fn test_subscribe_deterministic_bytes() {
        let tickers = vec!["BBCA".to_string()];
        let a = encode_subscribe(1, &tickers, "key", "token");
        let b = encode_subscribe(1, &tickers, "key", "token");
        assert_eq!(a, b);
    }

    #[test]
    fn test_orderbook_frame_roundtrip() {
        let frame = OrderbookFrame::from_parts(
            "BBCA",
            "#O|BBCA|BID|9550;12;11460000|9525;3;2857500",
            vec![
                Field::varint(3, 1),
                Field::varint(4, 2),
                Field::string(5, "1762755335"),
                Field::varint(8, 7),
                Field::string(9, "2025-11-10T01:15:35"),
            ],
        );

        let bytes = frame.encode();
        let decoded = OrderbookFrame::decode(&bytes).unwrap();

        assert_eq!(decoded.ticker().unwrap(), "BBCA");
        assert_eq!(
            decoded.payload().unwrap(),
            "#O|BBCA|BID|9550;12;11460000|9525;3;2857500"
        );
        assert_eq!(decoded.server_timestamp().as_deref(), Some("1762755335"));
        assert_eq!(decoded.opaque(9).as_deref(), Some("2025-11-10T01:15:35"));

        // Re-encoding via the schema yields identical bytes.
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_orderbook_frame_missing_field_10() {
        let bytes = encode_fields(&[Field::varint(1, 5)]);
        assert_eq!(
            OrderbookFrame::decode(&bytes).unwrap_err(),
            WireError::MissingField(ORDERBOOK_FIELD)
        );
    }
}
