//! Orderbook payload string parsing.
//!
//! Sub-field 2 of the orderbook frame carries one side of the book as a
//! pipe-separated string:
//!
//! ```text
//! #O|<TICKER>|<SIDE>|p1;l1;v1|p2;l2;v2|...
//! ```
//!
//! `SIDE` is `BID` or `OFFER`; each triple is (price, lots, total value).
//! Prices and total values are carried as the server sent them (integer or
//! fixed-point decimal) and are NOT normalized here; numeric interpretation
//! belongs to whatever reads the CSVs later. Level order is preserved.

use std::fmt;

use crate::error::{IngestError, IngestResult};

const PAYLOAD_MAGIC: &str = "#O";

/// Side of the book an update covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Offer,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bid => "BID",
            Self::Offer => "OFFER",
        }
    }

    pub fn parse(s: &str) -> IngestResult<Self> {
        match s {
            "BID" => Ok(Self::Bid),
            "OFFER" => Ok(Self::Offer),
            other => Err(IngestError::malformed(format!(
                "unknown orderbook side: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One price level: (price, lots, total value). Price and total value keep
/// the server's textual representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderbookLevel {
    pub price: String,
    pub lots: i64,
    pub total_value: String,
}

/// One decoded orderbook update for a single ticker and side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderbookUpdate {
    pub ticker: String,
    pub side: Side,
    pub levels: Vec<OrderbookLevel>,
    /// Server timestamp from the surrounding frame, opaque.
    pub server_timestamp: Option<String>,
}

impl OrderbookUpdate {
    /// Parse a payload string. Level order is preserved from the wire.
    pub fn parse_payload(payload: &str) -> IngestResult<Self> {
        let mut parts = payload.split('|');

        let magic = parts.next().unwrap_or_default();
        if magic != PAYLOAD_MAGIC {
            let head: String = payload.chars().take(32).collect();
            return Err(IngestError::malformed(format!(
                "orderbook payload does not start with {}: {:?}",
                PAYLOAD_MAGIC, head
            )));
        }

        let ticker = parts
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| IngestError::malformed("orderbook payload missing ticker"))?;
        let side = Side::parse(
            parts
                .next()
                .ok_or_else(|| IngestError::malformed("orderbook payload missing side"))?,
        )?;

        let mut levels = Vec::new();
        for triple in parts {
            let mut fields = triple.split(';');
            let (price, lots, total_value) = match (fields.next(), fields.next(), fields.next()) {
                (Some(p), Some(l), Some(v)) if fields.next().is_none() => (p, l, v),
                _ => {
                    return Err(IngestError::malformed(format!(
                        "orderbook level is not a p;l;v triple: {:?}",
                        triple
                    )))
                }
            };

            let lots: i64 = lots.parse().map_err(|_| {
                IngestError::malformed(format!("orderbook lots is not an integer: {:?}", lots))
            })?;

            levels.push(OrderbookLevel {
                price: price.to_string(),
                lots,
                total_value: total_value.to_string(),
            });
        }

        Ok(Self {
            ticker: ticker.to_string(),
            side,
            levels,
            server_timestamp: None,
        })
    }

    /// Re-join into the documented payload format. For any payload this
    /// module parsed, the result equals the original string.
    pub fn to_payload_string(&self) -> String {
        let mut out = format!("{}|{}|{}", PAYLOAD_MAGIC, self.ticker, self.side);
        for level in &self.levels {
            out.push('|');
            out.push_str(&level.price);
            out.push(';');
            out.push_str(&level.lots.to_string());
            out.push(';');
            out.push_str(&level.total_value);
        }
        out
    }
}
