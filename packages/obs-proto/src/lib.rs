//! # obs-proto
//!
//! Shared wire-protocol structures for the GWAC / GFT observation control
//! system.
//!
//! These types are used by:
//! - `gtoaes`: decoding traffic from clients and devices, encoding commands
//!   and status broadcasts
//! - `obs-simulator`: impersonating GWAC devices during development
//!
//! ## Dialects
//!
//! Two ASCII dialects coexist on the wire, both newline-terminated:
//! - **KV** (`kv`): `type key=value,key=value,...` — clients, cameras and
//!   GFT mounts. Every record shares the `utc/gid/uid/cid` envelope.
//! - **Positional** (`gwac`): `g#GGG[UUU]<verb><payload>%date%time%serial%`
//!   — GWAC mount and focuser endpoints. No in-band ACK; commands carry a
//!   five-digit serial and are retransmitted until a `...Rec...` response
//!   names that serial.

pub mod gwac;
pub mod kv;
pub mod types;

use thiserror::Error;

/// Decode failures surfaced by either codec.
///
/// A failed numeric field fails the whole record: the caller sees one of
/// these and never a half-filled structure.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("undefined protocol type `{0}`")]
    UnknownType(String),

    #[error("bad numeric value `{value}` for key `{key}`")]
    BadNumber { key: String, value: String },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// UTC timestamp in the envelope format `CCYY-MM-DDThh:mm:ss`.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}
