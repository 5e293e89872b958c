//! Checksum primitives used by the RDB codec.
//!
//! This crate carries only what the snapshot format needs: CRC64, the RDB
//! file trailer checksum. Signing and AEAD primitives from the source
//! repository's `verified` module have no counterpart here — the
//! replication protocol this core implements has no Byzantine-fault-tolerant
//! signing requirement.

pub mod crc64;

pub use crc64::crc64;
