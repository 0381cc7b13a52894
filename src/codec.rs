//! Pluggable serialization boundary between typed domain payloads (events,
//! snapshots, projection read models) and the opaque bytes the storage
//! components deal in.
//!
//! This is a thin, crate-internal naming layer over [`crate::serde::Serde`]:
//! `Serde<T>` already *is* a codec, so we re-export it under the name this
//! crate's other modules (`stream`, `aggregate`, `projection`) expect,
//! rather than duplicating it.

pub use crate::serde::json::JsonSerde as Json;
pub use crate::serde::Serde as Codec;
