//! Wire-format DTOs for the store's JSON APIs.
//!
//! These mirror the shapes in `attic/src/api/v1/*.rs`: plain serde structs
//! with `#[serde(rename_all = "kebab-case")]` matching the store's actual
//! field naming, kept separate from the in-memory types in
//! [`crate::types`] so the wire format can evolve independently of the
//! public API.

pub mod snap_action;
pub mod search;
