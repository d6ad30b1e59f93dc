//! Wire types, canonical JSON, and fingerprints for the Why-Decision
//! answering gateway.
//!
//! This crate has no knowledge of HTTP, the pipeline stages, or any
//! particular storage backend — it defines the shapes every other crate in
//! the workspace agrees on, plus the two primitives (canonical JSON
//! serialization and sha256 fingerprinting) that make those shapes
//! reproducible byte-for-byte across processes.
#![deny(missing_docs)]

/// Canonical JSON serialization and sha256 fingerprints.
pub mod canonical;
/// Core domain entities: anchors, events, transitions, bundles, responses.
pub mod domain;
/// Policy-service request/response envelope shapes.
pub mod policy;

pub use canonical::{canonical_bytes, fingerprint, sha256_hex};
pub use domain::*;
pub use policy::{PolicyDecision, PolicyIdentity, PolicyInput, PolicyResource, PolicyResult};
