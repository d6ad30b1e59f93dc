//! Outbound HTTP (and cache/object-store) clients for the memory graph,
//! policy, LLM, cache, and artefact-storage services the gateway talks
//! to. Nothing in this crate knows about the request pipeline — it only
//! knows how to reach these collaborators and decode their responses.
#![deny(missing_docs)]

/// Key-value cache client.
pub mod cache;
/// Shared client error type.
pub mod error;
/// LLM invocation client.
pub mod llm;
/// Memory-graph service client.
pub mod memory;
/// Object-store (artefact persistence) client.
pub mod object_store;
/// Policy-decision service client.
pub mod policy;

pub use cache::{Cache, InMemoryCache, RedisCache};
pub use error::ClientError;
pub use llm::{DisabledLlmClient, LlmClient, OpenAiLlmClient};
pub use memory::{HttpMemoryClient, MemoryClient, SchemaKind};
pub use object_store::{FilesystemObjectStore, HttpPutObjectStore, ObjectStore};
pub use policy::{HttpPolicyClient, PolicyClient};
