//! Line-level, annotated, recoverable redaction.
//!
//! The redactor removes whole lines from oversized text under two hard
//! bounds: at most `max_prune_ratio` of the lines go, and at least
//! `min_keep_lines` stay. Every removed block is described by an
//! [`Annotation`] and, optionally, a one-line marker in the output, and the
//! original lines stay recoverable by `prune_id` until the record expires.
//!
//! - [`types`]: request, response and record types (also the wire format).
//! - [`heuristics`]: source detection, structural lines, goal relevance.
//! - [`engine`]: the local [`Pruner`].
//! - [`store`]: the TTL-bounded [`RedactionStore`].
//! - [`rerank`]: opt-in remote scoring with a response cache.
//! - [`rpc`]: JSON-RPC server and the [`RemotePruner`](rpc::RemotePruner)
//!   client.
//!
//! Both [`Pruner`] and [`RemotePruner`](rpc::RemotePruner) implement
//! [`Redactor`], so the orchestrator doesn't care whether pruning happens
//! in-process or in a separate service.

pub mod engine;
pub mod heuristics;
pub mod rerank;
pub mod rpc;
pub mod store;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use engine::{Pruner, PrunerConfig};
pub use rerank::{HttpReranker, RerankCache};
pub use rpc::RemotePruner;
pub use store::RedactionStore;
pub use types::{
    Annotation, LineRange, PruneOptions, PruneReason, PruneRequest, PruneResponse, PruneStats,
    RecoverRequest, RedactionRecord, SourceType,
};

use crate::error::Result;

/// Boxed future returned by [`Redactor`] methods.
pub type RedactFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Anything that can prune text and recover what it pruned.
pub trait Redactor: Send + Sync {
    /// Prune text. Infallible by contract: failures come back as
    /// `used_fallback = true` with the input unchanged.
    fn prune<'a>(&'a self, request: PruneRequest) -> RedactFuture<'a, PruneResponse>;

    /// Recover original lines. Unknown and expired ids are distinct errors.
    fn recover<'a>(&'a self, request: RecoverRequest) -> RedactFuture<'a, Result<String>>;
}
