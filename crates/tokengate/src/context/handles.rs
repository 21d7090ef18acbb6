//! Masked tool output handles and an in-process handle store.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::capabilities::{CapabilityFuture, HandleStore};
use crate::error::CapabilityError;

/// Number of hex characters kept from the content digest.
pub const HASH_ID_LEN: usize = 16;

/// Retrievable stand-in for a masked tool output.
///
/// Immutable once created. The `hash_id` is derived from the content, so
/// masking identical output twice yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedHandle {
    pub hash_id: String,
    pub preview: String,
    pub full_content: String,
    /// Where the content came from (tool call id, or `"tool"`).
    pub source_tag: String,
    pub created_at: DateTime<Utc>,
}

impl MaskedHandle {
    pub fn new(
        full_content: impl Into<String>,
        source_tag: impl Into<String>,
        preview_chars: usize,
    ) -> Self {
        let full_content = full_content.into();
        Self {
            hash_id: content_hash(&full_content),
            preview: crate::preview(&full_content, preview_chars),
            full_content,
            source_tag: source_tag.into(),
            created_at: Utc::now(),
        }
    }
}

/// First [`HASH_ID_LEN`] hex characters of the SHA-256 of `content`.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest
        .iter()
        .take(HASH_ID_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Default capacity of [`InMemoryHandleStore`].
pub const DEFAULT_HANDLE_CAPACITY: usize = 1024;

/// Concurrent in-process [`HandleStore`].
///
/// Insert-once: a second store of the same `hash_id` is a no-op. When full,
/// the oldest handle is evicted.
#[derive(Debug)]
pub struct InMemoryHandleStore {
    handles: DashMap<String, MaskedHandle>,
    order: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for InMemoryHandleStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HANDLE_CAPACITY)
    }
}

impl InMemoryHandleStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            handles: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Synchronous lookup.
    pub fn get(&self, hash_id: &str) -> Option<MaskedHandle> {
        self.handles.get(hash_id).map(|h| h.value().clone())
    }

    fn insert(&self, handle: MaskedHandle) -> String {
        let id = handle.hash_id.clone();
        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        if self.handles.contains_key(&id) {
            return id;
        }
        while order.len() >= self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.handles.remove(&oldest);
                debug!("Evicted masked handle {oldest}");
            } else {
                break;
            }
        }
        order.push_back(id.clone());
        self.handles.insert(id.clone(), handle);
        id
    }
}

impl HandleStore for InMemoryHandleStore {
    fn store(&self, handle: MaskedHandle) -> CapabilityFuture<'_, String> {
        Box::pin(async move {
            if handle.hash_id.is_empty() {
                return Err(CapabilityError::Storage("empty hash_id".into()));
            }
            Ok(self.insert(handle))
        })
    }

    fn fetch<'a>(&'a self, hash_id: &'a str) -> CapabilityFuture<'a, Option<MaskedHandle>> {
        Box::pin(async move { Ok(self.get(hash_id)) })
    }
}
