//! Blob-style URLs backing instantiated documents.
//!
//! A [`BlobHandle`] owns its URL: dropping the handle revokes it, so a URL
//! can never outlive the session that created it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

const URL_PREFIX: &str = "blob:preview/";

type Entries = HashMap<String, Arc<str>>;

/// Registry of live document URLs.
#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    entries: Arc<Mutex<Entries>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // contents stay consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `contents` under a fresh URL.
    pub fn register(&self, contents: impl Into<Arc<str>>) -> BlobHandle {
        let url = format!("{}{}", URL_PREFIX, Uuid::new_v4());
        self.lock().insert(url.clone(), contents.into());
        debug!(%url, "registered preview document");
        BlobHandle {
            url,
            store: self.clone(),
        }
    }

    /// Contents behind `url`, if it has not been revoked.
    pub fn resolve(&self, url: &str) -> Option<Arc<str>> {
        self.lock().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn revoke(&self, url: &str) {
        if self.lock().remove(url).is_some() {
            debug!(%url, "revoked preview document");
        }
    }
}

/// Owner of one registered URL.
#[derive(Debug)]
pub struct BlobHandle {
    url: String,
    store: BlobStore,
}

impl BlobHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for BlobHandle {
    fn drop(&mut self) {
        self.store.revoke(&self.url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let store = BlobStore::new();
        let handle = store.register("<!DOCTYPE html>");

        assert!(handle.url().starts_with("blob:preview/"));
        assert_eq!(store.resolve(handle.url()).as_deref(), Some("<!DOCTYPE html>"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_drop_revokes() {
        let store = BlobStore::new();
        let handle = store.register("doc");
        let url = handle.url().to_string();

        drop(handle);

        assert!(store.resolve(&url).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_urls_are_unique() {
        let store = BlobStore::new();
        let a = store.register("a");
        let b = store.register("b");

        assert_ne!(a.url(), b.url());
        assert_eq!(store.resolve(b.url()).as_deref(), Some("b"));
    }
}
