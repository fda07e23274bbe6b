// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Search Indexer
//!
//! The `SearchIndex` trait is the boundary between the worker and the search
//! engine. Writes are replace-by-id, so applying the same record any number of
//! times leaves one document holding its latest content.

use crate::{errors::IndexError, record::QueuedRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

/// Name of the search index holding news documents.
pub const NEWS_INDEX: &str = "news";

/// The search-side representation of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedDocument {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author: String,
    pub img_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&QueuedRecord> for IndexedDocument {
    fn from(record: &QueuedRecord) -> Self {
        IndexedDocument {
            id: record.id,
            title: record.title.clone(),
            content: record.content.clone(),
            author: record.author.clone(),
            img_url: record.img_url.clone(),
            created_at: record.created_at,
        }
    }
}

/// Operations the pipeline needs from the search engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates the index with its mappings unless it already exists.
    async fn ensure_index_exists(&self) -> Result<(), IndexError>;

    /// Writes `record` under its id, replacing any previous version.
    async fn index_document(&self, record: &QueuedRecord) -> Result<(), IndexError>;

    /// Whether the search engine answers; used for startup diagnostics only.
    async fn check_connectivity(&self) -> bool;
}

/// Search index kept in process memory.
#[derive(Clone, Default)]
pub struct InMemoryIndex {
    state: Arc<Mutex<InMemoryIndexState>>,
}

#[derive(Default)]
struct InMemoryIndexState {
    created: bool,
    documents: BTreeMap<String, IndexedDocument>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryIndexState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: i64) -> Option<IndexedDocument> {
        self.state().documents.get(&id.to_string()).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().documents.is_empty()
    }

    pub fn is_created(&self) -> bool {
        self.state().created
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn ensure_index_exists(&self) -> Result<(), IndexError> {
        self.state().created = true;
        Ok(())
    }

    async fn index_document(&self, record: &QueuedRecord) -> Result<(), IndexError> {
        self.state()
            .documents
            .insert(record.document_id(), IndexedDocument::from(record));
        Ok(())
    }

    async fn check_connectivity(&self) -> bool {
        true
    }
}
