// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queued News Record
//!
//! The message body exchanged between the write path and the indexing worker.
//! The wire format is a single JSON document using the write path's camelCase
//! field names.

use crate::errors::IndexError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A news record as published after a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRecord {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author: String,
    #[serde(default)]
    pub img_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueuedRecord {
    /// Decodes a message body into a record.
    ///
    /// Both malformed JSON and ids below 1 are rejected, so a bad message takes
    /// the same retry path as a failed index write.
    pub fn from_slice(data: &[u8]) -> Result<Self, IndexError> {
        let record: QueuedRecord =
            serde_json::from_slice(data).map_err(|e| IndexError::decode(e.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.id < 1 {
            return Err(IndexError::decode(format!("invalid record id {}", self.id)));
        }
        Ok(())
    }

    /// The search document key.
    pub fn document_id(&self) -> String {
        self.id.to_string()
    }
}
