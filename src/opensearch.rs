// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenSearch / Elasticsearch Index
//!
//! `SearchIndex` over the OpenSearch client, which speaks the Elasticsearch
//! REST API used by the write path's search endpoint.

use crate::{
    errors::IndexError,
    indexer::{IndexedDocument, SearchIndex},
    record::QueuedRecord,
};
use async_trait::async_trait;
use opensearch::{
    auth::Credentials,
    cluster::ClusterHealthParts,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    indices::{IndicesCreateParts, IndicesExistsParts},
    IndexParts, OpenSearch,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use url::Url;

/// Settings and mappings for the news index.
///
/// Title and content are analysed full text, author and image reference are
/// exact-match keywords and the creation time is a date.
pub fn news_index_settings() -> Value {
    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 1,
            "analysis": {
                "analyzer": {
                    "news_analyzer": {
                        "type": "standard",
                        "stopwords": "_english_"
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "id": { "type": "integer" },
                "title": {
                    "type": "text",
                    "analyzer": "news_analyzer",
                    "fields": {
                        "keyword": { "type": "keyword" }
                    }
                },
                "content": {
                    "type": "text",
                    "analyzer": "news_analyzer"
                },
                "author": { "type": "keyword" },
                "imgUrl": { "type": "keyword" },
                "createdAt": { "type": "date" }
            }
        }
    })
}

/// OpenSearch-backed news index.
pub struct OpenSearchIndex {
    client: OpenSearch,
    index: String,
}

impl OpenSearchIndex {
    /// Creates a client for the node at `url`.
    ///
    /// Basic auth is used only when both username and password are set.
    pub fn new(
        url: &str,
        index: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, IndexError> {
        let parsed_url = Url::parse(url).map_err(|e| IndexError::connection(e.to_string()))?;

        let mut builder = TransportBuilder::new(SingleNodeConnectionPool::new(parsed_url));
        if let (Some(user), Some(pass)) = (username, password) {
            if !user.is_empty() && !pass.is_empty() {
                builder = builder.auth(Credentials::Basic(user.to_owned(), pass.to_owned()));
            }
        }

        let transport = builder
            .disable_proxy()
            .build()
            .map_err(|e| IndexError::connection(e.to_string()))?;

        info!(url = %url, index = %index, "Created OpenSearch client");

        Ok(Self {
            client: OpenSearch::new(transport),
            index: index.to_owned(),
        })
    }

    async fn index_exists(&self) -> Result<bool, IndexError> {
        let response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[self.index.as_str()]))
            .send()
            .await
            .map_err(|e| IndexError::connection(e.to_string()))?;

        match response.status_code().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(IndexError::connection(format!(
                "Unexpected status {} checking index {}",
                status, self.index
            ))),
        }
    }
}

#[async_trait]
impl SearchIndex for OpenSearchIndex {
    async fn ensure_index_exists(&self) -> Result<(), IndexError> {
        if self.index_exists().await? {
            info!(index = %self.index, "Search index already exists");
            return Ok(());
        }

        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(&self.index))
            .body(news_index_settings())
            .send()
            .await
            .map_err(|e| IndexError::creation(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            // Another worker may have created it between the check and here.
            if error_body.contains("resource_already_exists_exception") {
                info!(index = %self.index, "Search index created concurrently");
                return Ok(());
            }
            error!(status = %status, body = %error_body, "Index creation failed");
            return Err(IndexError::creation(format!(
                "Create failed with status {}: {}",
                status, error_body
            )));
        }

        info!(index = %self.index, "Search index created");
        Ok(())
    }

    async fn index_document(&self, record: &QueuedRecord) -> Result<(), IndexError> {
        let doc_id = record.document_id();

        let response = self
            .client
            .index(IndexParts::IndexId(&self.index, &doc_id))
            .body(IndexedDocument::from(record))
            .send()
            .await
            .map_err(|e| IndexError::index(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Index request failed");
            return Err(IndexError::index(format!(
                "Index failed with status {}: {}",
                status, error_body
            )));
        }

        debug!(doc_id = %doc_id, "Document indexed");
        Ok(())
    }

    async fn check_connectivity(&self) -> bool {
        let response = match self
            .client
            .cluster()
            .health(ClusterHealthParts::None)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Search engine unreachable");
                return false;
            }
        };

        if !response.status_code().is_success() {
            warn!(status = %response.status_code(), "Search engine health check failed");
            return false;
        }

        match response.json::<Value>().await {
            Ok(body) => {
                info!(
                    status = body["status"].as_str().unwrap_or("unknown"),
                    "Connected to search engine"
                );
                true
            }
            Err(e) => {
                warn!(error = %IndexError::parse(e.to_string()), "Unreadable health response");
                false
            }
        }
    }
}
