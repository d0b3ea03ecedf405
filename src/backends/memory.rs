//! In-memory backend with scripted answers.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BackendKind, SearchBackend, SearchHit, SearchRequest};
use crate::{Result, SweepError};

/// Answers queries from a fixed table. Unknown queries return no hits.
pub struct StaticBackend {
    kind: BackendKind,
    hits: HashMap<String, Vec<SearchHit>>,
    failures: HashSet<String>,
    latency: HashMap<String, Duration>,
    requests: Mutex<Vec<SearchRequest>>,
}

impl StaticBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            hits: HashMap::new(),
            failures: HashSet::new(),
            latency: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_hits(mut self, query: impl Into<String>, hits: Vec<SearchHit>) -> Self {
        self.hits.insert(query.into(), hits);
        self
    }

    pub fn with_failure(mut self, query: impl Into<String>) -> Self {
        self.failures.insert(query.into());
        self
    }

    pub fn with_latency(mut self, query: impl Into<String>, latency: Duration) -> Self {
        self.latency.insert(query.into(), latency);
        self
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl SearchBackend for StaticBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        if let Some(latency) = self.latency.get(&request.query) {
            tokio::time::sleep(*latency).await;
        }
        if self.failures.contains(&request.query) {
            return Err(SweepError::Other(format!("scripted failure for '{}'", request.query)));
        }
        Ok(self.hits.get(&request.query).cloned().unwrap_or_default())
    }
}
