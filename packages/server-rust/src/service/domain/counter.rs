//! `guess-counter`: a process-local counter of submitted guesses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::service::operation::{Content, Operation, OperationError, OperationTable};
use crate::service::registry::Microservice;

pub const SERVICE_ID: &str = "guess-counter";

/// Counts guesses. The count lives in memory only.
#[derive(Debug, Default, Clone)]
pub struct GuessCounter {
    count: Arc<AtomicU64>,
}

impl GuessCounter {
    /// Starts counting from `initial`, e.g. a count restored by the caller.
    #[must_use]
    pub fn with_initial(initial: u64) -> Self {
        Self {
            count: Arc::new(AtomicU64::new(initial)),
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Microservice for GuessCounter {
    fn id(&self) -> &str {
        SERVICE_ID
    }

    fn operations(&self) -> OperationTable {
        OperationTable::new()
            .with(IncrementCount {
                count: Arc::clone(&self.count),
            })
            .with(GetCount {
                count: Arc::clone(&self.count),
            })
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!(count = self.count(), "guess counter stopped");
        Ok(())
    }
}

struct IncrementCount {
    count: Arc<AtomicU64>,
}

#[async_trait]
impl Operation for IncrementCount {
    type Request = ();

    fn path(&self) -> &'static str {
        "increment-count"
    }

    async fn handle(&self, _request: ()) -> Result<Content, OperationError> {
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(Content::new())
    }
}

struct GetCount {
    count: Arc<AtomicU64>,
}

#[async_trait]
impl Operation for GetCount {
    type Request = ();

    fn path(&self) -> &'static str {
        "get-count"
    }

    async fn handle(&self, _request: ()) -> Result<Content, OperationError> {
        let mut content = Content::new();
        content.insert("count".into(), json!(self.count.load(Ordering::Acquire)));
        Ok(content)
    }
}
