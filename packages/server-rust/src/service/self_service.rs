//! Built-in self-describing service answering the discovery probe.

use std::sync::{Arc, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use courier_core::{ServiceManifest, GET_IDS_PATH, SELF_SERVICE_ID};

use super::dispatcher::Dispatcher;
use super::operation::{Content, Operation, OperationError, OperationTable};
use super::registry::Microservice;

/// `service-wrapper`: reports which services this process hosts.
///
/// Holds the dispatcher weakly because the dispatcher owns its handlers.
pub struct SelfService {
    dispatcher: Weak<Dispatcher>,
}

impl SelfService {
    #[must_use]
    pub fn new(dispatcher: &Arc<Dispatcher>) -> Self {
        Self {
            dispatcher: Arc::downgrade(dispatcher),
        }
    }
}

#[async_trait]
impl Microservice for SelfService {
    fn id(&self) -> &str {
        SELF_SERVICE_ID
    }

    fn operations(&self) -> OperationTable {
        OperationTable::new().with(GetIds {
            dispatcher: Weak::clone(&self.dispatcher),
        })
    }
}

/// `get-ids`: `{"version": 1, "ids": [...]}`.
struct GetIds {
    dispatcher: Weak<Dispatcher>,
}

#[async_trait]
impl Operation for GetIds {
    type Request = ();

    fn path(&self) -> &'static str {
        GET_IDS_PATH
    }

    async fn handle(&self, _request: ()) -> Result<Content, OperationError> {
        let dispatcher = self
            .dispatcher
            .upgrade()
            .ok_or_else(|| anyhow!("dispatcher dropped"))?;
        Ok(ServiceManifest::new(dispatcher.service_ids()).to_content())
    }
}
