//! Periodic backend discovery through the built-in `get-ids` probe.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::manifest::probe_operation;
use courier_core::{Params, ServiceManifest};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::backends::KnownServices;
use super::broker_exec::BrokerExecutor;
use super::http_exec::HttpExecutor;
use crate::service::BackgroundRunnable;

/// On-demand discovery work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTask {
    Refresh,
}

/// Discovery for one transport.
pub enum Discovery {
    /// Probes each configured socket and rebuilds the backend pool.
    Http {
        executor: Arc<HttpExecutor>,
        sockets: Vec<String>,
    },
    /// Broadcasts one probe and replaces the known-service set with every
    /// ID reported back.
    Broker {
        executor: Arc<BrokerExecutor>,
        known: Arc<KnownServices>,
    },
}

impl Discovery {
    /// Runs one discovery round.
    pub async fn refresh(&self) {
        match self {
            Discovery::Http { executor, sockets } => refresh_http(executor, sockets).await,
            Discovery::Broker { executor, known } => refresh_broker(executor, known).await,
        }
    }
}

async fn refresh_http(executor: &HttpExecutor, sockets: &[String]) {
    let probes = sockets.iter().map(|socket| async move {
        match executor.fetch_manifest(socket).await {
            Ok(manifest) => Some((socket.clone(), manifest)),
            Err(e) => {
                warn!(%socket, error = %e, "discovery probe failed");
                None
            }
        }
    });
    let found: Vec<(String, ServiceManifest)> = join_all(probes).await.into_iter().flatten().collect();

    let reachable = found.len();
    executor.pool().apply_discovery(found);
    debug!(
        reachable,
        configured = sockets.len(),
        services = ?executor.pool().service_ids(),
        "HTTP discovery finished"
    );
}

async fn refresh_broker(executor: &BrokerExecutor, known: &KnownServices) {
    let replies = match executor.request_all(&probe_operation(), &Params::new()).await {
        Ok(replies) => replies,
        Err(e) => {
            warn!(error = %e, "discovery probe could not be sent");
            return;
        }
    };

    let mut ids = BTreeSet::new();
    for reply in &replies {
        match ServiceManifest::from_content(&reply.body) {
            Some(manifest) => ids.extend(manifest.ids),
            None => warn!(correlation_id = %reply.correlation_id, "ignoring unreadable manifest"),
        }
    }
    debug!(instances = replies.len(), services = ?ids, "broker discovery finished");
    known.replace(ids);
}

#[async_trait]
impl BackgroundRunnable for Discovery {
    type Task = DiscoveryTask;

    fn name(&self) -> &'static str {
        "discovery"
    }

    async fn run(&mut self, task: DiscoveryTask) {
        match task {
            DiscoveryTask::Refresh => self.refresh().await,
        }
    }

    async fn on_tick(&mut self) {
        self.refresh().await;
    }

    async fn shutdown(&mut self) {
        info!("discovery stopped");
    }
}
