//! Connectivity monitoring.
//!
//! The monitor tracks a two-state reachability machine and publishes an edge
//! only when the state actually changes. Reachability itself comes from an
//! injected [`ReachabilityProbe`], so tests can force transitions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::util::normalize_base_url;
use crate::wire::HEALTH_PATH;
use crate::Result;

const EDGE_CHANNEL_CAPACITY: usize = 16;

/// Current network reachability of the ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

impl Reachability {
    pub const fn is_reachable(self) -> bool {
        matches!(self, Self::Reachable)
    }
}

/// A state transition observed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEdge {
    BecameReachable,
    BecameUnreachable,
}

/// Source of the raw reachability signal.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn check(&self) -> Reachability;
}

/// Probes reachability by calling the endpoint's health route.
#[derive(Clone)]
pub struct HttpReachabilityProbe {
    health_url: String,
    client: reqwest::Client,
}

impl HttpReachabilityProbe {
    pub fn new(api_base_url: &str, timeout: Duration) -> Result<Self> {
        let base = normalize_base_url(api_base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| crate::Error::Config(error.to_string()))?;
        Ok(Self {
            health_url: format!("{base}{HEALTH_PATH}"),
            client,
        })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpReachabilityProbe {
    async fn check(&self) -> Reachability {
        match self.client.get(&self.health_url).send().await {
            Ok(response) if response.status().is_success() => Reachability::Reachable,
            Ok(response) => {
                tracing::debug!(status = response.status().as_u16(), "Health probe failed");
                Reachability::Unreachable
            }
            Err(error) => {
                tracing::debug!(%error, "Health probe failed");
                Reachability::Unreachable
            }
        }
    }
}

struct MonitorInner {
    state: watch::Sender<Reachability>,
    edges: broadcast::Sender<ConnectivityEdge>,
}

/// Edge-triggered reachability state machine.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Reachability) -> Self {
        let (state, _) = watch::channel(initial);
        let (edges, _) = broadcast::channel(EDGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner { state, edges }),
        }
    }

    /// Build a monitor whose initial state is the probe's current answer.
    pub async fn start(probe: &dyn ReachabilityProbe) -> Self {
        let initial = probe.check().await;
        tracing::info!(?initial, "Connectivity monitor started");
        Self::new(initial)
    }

    pub fn current(&self) -> Reachability {
        *self.inner.state.borrow()
    }

    /// Feed one observation into the state machine.
    ///
    /// Returns the edge when the observation changed the state, `None` when it
    /// repeated the current state.
    pub fn observe(&self, observed: Reachability) -> Option<ConnectivityEdge> {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == observed {
                false
            } else {
                *state = observed;
                true
            }
        });
        if !changed {
            return None;
        }

        let edge = match observed {
            Reachability::Reachable => ConnectivityEdge::BecameReachable,
            Reachability::Unreachable => ConnectivityEdge::BecameUnreachable,
        };
        tracing::info!(?edge, "Connectivity changed");
        // No subscribers is fine; the state is still recorded.
        let _ = self.inner.edges.send(edge);
        Some(edge)
    }

    /// Receive every future edge.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEdge> {
        self.inner.edges.subscribe()
    }

    /// Watch the current state.
    pub fn watch(&self) -> watch::Receiver<Reachability> {
        self.inner.state.subscribe()
    }

    /// Poll the probe every `interval` until `shutdown` flips to true.
    pub fn spawn_polling(
        &self,
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let observed = probe.check().await;
                        monitor.observe(observed);
                    }
                }
            }
            tracing::debug!("Connectivity polling stopped");
        })
    }
}
