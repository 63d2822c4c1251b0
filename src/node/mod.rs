//! Per-node supervisor.
//!
//! Owns one node's resolved config, liveness state, and host driver.
//! Heartbeats and failure checks are synchronous and never suspend;
//! maintenance (start, stop+start) runs as a spawned task serialized by a
//! try-acquire lock, so at most one maintenance ever runs per node and a
//! second request is silently dropped.

pub mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cloud::CloudProvider;
use crate::config::AppConfig;
use crate::error::ControllerError;
use crate::host::{HostDriver, HostError};
use crate::types::{CleanLevel, HeartbeatMessage, NodeFailure};
use crate::util::now_ts;

use self::config::{LoadedConfig, NodeConfig};

/// Non-reentrant try-acquire lock. Holding it means a maintenance task is
/// driving the host; heartbeats and failure checks are no-ops meanwhile.
#[derive(Debug, Default)]
struct MaintenanceLock {
    held: AtomicBool,
}

struct MaintenanceGuard<'a> {
    lock: &'a MaintenanceLock,
}

impl MaintenanceLock {
    fn try_acquire(&self) -> Option<MaintenanceGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .ok()?;
        Some(MaintenanceGuard { lock: self })
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct NodeState {
    host_up: bool,
    ts_start: u64,
    ts_heartbeat: u64,
    genesis: Option<String>,
    follows: Option<String>,
    failure: Option<NodeFailure>,
    cookie_exec: Option<String>,
    cookie_data: Option<String>,
}

/// What a heartbeat reply needs before the controller resolves the followed
/// node's address
#[derive(Debug)]
pub struct HeartbeatSnapshot {
    pub cookie_exec: Option<String>,
    pub cookie_data: Option<String>,
    pub rnode_package_url: Option<String>,
    pub follows: Option<String>,
}

/// Point-in-time node summary for the status endpoint
#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub host_up: bool,
    pub ts_start: u64,
    pub ts_heartbeat: u64,
    pub genesis: Option<String>,
    pub follows: Option<String>,
    pub failure: Option<NodeFailure>,
}

pub struct NodeSupervisor {
    name: String,
    data_dir: PathBuf,
    config: NodeConfig,
    host: HostDriver,
    state: Mutex<NodeState>,
    maintenance: MaintenanceLock,
    shutdown: CancellationToken,
}

impl NodeSupervisor {
    /// Create a supervisor, loading (or resolving) its persisted config.
    /// A freshly resolved config gets a new `cookie_exec`; the fast path
    /// leaves it unset so the next heartbeat's cookie is adopted.
    pub fn new(
        app: &AppConfig,
        cloud: Arc<dyn CloudProvider>,
        name: &str,
        config_user: Option<Value>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, ControllerError> {
        let data_dir = app.nodes_data_dir().join(name);
        let LoadedConfig {
            config,
            fresh_cookie,
        } = config::load(app, &data_dir, name, config_user)?;
        let host = HostDriver::new(name, config.raw().clone(), cloud);
        let state = NodeState {
            cookie_exec: fresh_cookie,
            ..NodeState::default()
        };
        Ok(Arc::new(Self {
            name: name.to_string(),
            data_dir,
            config,
            host,
            state: Mutex::new(state),
            maintenance: MaintenanceLock::default(),
            shutdown,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn genesis(&self) -> Option<String> {
        self.state().genesis.clone()
    }

    pub fn follows(&self) -> Option<String> {
        self.state().follows.clone()
    }

    pub(crate) fn set_follows(&self, leader: Option<&str>) {
        self.state().follows = leader.map(String::from);
    }

    pub(crate) fn clear_genesis(&self) {
        self.state().genesis = None;
    }

    pub fn status(&self) -> NodeStatus {
        let st = self.state();
        NodeStatus {
            name: self.name.clone(),
            host_up: st.host_up,
            ts_start: st.ts_start,
            ts_heartbeat: st.ts_heartbeat,
            genesis: st.genesis.clone(),
            follows: st.follows.clone(),
            failure: st.failure,
        }
    }

    /// Handle one heartbeat. Returns `None` (an empty reply) while a
    /// maintenance task holds the lock; nothing is mutated in that case.
    pub fn heartbeat(&self, msg: &HeartbeatMessage, now: u64) -> Option<HeartbeatSnapshot> {
        debug!(node = %self.name, "received heartbeat");
        if self.maintenance.is_held() {
            info!(node = %self.name, "ignoring heartbeat during maintenance");
            return None;
        }

        let mut st = self.state();
        if !st.host_up {
            info!(node = %self.name, "host is up");
            st.host_up = true;
            st.ts_start = now;
        }
        st.ts_heartbeat = now;

        if let Some(cookie) = &msg.cookie_exec {
            if st.cookie_exec.is_none() {
                st.cookie_exec = Some(cookie.clone());
            }
        }
        if let Some(cookie) = &msg.cookie_data {
            if st.cookie_data.is_none() {
                st.cookie_data = Some(cookie.clone());
            }
        }
        if let Some(genesis) = &msg.genesis {
            if st.genesis.as_deref() != Some(genesis.as_str()) {
                st.genesis = Some(genesis.clone());
            }
        }

        Some(HeartbeatSnapshot {
            cookie_exec: st.cookie_exec.clone(),
            cookie_data: st.cookie_data.clone(),
            rnode_package_url: self.config.rnode_package_url(),
            follows: st.follows.clone(),
        })
    }

    /// Classify the node against its timeouts and latch the first match.
    /// Returns `None` while maintenance runs; a latched failure keeps being
    /// returned until a restart's stop phase clears it.
    pub fn check_failure(&self, now: u64) -> Option<NodeFailure> {
        if self.maintenance.is_held() {
            return None;
        }
        let mut st = self.state();
        if st.failure.is_none() {
            if let Some(failure) = self.evaluate_timeouts(&st, now) {
                info!(node = %self.name, "failure detected: {failure}");
                st.failure = Some(failure);
            }
        }
        st.failure
    }

    fn evaluate_timeouts(&self, st: &NodeState, now: u64) -> Option<NodeFailure> {
        if st.host_up && now > st.ts_heartbeat + self.config.timeout_heartbeat() {
            return Some(NodeFailure::TimeoutHeartbeat);
        }
        if st.host_up
            && st.genesis.is_none()
            && now > st.ts_start + self.config.timeout_start_rnode()
        {
            return Some(NodeFailure::TimeoutStartRnode);
        }
        if !st.host_up && now > st.ts_start + self.config.timeout_start_host() {
            return Some(NodeFailure::TimeoutStartHost);
        }
        None
    }

    /// Schedule a host start. Dropped silently if maintenance is already
    /// running.
    pub fn try_start_async(self: &Arc<Self>) {
        info!(node = %self.name, "scheduling start");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(_guard) = this.maintenance.try_acquire() else {
                debug!(node = %this.name, "maintenance already active, dropping start");
                return;
            };
            if let Err(e) = this.start_host().await {
                error!(node = %this.name, "start failed: {e}");
            }
        });
    }

    /// Schedule a stop+start. `clean_data` additionally wipes the data disk
    /// so the node re-syncs from its leader's genesis.
    pub fn try_restart_async(self: &Arc<Self>, clean_data: bool) {
        info!(node = %self.name, "scheduling restart (clean_data={clean_data})");
        let clean = if clean_data {
            CleanLevel::Data
        } else {
            CleanLevel::Stop
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(_guard) = this.maintenance.try_acquire() else {
                debug!(node = %this.name, "maintenance already active, dropping restart");
                return;
            };
            this.restart_host(clean).await;
        });
    }

    async fn start_host(&self) -> Result<(), HostError> {
        info!(node = %self.name, "starting");
        self.host.start(&self.shutdown).await?;
        {
            let mut st = self.state();
            if !st.host_up {
                st.ts_start = now_ts();
            }
        }
        info!(node = %self.name, "started");
        Ok(())
    }

    async fn restart_host(&self, clean: CleanLevel) {
        {
            let mut st = self.state();
            st.host_up = false;
            st.failure = None;
        }
        info!(node = %self.name, "stopping");
        match self.host.stop(clean, &self.shutdown).await {
            Ok(()) => info!(node = %self.name, "stopped"),
            Err(HostError::Cancelled) => {
                warn!(node = %self.name, "stop cancelled, skipping start");
                return;
            }
            // A failed stop still proceeds to the start phase; the next
            // reconciliation tick deals with whatever state remains.
            Err(e) => error!(node = %self.name, "stop failed: {e}"),
        }
        if let Err(e) = self.start_host().await {
            error!(node = %self.name, "restart failed: {e}");
        }
    }
}
