//! Network controller.
//!
//! Owns the node registry, bootstraps supervisors from disk, and runs the
//! periodic reconciliation tick: failure detection first, then leader
//! election by majority over observed genesis blocks, then re-pointing of
//! every node that disagrees with the leader.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cloud::CloudProvider;
use crate::config::AppConfig;
use crate::error::ControllerError;
use crate::node::{NodeStatus, NodeSupervisor};
use crate::types::{HeartbeatMessage, HeartbeatMode, HeartbeatReply};
use crate::util::{now_ts, resolve_path};

/// Fleet summary served by the status endpoint
#[derive(Debug, Serialize)]
pub struct FleetStatus {
    pub leader: Option<String>,
    pub nodes: Vec<NodeStatus>,
}

pub struct NetworkController {
    app_config: Arc<AppConfig>,
    cloud: Arc<dyn CloudProvider>,
    nodes: RwLock<HashMap<String, Arc<NodeSupervisor>>>,
    leader: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

impl NetworkController {
    pub fn new(app_config: Arc<AppConfig>, cloud: Arc<dyn CloudProvider>) -> Arc<Self> {
        Arc::new(Self {
            app_config,
            cloud,
            nodes: RwLock::new(HashMap::new()),
            leader: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.app_config
    }

    /// Root token cancelling every maintenance task on shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn leader_name(&self) -> Option<String> {
        self.leader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn clear_leader(&self) {
        *self
            .leader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    /// Register a node and schedule its first start. Registering an existing
    /// name is a no-op; the supplied config is ignored in that case.
    pub async fn create_node(
        &self,
        name: &str,
        config_user: Option<Value>,
    ) -> Result<bool, ControllerError> {
        validate_node_name(name)?;
        {
            let nodes = self.nodes.read().await;
            if nodes.contains_key(name) {
                warn!(node = %name, "node already registered, ignoring supplied config");
                return Ok(false);
            }
        }

        info!(node = %name, "creating node");
        let node = NodeSupervisor::new(
            &self.app_config,
            Arc::clone(&self.cloud),
            name,
            config_user,
            self.shutdown.child_token(),
        )?;
        {
            let mut nodes = self.nodes.write().await;
            if nodes.contains_key(name) {
                warn!(node = %name, "node registered concurrently, dropping duplicate");
                return Ok(false);
            }
            nodes.insert(name.to_string(), Arc::clone(&node));
        }
        node.try_start_async();
        info!(node = %name, "created");
        Ok(true)
    }

    /// Forward a heartbeat to a node, resolving its follow-target to the
    /// leader's `rnode_addr`. `Ok(None)` means the node is in maintenance
    /// and the agent gets an empty reply.
    pub async fn heartbeat(
        &self,
        name: &str,
        msg: &HeartbeatMessage,
    ) -> Result<Option<HeartbeatReply>, ControllerError> {
        let nodes = self.nodes.read().await;
        let node = nodes
            .get(name)
            .ok_or_else(|| ControllerError::UnknownNode(name.to_string()))?;
        let Some(snapshot) = node.heartbeat(msg, now_ts()) else {
            return Ok(None);
        };

        let reply = match snapshot.follows {
            Some(leader_name) => {
                let leader_addr = nodes
                    .get(&leader_name)
                    .and_then(|leader| leader.config().rnode_addr());
                if leader_addr.is_none() {
                    warn!(node = %name, "followed leader {leader_name} has no rnode_addr");
                }
                HeartbeatReply {
                    cookie_exec: snapshot.cookie_exec,
                    cookie_data: snapshot.cookie_data,
                    rnode_package_url: snapshot.rnode_package_url,
                    mode: HeartbeatMode::Follower,
                    leader: leader_addr,
                }
            }
            None => HeartbeatReply {
                cookie_exec: snapshot.cookie_exec,
                cookie_data: snapshot.cookie_data,
                rnode_package_url: snapshot.rnode_package_url,
                mode: HeartbeatMode::Leader,
                leader: None,
            },
        };
        Ok(Some(reply))
    }

    /// Path of a node-served file, validated before any filesystem access
    pub fn node_file_path(&self, name: &str, filename: &str) -> Result<PathBuf, ControllerError> {
        validate_node_name(name)?;
        let files_dir = self
            .app_config
            .nodes_data_dir()
            .join(name)
            .join(crate::node::config::FILES_DIR);
        resolve_path(&files_dir, filename)
    }

    pub async fn fleet_status(&self) -> FleetStatus {
        let nodes = self.nodes.read().await;
        let mut list: Vec<NodeStatus> = nodes.values().map(|node| node.status()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        FleetStatus {
            leader: self.leader_name(),
            nodes: list,
        }
    }

    /// Create the data directories and one supervisor per pre-existing node
    /// directory, scheduling a start for each.
    pub async fn bootstrap(&self) -> Result<(), ControllerError> {
        let nodes_dir = self.app_config.nodes_data_dir();
        std::fs::create_dir_all(&nodes_dir)?;
        std::fs::create_dir_all(self.app_config.templates_dir())?;

        for entry in std::fs::read_dir(&nodes_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            self.create_node(&name, None).await?;
        }
        Ok(())
    }

    /// Bootstrap, wait out the initial delay, then reconcile every
    /// `check_interval` seconds until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), ControllerError> {
        self.bootstrap().await?;

        info!(
            "controller loop starts in {}s, tick every {}s",
            self.app_config.initial_delay, self.app_config.check_interval
        );
        if !self.sleep_or_shutdown(self.app_config.initial_delay).await {
            return Ok(());
        }

        let mut rng = rand::rngs::StdRng::from_entropy();
        loop {
            self.reconcile_tick(now_ts(), &mut rng).await;
            if !self.sleep_or_shutdown(self.app_config.check_interval).await {
                return Ok(());
            }
        }
    }

    async fn sleep_or_shutdown(&self, secs: u64) -> bool {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(secs)) => true,
            () = self.shutdown.cancelled() => false,
        }
    }

    /// One reconciliation pass: latch failures and restart those nodes,
    /// partition the rest by genesis, keep or elect a leader among the
    /// largest partitions, and re-point everyone else at it.
    pub async fn reconcile_tick(&self, now: u64, rng: &mut impl Rng) {
        let nodes = self.nodes.read().await;

        let mut groups: BTreeMap<String, Vec<Arc<NodeSupervisor>>> = BTreeMap::new();
        for node in nodes.values() {
            if let Some(failure) = node.check_failure(now) {
                warn!(node = %node.name(), "node has failure: {failure}");
                node.try_restart_async(false);
                continue;
            }
            if let Some(genesis) = node.genesis() {
                groups.entry(genesis).or_default().push(Arc::clone(node));
            }
        }

        if groups.is_empty() {
            info!("there are no genesis blocks");
            return;
        }

        info!("existing genesis blocks (hash / nodes):");
        for (genesis, members) in &groups {
            info!("  {} {}", genesis, members.len());
        }

        let largest = groups.values().map(Vec::len).max().unwrap_or(0);
        let majority: Vec<&Vec<Arc<NodeSupervisor>>> =
            groups.values().filter(|group| group.len() == largest).collect();

        let leader_name = {
            let mut leader_slot = self
                .leader
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if let Some(current) = leader_slot.clone() {
                let retained = majority
                    .iter()
                    .any(|group| group.iter().any(|node| node.name() == current));
                if !retained {
                    *leader_slot = None;
                }
            }

            match leader_slot.clone() {
                Some(name) => {
                    info!("retained leader: {name}");
                    name
                }
                None => {
                    let group = majority.choose(rng).expect("majority set is non-empty");
                    let chosen = group.choose(rng).expect("genesis group is non-empty");
                    chosen.set_follows(None);
                    *leader_slot = Some(chosen.name().to_string());
                    info!("picked new leader: {}", chosen.name());
                    chosen.name().to_string()
                }
            }
        };

        let leader_genesis = nodes.get(&leader_name).and_then(|node| node.genesis());

        for node in nodes.values() {
            if node.name() == leader_name {
                continue;
            }
            let genesis = node.genesis();
            if genesis.is_some() && genesis != leader_genesis {
                info!(node = %node.name(), "node has divergent genesis");
                node.clear_genesis();
                node.set_follows(Some(&leader_name));
                node.try_restart_async(true);
            } else if node.follows().as_deref() != Some(leader_name.as_str()) {
                info!(node = %node.name(), "node follows the wrong leader");
                node.set_follows(Some(&leader_name));
                node.try_restart_async(false);
            }
        }
    }
}

fn validate_node_name(name: &str) -> Result<(), ControllerError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ControllerError::InvalidFilename(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloud;
    use rand::rngs::StdRng;
    use serde_json::json;
    use std::collections::HashSet;

    fn test_controller(dir: &std::path::Path, cloud: &Arc<MockCloud>) -> Arc<NetworkController> {
        let app = AppConfig {
            data_dir: dir.to_path_buf(),
            node_config_global: json!({
                "cloud_compute_zone": "us-central1-a",
                "cloud_dns_zone": "testnet-zone",
                "data_disk_size": 100,
                "machine_type": "n1-standard-2",
                "boot_image": "projects/debian-cloud/global/images/family/debian-12",
                "cloud_compute_net": "default",
                "rnode_package_url": "https://example.com/rnode.tgz",
            }),
            ..AppConfig::default()
        };
        NetworkController::new(Arc::new(app), Arc::clone(cloud) as Arc<dyn CloudProvider>)
    }

    /// Heartbeat with a genesis; a maintenance-ignored heartbeat is fine.
    async fn send_genesis(controller: &NetworkController, name: &str, genesis: &str) {
        let msg = HeartbeatMessage {
            genesis: Some(genesis.to_string()),
            ..HeartbeatMessage::default()
        };
        controller.heartbeat(name, &msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_node_becomes_leader() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);

        controller.create_node("solo", Some(json!({}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        send_genesis(&controller, "solo", "g0").await;

        let mut rng = StdRng::seed_from_u64(0);
        controller.reconcile_tick(now_ts(), &mut rng).await;
        assert_eq!(controller.leader_name().as_deref(), Some("solo"));

        let status = controller.fleet_status().await;
        let solo = status.nodes.iter().find(|n| n.name == "solo").unwrap();
        assert!(solo.follows.is_none());

        // The persisted config carries the generated identity.
        let full = crate::util::read_json(
            &controller.app_config().nodes_data_dir().join("solo").join("config.full.json"),
        )
        .unwrap();
        assert!(full["rnode_tls_key"].as_str().unwrap().contains("PRIVATE KEY"));
        let rnode_id = full["rnode_id"].as_str().unwrap();
        assert_eq!(rnode_id.len(), 40);
        assert_eq!(
            full["rnode_addr"].as_str().unwrap(),
            &format!("rnode://{rnode_id}@solo.?protocol=40400&discovery=40404")
        );
    }

    #[tokio::test]
    async fn test_two_vs_one_genesis_split() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);

        for name in ["a", "b", "c"] {
            controller.create_node(name, Some(json!({}))).await.unwrap();
        }
        // Let the initial start maintenance drain so restarts are not dropped.
        tokio::time::sleep(Duration::from_secs(1)).await;

        send_genesis(&controller, "a", "h1").await;
        send_genesis(&controller, "b", "h1").await;
        send_genesis(&controller, "c", "h2").await;

        let mut rng = StdRng::seed_from_u64(7);
        controller.reconcile_tick(now_ts(), &mut rng).await;

        let leader = controller.leader_name().unwrap();
        assert!(leader == "a" || leader == "b");

        let status = controller.fleet_status().await;
        let c = status.nodes.iter().find(|n| n.name == "c").unwrap();
        assert!(c.genesis.is_none());
        assert_eq!(c.follows.as_deref(), Some(leader.as_str()));

        // The minority node got a data-wiping restart.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cloud.op_count("delete_volume") >= 1);
        assert!(!cloud
            .ops()
            .iter()
            .any(|op| op.starts_with("delete_address")));
    }

    #[tokio::test]
    async fn test_leader_retained_across_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);

        for name in ["a", "b"] {
            controller.create_node(name, Some(json!({}))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        send_genesis(&controller, "a", "h1").await;
        send_genesis(&controller, "b", "h1").await;

        let mut rng = StdRng::seed_from_u64(1);
        controller.reconcile_tick(now_ts(), &mut rng).await;
        let first = controller.leader_name().unwrap();

        for _ in 0..5 {
            send_genesis(&controller, "a", "h1").await;
            send_genesis(&controller, "b", "h1").await;
            controller.reconcile_tick(now_ts(), &mut rng).await;
            assert_eq!(controller.leader_name().unwrap(), first);
        }
    }

    #[tokio::test]
    async fn test_tie_breaks_randomly_over_many_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);

        for name in ["a", "b"] {
            controller.create_node(name, Some(json!({}))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut rng = StdRng::seed_from_u64(42);
        let mut leaders_seen = HashSet::new();
        for _ in 0..100 {
            send_genesis(&controller, "a", "g1").await;
            send_genesis(&controller, "b", "g2").await;
            controller.clear_leader();
            controller.reconcile_tick(now_ts(), &mut rng).await;
            if let Some(leader) = controller.leader_name() {
                leaders_seen.insert(leader);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(leaders_seen.contains("a"), "a never elected: {leaders_seen:?}");
        assert!(leaders_seen.contains("b"), "b never elected: {leaders_seen:?}");
    }

    #[tokio::test]
    async fn test_no_genesis_means_no_leader() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);
        controller.create_node("a", Some(json!({}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Heartbeat without genesis: alive but not a candidate.
        controller
            .heartbeat("a", &HeartbeatMessage::default())
            .await
            .unwrap()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        controller.reconcile_tick(now_ts(), &mut rng).await;
        assert!(controller.leader_name().is_none());
    }

    #[tokio::test]
    async fn test_failed_node_is_excluded_from_election() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);

        // "alive" gets a heartbeat timeout large enough to survive the
        // skewed clock below; "dead" never heartbeats at all.
        controller
            .create_node("alive", Some(json!({"timeout_heartbeat": 100_000})))
            .await
            .unwrap();
        controller.create_node("dead", Some(json!({}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        send_genesis(&controller, "alive", "h1").await;

        // Evaluate past dead's start-host timeout (its ts_start was stamped
        // by the initial start maintenance).
        let mut rng = StdRng::seed_from_u64(3);
        controller.reconcile_tick(now_ts() + 301, &mut rng).await;

        assert_eq!(controller.leader_name().as_deref(), Some("alive"));
        let status = controller.fleet_status().await;
        let dead = status.nodes.iter().find(|n| n.name == "dead").unwrap();
        assert!(dead.failure.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);
        let err = controller
            .heartbeat("ghost", &HeartbeatMessage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn test_follower_reply_carries_leader_addr() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);

        for name in ["a", "b"] {
            controller.create_node(name, Some(json!({}))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        send_genesis(&controller, "a", "h1").await;
        send_genesis(&controller, "b", "h2").await;

        let mut rng = StdRng::seed_from_u64(11);
        controller.reconcile_tick(now_ts(), &mut rng).await;
        let leader = controller.leader_name().unwrap();
        let follower = if leader == "a" { "b" } else { "a" };

        // Wait for the follower's clean restart to release its lock so the
        // heartbeat is not ignored.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let reply = controller
            .heartbeat(follower, &HeartbeatMessage::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.mode, HeartbeatMode::Follower);
        let addr = reply.leader.unwrap();
        assert!(addr.starts_with("rnode://"));
        assert!(addr.contains(&format!("@{leader}.?")));

        let reply = controller
            .heartbeat(&leader, &HeartbeatMessage::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.mode, HeartbeatMode::Leader);
        assert!(reply.leader.is_none());
    }

    #[tokio::test]
    async fn test_create_node_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);

        assert!(controller.create_node("a", Some(json!({}))).await.unwrap());
        assert!(!controller
            .create_node("a", Some(json!({"machine_type": "other"})))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_create_node_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);

        for bad in ["", "..", "a/b", ".hidden", "a b"] {
            let err = controller.create_node(bad, None).await.unwrap_err();
            assert!(matches!(err, ControllerError::InvalidFilename(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_bootstrap_restores_persisted_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        {
            let controller = test_controller(dir.path(), &cloud);
            controller.create_node("a", Some(json!({}))).await.unwrap();
            controller.create_node("b", Some(json!({}))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let controller = test_controller(dir.path(), &cloud);
        controller.bootstrap().await.unwrap();
        let status = controller.fleet_status().await;
        let names: Vec<&str> = status.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_file_path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let controller = test_controller(dir.path(), &cloud);

        let err = controller
            .node_file_path("a", "../etc/passwd")
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidFilename(_)));

        let err = controller.node_file_path("../a", "rnode.conf").unwrap_err();
        assert!(matches!(err, ControllerError::InvalidFilename(_)));

        let ok = controller.node_file_path("a", "rnode.conf").unwrap();
        assert!(ok.ends_with("nodes/a/files/rnode.conf"));
    }
}
