//! Host driver: idempotent reconciliation of one node's cloud resources.
//!
//! `start()` converges the reserved address, DNS record, data disk, and
//! compute instance to a running state; `stop()` tears them down to the
//! requested [`CleanLevel`]. Every provider call runs on the blocking worker
//! pool, bounded by the node's `compute_timeout`, with a cancellation
//! checkpoint between sub-steps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cloud::{region_of, CloudError, CloudProvider, InstanceSpec};
use crate::types::CleanLevel;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("cloud call failed: {0}")]
    Cloud(#[from] CloudError),
    #[error("host config incomplete: {0}")]
    Config(String),
    #[error("maintenance cancelled")]
    Cancelled,
    #[error("cloud call timed out after {0}s")]
    Timeout(u64),
    #[error("worker pool failure: {0}")]
    Worker(String),
}

/// Config subset consumed by `start()`
#[derive(Debug, Clone, Deserialize)]
struct StartParams {
    resources_name: String,
    hostname: String,
    #[serde(default = "default_hostname_ttl")]
    hostname_ttl: u32,
    cloud_compute_zone: String,
    cloud_dns_zone: String,
    data_disk_size: u64,
    #[serde(default)]
    data_disk_ssd: bool,
    machine_type: String,
    boot_image: String,
    cloud_compute_net: String,
    #[serde(default)]
    cloud_compute_subnet: Option<String>,
    #[serde(default)]
    cloud_compute_tags: Vec<String>,
    #[serde(default)]
    host_metadata: BTreeMap<String, Value>,
    #[serde(default = "default_compute_timeout")]
    compute_timeout: u64,
}

/// Config subset consumed by `stop()`
#[derive(Debug, Clone, Deserialize)]
struct StopParams {
    resources_name: String,
    hostname: String,
    cloud_compute_zone: String,
    cloud_dns_zone: String,
    #[serde(default = "default_compute_timeout")]
    compute_timeout: u64,
}

fn default_hostname_ttl() -> u32 {
    300
}

fn default_compute_timeout() -> u64 {
    600
}

/// Metadata values are arbitrary JSON in the node config; the cloud wants
/// strings.
fn metadata_strings(metadata: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect()
}

pub struct HostDriver {
    node: String,
    config: Value,
    cloud: Arc<dyn CloudProvider>,
}

impl HostDriver {
    pub fn new(node: &str, config: Value, cloud: Arc<dyn CloudProvider>) -> Self {
        Self {
            node: node.to_string(),
            config,
            cloud,
        }
    }

    fn params<P: serde::de::DeserializeOwned>(&self) -> Result<P, HostError> {
        serde_json::from_value(self.config.clone()).map_err(|e| HostError::Config(e.to_string()))
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<(), HostError> {
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled);
        }
        Ok(())
    }

    /// Offload one provider call to the worker pool, bounded by the node's
    /// compute timeout
    async fn call<T, F>(&self, timeout_secs: u64, f: F) -> Result<T, HostError>
    where
        F: FnOnce(&dyn CloudProvider) -> Result<T, CloudError> + Send + 'static,
        T: Send + 'static,
    {
        let cloud = Arc::clone(&self.cloud);
        let work = tokio::task::spawn_blocking(move || f(cloud.as_ref()));
        match tokio::time::timeout(Duration::from_secs(timeout_secs), work).await {
            Err(_) => Err(HostError::Timeout(timeout_secs)),
            Ok(Err(join)) => Err(HostError::Worker(join.to_string())),
            Ok(Ok(result)) => Ok(result?),
        }
    }

    /// Reconcile everything to a running host. Safe to call repeatedly;
    /// already-existing resources are reused.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), HostError> {
        info!(node = %self.node, "start() begins");
        let result = self.start_steps(cancel).await;
        match &result {
            Ok(()) => info!(node = %self.node, "start() finished"),
            Err(e) => error!(node = %self.node, "start() failed: {e}"),
        }
        result
    }

    async fn start_steps(&self, cancel: &CancellationToken) -> Result<(), HostError> {
        let p: StartParams = self.params()?;
        let zone = p.cloud_compute_zone.clone();
        let region = region_of(&zone).to_string();
        let timeout = p.compute_timeout;
        self.checkpoint(cancel)?;

        info!(node = %self.node, "ensuring external static IP address");
        let addr = {
            let (r, n) = (region.clone(), p.resources_name.clone());
            match self.call(timeout, move |c| c.get_address(&r, &n)).await {
                Ok(addr) => {
                    info!(node = %self.node, "exists");
                    addr
                }
                Err(HostError::Cloud(CloudError::NotFound)) => {
                    let (r, n) = (region.clone(), p.resources_name.clone());
                    let addr = self.call(timeout, move |c| c.create_address(&r, &n)).await?;
                    info!(node = %self.node, "created");
                    addr
                }
                Err(e) => return Err(e),
            }
        };
        info!(node = %self.node, "external static IP address: {}", addr.address);
        self.checkpoint(cancel)?;

        info!(node = %self.node, "ensuring DNS record: {}", p.hostname);
        {
            let (z, h, ttl, ip) = (
                p.cloud_dns_zone.clone(),
                p.hostname.clone(),
                p.hostname_ttl,
                addr.address.clone(),
            );
            match self
                .call(timeout, move |c| c.create_dns_record(&z, &h, ttl, &ip))
                .await
            {
                Ok(()) => info!(node = %self.node, "created"),
                Err(HostError::Cloud(CloudError::AlreadyExists)) => {
                    info!(node = %self.node, "exists")
                }
                Err(e) => return Err(e),
            }
        }
        self.checkpoint(cancel)?;

        let data_disk_name = format!("{}-data", p.resources_name);
        info!(node = %self.node, "ensuring data disk {}", data_disk_name);
        let volume = {
            let (z, n) = (zone.clone(), data_disk_name.clone());
            match self.call(timeout, move |c| c.get_volume(&z, &n)).await {
                Ok(volume) => {
                    info!(node = %self.node, "exists");
                    volume
                }
                Err(HostError::Cloud(CloudError::NotFound)) => {
                    let (z, n, size, ssd) = (
                        zone.clone(),
                        data_disk_name.clone(),
                        p.data_disk_size,
                        p.data_disk_ssd,
                    );
                    let volume = self
                        .call(timeout, move |c| c.create_volume(&z, &n, size, ssd))
                        .await?;
                    info!(node = %self.node, "created");
                    volume
                }
                Err(e) => return Err(e),
            }
        };
        info!(
            node = %self.node,
            "data disk: {}GB {}",
            volume.size_gb,
            if volume.ssd { "pd-ssd" } else { "pd-standard" }
        );
        self.checkpoint(cancel)?;

        info!(node = %self.node, "ensuring host {}", p.resources_name);
        {
            let (z, n) = (zone.clone(), p.resources_name.clone());
            match self.call(timeout, move |c| c.get_instance(&z, &n)).await {
                Ok(_) => info!(node = %self.node, "exists"),
                Err(HostError::Cloud(CloudError::NotFound)) => {
                    let z = zone.clone();
                    let spec = InstanceSpec {
                        name: p.resources_name.clone(),
                        machine_type: p.machine_type.clone(),
                        boot_image: p.boot_image.clone(),
                        network: p.cloud_compute_net.clone(),
                        subnetwork: p.cloud_compute_subnet.clone(),
                        external_ip: addr.address.clone(),
                    };
                    self.call(timeout, move |c| c.create_instance(&z, &spec)).await?;
                    info!(node = %self.node, "created");
                }
                Err(e) => return Err(e),
            }
        }
        self.checkpoint(cancel)?;

        info!(node = %self.node, "attaching data disk");
        {
            let (z, i, v) = (zone.clone(), p.resources_name.clone(), data_disk_name.clone());
            match self.call(timeout, move |c| c.attach_volume(&z, &i, &v)).await {
                Ok(()) => info!(node = %self.node, "attached"),
                Err(HostError::Cloud(CloudError::InUse)) => {
                    info!(node = %self.node, "already attached")
                }
                Err(e) => return Err(e),
            }
        }
        self.checkpoint(cancel)?;

        info!(node = %self.node, "setting host tags");
        {
            let (z, i, tags) = (zone.clone(), p.resources_name.clone(), p.cloud_compute_tags.clone());
            self.call(timeout, move |c| c.set_tags(&z, &i, &tags)).await?;
        }

        info!(node = %self.node, "setting host metadata");
        {
            let (z, i) = (zone.clone(), p.resources_name.clone());
            let metadata = metadata_strings(&p.host_metadata);
            self.call(timeout, move |c| c.set_metadata(&z, &i, &metadata)).await?;
        }
        self.checkpoint(cancel)?;

        info!(node = %self.node, "starting host");
        {
            let (z, n) = (zone.clone(), p.resources_name.clone());
            self.call(timeout, move |c| c.start_instance(&z, &n)).await?;
        }
        info!(node = %self.node, "started");
        Ok(())
    }

    /// Graded teardown. Each level destroys a strict superset of the level
    /// below it; resources that are already gone are not an error.
    pub async fn stop(&self, clean: CleanLevel, cancel: &CancellationToken) -> Result<(), HostError> {
        info!(node = %self.node, "stop(clean={clean}) begins");
        let result = self.stop_steps(clean, cancel).await;
        match &result {
            Ok(()) => info!(node = %self.node, "stop() finished"),
            Err(e) => error!(node = %self.node, "stop() failed: {e}"),
        }
        result
    }

    async fn stop_steps(&self, clean: CleanLevel, cancel: &CancellationToken) -> Result<(), HostError> {
        let p: StopParams = self.params()?;
        let zone = p.cloud_compute_zone.clone();
        let region = region_of(&zone).to_string();
        let timeout = p.compute_timeout;
        self.checkpoint(cancel)?;

        info!(node = %self.node, "stopping host");
        let instance_present = {
            let (z, n) = (zone.clone(), p.resources_name.clone());
            match self.call(timeout, move |c| c.stop_instance(&z, &n)).await {
                Ok(()) => {
                    info!(node = %self.node, "stopped");
                    true
                }
                Err(HostError::Cloud(CloudError::NotFound)) => {
                    info!(node = %self.node, "not present");
                    false
                }
                Err(e) => return Err(e),
            }
        };
        if clean <= CleanLevel::Stop {
            return Ok(());
        }
        self.checkpoint(cancel)?;

        if instance_present {
            info!(node = %self.node, "removing host");
            let (z, n) = (zone.clone(), p.resources_name.clone());
            match self.call(timeout, move |c| c.delete_instance(&z, &n)).await {
                Ok(()) => info!(node = %self.node, "removed"),
                Err(HostError::Cloud(CloudError::NotFound)) => {
                    info!(node = %self.node, "not present")
                }
                Err(e) => return Err(e),
            }
        }
        if clean <= CleanLevel::Host {
            return Ok(());
        }
        self.checkpoint(cancel)?;

        info!(node = %self.node, "removing data disk");
        {
            let (z, n) = (zone.clone(), format!("{}-data", p.resources_name));
            match self.call(timeout, move |c| c.delete_volume(&z, &n)).await {
                Ok(()) => info!(node = %self.node, "removed"),
                Err(HostError::Cloud(CloudError::NotFound)) => {
                    info!(node = %self.node, "not present")
                }
                Err(e) => return Err(e),
            }
        }
        if clean <= CleanLevel::Data {
            return Ok(());
        }
        self.checkpoint(cancel)?;

        info!(node = %self.node, "removing DNS record");
        {
            let (z, h) = (p.cloud_dns_zone.clone(), p.hostname.clone());
            match self.call(timeout, move |c| c.delete_dns_record(&z, &h)).await {
                Ok(()) => info!(node = %self.node, "removed"),
                Err(HostError::Cloud(CloudError::NotFound)) => {
                    info!(node = %self.node, "not present")
                }
                Err(e) => return Err(e),
            }
        }
        self.checkpoint(cancel)?;

        info!(node = %self.node, "removing external static IP address");
        {
            let (r, n) = (region.clone(), p.resources_name.clone());
            match self.call(timeout, move |c| c.delete_address(&r, &n)).await {
                Ok(()) => info!(node = %self.node, "removed"),
                Err(HostError::Cloud(CloudError::NotFound)) => {
                    info!(node = %self.node, "not present")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
