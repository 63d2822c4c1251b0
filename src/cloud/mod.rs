//! Cloud provider seam.
//!
//! The host driver consumes exactly one trait, [`CloudProvider`], with one
//! method per SDK primitive. Calls are blocking; the driver offloads them to
//! the worker pool. [`gcp::GcpProvider`] is the production implementation,
//! `mock::MockCloud` the test one.

pub mod gcp;
#[cfg(test)]
pub mod mock;

use std::collections::BTreeMap;

use thiserror::Error;

/// Region of a zone name: `us-central1-a` → `us-central1`.
pub fn region_of(zone: &str) -> &str {
    zone.rsplit_once('-').map(|(region, _)| region).unwrap_or(zone)
}

/// Cloud API failure modes. `NotFound`, `AlreadyExists`, and `InUse` are the
/// signals the host driver absorbs during idempotent reconciliation; every
/// other kind aborts the maintenance run.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    #[error("resource not found")]
    NotFound,
    #[error("resource already exists")]
    AlreadyExists,
    #[error("resource in use")]
    InUse,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("cloud api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// A reserved external IP address
#[derive(Debug, Clone)]
pub struct Address {
    pub name: String,
    pub address: String,
}

/// A persistent volume
#[derive(Debug, Clone)]
pub struct Volume {
    pub name: String,
    pub size_gb: u64,
    pub ssd: bool,
}

/// A compute instance
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub running: bool,
}

/// Everything needed to create a compute instance
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub machine_type: String,
    pub boot_image: String,
    pub network: String,
    pub subnetwork: Option<String>,
    pub external_ip: String,
}

/// Blocking cloud primitives, one logical operation per method.
///
/// Implementations must be safe to call from multiple worker threads; the
/// controller shares a single provider across the whole fleet.
pub trait CloudProvider: Send + Sync {
    fn get_address(&self, region: &str, name: &str) -> Result<Address, CloudError>;
    fn create_address(&self, region: &str, name: &str) -> Result<Address, CloudError>;
    fn delete_address(&self, region: &str, name: &str) -> Result<(), CloudError>;

    fn create_dns_record(
        &self,
        zone: &str,
        name: &str,
        ttl: u32,
        ip: &str,
    ) -> Result<(), CloudError>;
    fn delete_dns_record(&self, zone: &str, name: &str) -> Result<(), CloudError>;

    fn get_volume(&self, zone: &str, name: &str) -> Result<Volume, CloudError>;
    fn create_volume(
        &self,
        zone: &str,
        name: &str,
        size_gb: u64,
        ssd: bool,
    ) -> Result<Volume, CloudError>;
    fn delete_volume(&self, zone: &str, name: &str) -> Result<(), CloudError>;

    fn get_instance(&self, zone: &str, name: &str) -> Result<Instance, CloudError>;
    fn create_instance(&self, zone: &str, spec: &InstanceSpec) -> Result<Instance, CloudError>;
    fn delete_instance(&self, zone: &str, name: &str) -> Result<(), CloudError>;

    fn attach_volume(&self, zone: &str, instance: &str, volume: &str) -> Result<(), CloudError>;
    fn set_tags(&self, zone: &str, instance: &str, tags: &[String]) -> Result<(), CloudError>;
    fn set_metadata(
        &self,
        zone: &str,
        instance: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), CloudError>;

    fn start_instance(&self, zone: &str, name: &str) -> Result<(), CloudError>;
    fn stop_instance(&self, zone: &str, name: &str) -> Result<(), CloudError>;
}
