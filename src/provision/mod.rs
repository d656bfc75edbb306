//! # Provisioning Provider
//!
//! Boundary to whatever actually creates and destroys backend instances. No
//! concrete cloud API is assumed; the fleet scaler only needs "give me an
//! instance matching this request" and "this instance id is gone".
//!
//! [`StaticPoolProvisioner`] serves deployments with a pre-provisioned
//! standby pool (and doubles as the test double): adding an instance draws a
//! spec from the pool, removing one returns it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::ServerSpec;

/// What the scaler asks the provider for when growing the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceRequest {
    /// Region the new instance should land in.
    pub region: String,

    /// Throughput budget for the new instance.
    pub capacity: u32,

    /// Metadata to attach to the new instance.
    pub metadata: HashMap<String, String>,
}

impl Default for InstanceRequest {
    fn default() -> Self {
        Self {
            region: "default".to_string(),
            capacity: 100,
            metadata: HashMap::new(),
        }
    }
}

/// Abstract add/remove-instance hook invoked by the fleet scaler.
#[async_trait]
pub trait ProvisioningProvider: Send + Sync {
    /// Provision one instance and return its spec, ready for registration.
    async fn add_instance(&self, request: &InstanceRequest) -> BalancerResult<ServerSpec>;

    /// Tear down an instance after it has been drained and deregistered.
    async fn remove_instance(&self, id: &str) -> BalancerResult<()>;
}

/// Provider backed by a fixed standby pool of pre-provisioned instances.
pub struct StaticPoolProvisioner {
    pool: Mutex<Vec<ServerSpec>>,
}

impl StaticPoolProvisioner {
    pub fn new(pool: Vec<ServerSpec>) -> Self {
        Self {
            pool: Mutex::new(pool),
        }
    }

    /// Instances still available in the standby pool.
    pub fn available(&self) -> usize {
        self.pool.lock().len()
    }
}

#[async_trait]
impl ProvisioningProvider for StaticPoolProvisioner {
    async fn add_instance(&self, request: &InstanceRequest) -> BalancerResult<ServerSpec> {
        let mut pool = self.pool.lock();

        // Prefer a standby instance in the requested region, fall back to any.
        let index = pool
            .iter()
            .position(|spec| spec.region == request.region)
            .or_else(|| (!pool.is_empty()).then_some(0))
            .ok_or_else(|| BalancerError::provisioning("standby pool exhausted"))?;

        let spec = pool.remove(index);
        info!(
            region = %spec.region,
            requested_region = %request.region,
            remaining = pool.len(),
            "drew instance from standby pool"
        );
        Ok(spec)
    }

    async fn remove_instance(&self, id: &str) -> BalancerResult<()> {
        // Static instances are not torn down; they just leave the fleet.
        debug!(server_id = %id, "released instance back to operator control");
        Ok(())
    }
}
