//! Provider client capability.
//!
//! The engine drives cloud resources exclusively through the
//! [`ProviderClient`] trait; any conforming implementation (real cloud SDK,
//! in-process fake) is usable. Errors carry stable kinds so handlers can
//! make typed decisions (most importantly "not found" tolerance during
//! cleanup).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

// ═══════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════

/// Provider-side failures with stable kinds.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("blue/green deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("provider api error: {0}")]
    Api(String),
}

impl ProviderError {
    /// All "the resource does not exist" kinds; cleanup paths treat these
    /// as success.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProviderError::ClusterNotFound(_)
                | ProviderError::InstanceNotFound(_)
                | ProviderError::DeploymentNotFound(_)
                | ProviderError::NotFound(_)
        )
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

// ═══════════════════════════════════════════════════════════════════════════
// Read model
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Writer,
    Reader,
}

/// One cluster member as the provider reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    pub instance_id: String,
    pub role: MemberRole,
    pub status: String,
    pub instance_type: String,
    pub storage_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_throughput: Option<i64>,
    /// Provisioned by a cloud-side scaling policy; plan builders skip these
    #[serde(default)]
    pub autoscaled: bool,
    #[serde(default)]
    pub promotion_tier: i32,
}

/// Cluster snapshot used by plan builders and handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_id: String,
    pub status: String,
    pub engine: String,
    pub engine_version: String,
    pub parameter_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    pub members: Vec<ClusterMember>,
}

impl ClusterInfo {
    pub fn writer(&self) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.role == MemberRole::Writer)
    }

    pub fn member(&self, instance_id: &str) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.instance_id == instance_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    pub status: String,
    pub instance_type: String,
    pub storage_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_throughput: Option<i64>,
    pub parameter_group: String,
    pub engine: String,
    pub engine_version: String,
}

/// One engine configuration parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
    /// "immediate" or "pending-reboot"
    pub apply_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueGreenTask {
    pub name: String,
    /// PENDING | IN_PROGRESS | COMPLETED | FAILED
    pub status: String,
}

/// Source/target pair reported per resource after a switchover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchoverDetail {
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueGreenDeployment {
    pub identifier: String,
    pub name: String,
    /// PROVISIONING | AVAILABLE | SWITCHOVER_IN_PROGRESS |
    /// SWITCHOVER_COMPLETED | SWITCHOVER_FAILED | INVALID_CONFIGURATION |
    /// PROVISIONING_FAILED | DELETING
    pub status: String,
    /// Source cluster ARN
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub tasks: Vec<BlueGreenTask>,
    #[serde(default)]
    pub switchover_details: Vec<SwitchoverDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyTarget {
    /// Cluster or instance identifier
    pub id: String,
    /// TRACKED_CLUSTER or RDS_INSTANCE
    pub target_type: String,
    /// AVAILABLE | UNAVAILABLE | REGISTERING
    pub health: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// Write requests
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub cluster_id: String,
    pub instance_id: String,
    pub instance_type: String,
    pub engine: String,
    pub promotion_tier: i32,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyInstanceRequest {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_throughput: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_group: Option<String>,
    pub apply_immediately: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyClusterRequest {
    pub cluster_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_group: Option<String>,
    pub allow_major_version_upgrade: bool,
    pub apply_immediately: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBlueGreenRequest {
    pub name: String,
    pub source_arn: String,
    pub target_engine_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_parameter_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_parameter_group: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Capability trait
// ═══════════════════════════════════════════════════════════════════════════

/// Narrow capability set the engine consumes.
///
/// Mutating calls must be idempotency-friendly: re-issuing a creation after a
/// partial failure reports [`ProviderError::AlreadyExists`] rather than
/// corrupting state, and deletions of missing resources report a not-found
/// kind.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    // ── reads ──────────────────────────────────────────────────────────────
    async fn list_clusters(&self) -> ProviderResult<Vec<String>>;
    async fn get_cluster_info(&self, cluster_id: &str) -> ProviderResult<ClusterInfo>;
    async fn get_instance_info(&self, instance_id: &str) -> ProviderResult<InstanceInfo>;
    async fn get_cluster_arn(&self, cluster_id: &str) -> ProviderResult<String>;
    async fn get_cluster_parameter_group(&self, cluster_id: &str) -> ProviderResult<String>;
    async fn get_instance_parameter_group(&self, instance_id: &str) -> ProviderResult<String>;
    /// User-modified parameters only.
    async fn get_cluster_custom_parameters(&self, group: &str) -> ProviderResult<Vec<Parameter>>;
    /// User-modified parameters only.
    async fn get_instance_custom_parameters(&self, group: &str) -> ProviderResult<Vec<Parameter>>;
    /// Provider default parameter group name for an engine family.
    async fn get_default_parameter_group(
        &self,
        family: &str,
        cluster: bool,
    ) -> ProviderResult<String>;
    async fn list_blue_green_deployments_for_cluster(
        &self,
        cluster_id: &str,
    ) -> ProviderResult<Vec<BlueGreenDeployment>>;
    async fn describe_blue_green_deployment(
        &self,
        identifier: &str,
    ) -> ProviderResult<BlueGreenDeployment>;
    async fn find_proxies_for_cluster(&self, cluster_id: &str) -> ProviderResult<Vec<ProxyInfo>>;
    async fn get_proxy_targets(&self, proxy_name: &str) -> ProviderResult<Vec<ProxyTarget>>;
    async fn get_orderable_instance_types(
        &self,
        engine: &str,
        engine_version: &str,
    ) -> ProviderResult<Vec<String>>;
    async fn get_valid_upgrade_targets(
        &self,
        engine: &str,
        engine_version: &str,
    ) -> ProviderResult<Vec<String>>;
    /// None when the snapshot does not exist.
    async fn get_snapshot_status(&self, snapshot_id: &str) -> ProviderResult<Option<String>>;

    // ── writes ─────────────────────────────────────────────────────────────
    async fn create_cluster_instance(&self, req: &CreateInstanceRequest) -> ProviderResult<()>;
    async fn modify_instance(&self, req: &ModifyInstanceRequest) -> ProviderResult<()>;
    async fn delete_instance(&self, instance_id: &str) -> ProviderResult<()>;
    async fn reboot_instance(&self, instance_id: &str) -> ProviderResult<()>;
    async fn failover_cluster(&self, cluster_id: &str, target_instance: &str)
        -> ProviderResult<()>;
    async fn modify_cluster(&self, req: &ModifyClusterRequest) -> ProviderResult<()>;
    async fn create_cluster_snapshot(
        &self,
        cluster_id: &str,
        snapshot_id: &str,
    ) -> ProviderResult<()>;
    async fn create_cluster_parameter_group(
        &self,
        name: &str,
        family: &str,
        description: &str,
    ) -> ProviderResult<()>;
    async fn modify_cluster_parameter_group(
        &self,
        name: &str,
        parameters: &[Parameter],
    ) -> ProviderResult<()>;
    async fn create_instance_parameter_group(
        &self,
        name: &str,
        family: &str,
        description: &str,
    ) -> ProviderResult<()>;
    async fn modify_instance_parameter_group(
        &self,
        name: &str,
        parameters: &[Parameter],
    ) -> ProviderResult<()>;
    /// Returns the new deployment identifier.
    async fn create_blue_green_deployment(
        &self,
        req: &CreateBlueGreenRequest,
    ) -> ProviderResult<String>;
    async fn switchover_blue_green_deployment(
        &self,
        identifier: &str,
        timeout_secs: Option<i64>,
    ) -> ProviderResult<()>;
    async fn delete_blue_green_deployment(&self, identifier: &str) -> ProviderResult<()>;
    async fn delete_cluster(&self, cluster_id: &str) -> ProviderResult<()>;
    async fn register_proxy_targets(
        &self,
        proxy_name: &str,
        cluster_id: &str,
    ) -> ProviderResult<()>;
    async fn deregister_proxy_targets(&self, proxy_name: &str) -> ProviderResult<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Per-region manager
// ═══════════════════════════════════════════════════════════════════════════

/// Factory producing a client for a region on first reference.
pub type ProviderFactory = Arc<dyn Fn(&str) -> Arc<dyn ProviderClient> + Send + Sync>;

/// Caches one client per region; clients are created lazily and shared
/// across operations.
#[derive(Clone)]
pub struct ProviderManager {
    factory: ProviderFactory,
    clients: Arc<RwLock<HashMap<String, Arc<dyn ProviderClient>>>>,
}

impl ProviderManager {
    pub fn new(factory: ProviderFactory) -> Self {
        Self {
            factory,
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A manager that hands the same client to every region. Used by tests
    /// and single-region deployments.
    pub fn single(client: Arc<dyn ProviderClient>) -> Self {
        Self::new(Arc::new(move |_region| client.clone()))
    }

    pub async fn for_region(&self, region: &str) -> Arc<dyn ProviderClient> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(region) {
                return client.clone();
            }
        }
        let mut clients = self.clients.write().await;
        // Double-checked: another task may have created it while we waited.
        if let Some(client) = clients.get(region) {
            return client.clone();
        }
        debug!(region = %region, "Creating provider client");
        let client = (self.factory)(region);
        clients.insert(region.to_string(), client.clone());
        client
    }
}
