//! Shared test fixtures: an in-memory scriptable provider and engine
//! builders with fast polling.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use rds_maintenance::config::EngineConfig;
use rds_maintenance::engine::Engine;
use rds_maintenance::notifier::NullNotifier;
use rds_maintenance::provider::*;
use rds_maintenance::store::{NullStore, OperationStore};

// ═══════════════════════════════════════════════════════════════════════════
// Fixture builders
// ═══════════════════════════════════════════════════════════════════════════

pub fn member(instance_id: &str, role: MemberRole) -> ClusterMember {
    ClusterMember {
        instance_id: instance_id.to_string(),
        role,
        status: "available".to_string(),
        instance_type: "db.r6g.large".to_string(),
        storage_type: "aurora".to_string(),
        iops: None,
        storage_throughput: None,
        autoscaled: false,
        promotion_tier: 1,
    }
}

pub fn autoscaled_member(instance_id: &str) -> ClusterMember {
    ClusterMember {
        autoscaled: true,
        ..member(instance_id, MemberRole::Reader)
    }
}

pub fn cluster(cluster_id: &str, members: Vec<ClusterMember>) -> ClusterInfo {
    ClusterInfo {
        cluster_id: cluster_id.to_string(),
        status: "available".to_string(),
        engine: "aurora-postgresql".to_string(),
        engine_version: "14.9".to_string(),
        parameter_group: "default.aurora-postgresql14".to_string(),
        arn: Some(format!(
            "arn:aws:rds:eu-central-1:123456789012:cluster:{cluster_id}"
        )),
        members,
    }
}

/// One writer and two readers, all non-autoscaled.
pub fn three_node_cluster(cluster_id: &str) -> ClusterInfo {
    cluster(
        cluster_id,
        vec![
            member(&format!("{cluster_id}-1"), MemberRole::Writer),
            member(&format!("{cluster_id}-2"), MemberRole::Reader),
            member(&format!("{cluster_id}-3"), MemberRole::Reader),
        ],
    )
}

// ═══════════════════════════════════════════════════════════════════════════
// FakeProvider
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct FakeState {
    pub clusters: HashMap<String, ClusterInfo>,
    pub deployments: HashMap<String, BlueGreenDeployment>,
    pub proxies: HashMap<String, Vec<ProxyInfo>>,
    pub proxy_targets: HashMap<String, Vec<ProxyTarget>>,
    pub snapshots: HashMap<String, String>,
    pub parameter_groups: HashMap<String, Vec<Parameter>>,
    pub orderable_types: Vec<String>,
    pub upgrade_targets: Vec<String>,
    /// Method call log, e.g. "delete_instance:db-main-1".
    pub calls: Vec<String>,
    /// Remaining injected failures per method name.
    pub fail: HashMap<String, u32>,
    /// Describes remaining before an initiated switchover completes.
    pub switchover_delay: u32,
    bg_counter: u64,
}

/// Initialize tracing once for the test binary; `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rds_maintenance=info".into()),
        )
        .with_test_writer()
        .try_init();
}

pub struct FakeProvider {
    pub state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
        })
    }

    pub fn with_cluster(info: ClusterInfo) -> Arc<Self> {
        let provider = Self::new();
        provider
            .state
            .lock()
            .unwrap()
            .clusters
            .insert(info.cluster_id.clone(), info);
        provider
    }

    /// Make the next `count` calls of `method` fail with an api error.
    pub fn fail_next(&self, method: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .fail
            .insert(method.to_string(), count);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, method: &str) -> usize {
        let prefix = format!("{method}:");
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix) || c.as_str() == method)
            .count()
    }

    fn enter(&self, method: &str, detail: &str) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        if detail.is_empty() {
            state.calls.push(method.to_string());
        } else {
            state.calls.push(format!("{method}:{detail}"));
        }
        if let Some(remaining) = state.fail.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::Api(format!("injected failure in {method}")));
            }
        }
        Ok(())
    }

    fn instance_lookup(state: &FakeState, instance_id: &str) -> Option<(String, ClusterMember)> {
        for info in state.clusters.values() {
            if let Some(m) = info.members.iter().find(|m| m.instance_id == instance_id) {
                return Some((info.cluster_id.clone(), m.clone()));
            }
        }
        None
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn list_clusters(&self) -> ProviderResult<Vec<String>> {
        self.enter("list_clusters", "")?;
        Ok(self.state.lock().unwrap().clusters.keys().cloned().collect())
    }

    async fn get_cluster_info(&self, cluster_id: &str) -> ProviderResult<ClusterInfo> {
        self.enter("get_cluster_info", cluster_id)?;
        self.state
            .lock()
            .unwrap()
            .clusters
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| ProviderError::ClusterNotFound(cluster_id.to_string()))
    }

    async fn get_instance_info(&self, instance_id: &str) -> ProviderResult<InstanceInfo> {
        self.enter("get_instance_info", instance_id)?;
        let state = self.state.lock().unwrap();
        let (cluster_id, m) = Self::instance_lookup(&state, instance_id)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance_id.to_string()))?;
        let cluster = &state.clusters[&cluster_id];
        Ok(InstanceInfo {
            instance_id: m.instance_id,
            cluster_id: Some(cluster_id.clone()),
            status: m.status,
            instance_type: m.instance_type,
            storage_type: m.storage_type,
            iops: m.iops,
            storage_throughput: m.storage_throughput,
            parameter_group: format!("default.{}14", cluster.engine),
            engine: cluster.engine.clone(),
            engine_version: cluster.engine_version.clone(),
        })
    }

    async fn get_cluster_arn(&self, cluster_id: &str) -> ProviderResult<String> {
        self.enter("get_cluster_arn", cluster_id)?;
        let state = self.state.lock().unwrap();
        let info = state
            .clusters
            .get(cluster_id)
            .ok_or_else(|| ProviderError::ClusterNotFound(cluster_id.to_string()))?;
        Ok(info.arn.clone().unwrap_or_else(|| {
            format!("arn:aws:rds:eu-central-1:123456789012:cluster:{cluster_id}")
        }))
    }

    async fn get_cluster_parameter_group(&self, cluster_id: &str) -> ProviderResult<String> {
        self.enter("get_cluster_parameter_group", cluster_id)?;
        let state = self.state.lock().unwrap();
        state
            .clusters
            .get(cluster_id)
            .map(|c| c.parameter_group.clone())
            .ok_or_else(|| ProviderError::ClusterNotFound(cluster_id.to_string()))
    }

    async fn get_instance_parameter_group(&self, instance_id: &str) -> ProviderResult<String> {
        self.enter("get_instance_parameter_group", instance_id)?;
        Ok("default.aurora-postgresql14".to_string())
    }

    async fn get_cluster_custom_parameters(&self, group: &str) -> ProviderResult<Vec<Parameter>> {
        self.enter("get_cluster_custom_parameters", group)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .parameter_groups
            .get(group)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_instance_custom_parameters(&self, group: &str) -> ProviderResult<Vec<Parameter>> {
        self.enter("get_instance_custom_parameters", group)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .parameter_groups
            .get(group)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_default_parameter_group(
        &self,
        family: &str,
        cluster: bool,
    ) -> ProviderResult<String> {
        self.enter("get_default_parameter_group", family)?;
        let _ = cluster;
        Ok(format!("default.{family}"))
    }

    async fn list_blue_green_deployments_for_cluster(
        &self,
        cluster_id: &str,
    ) -> ProviderResult<Vec<BlueGreenDeployment>> {
        self.enter("list_blue_green_deployments_for_cluster", cluster_id)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .deployments
            .values()
            .filter(|d| d.source.ends_with(&format!(":{cluster_id}")))
            .cloned()
            .collect())
    }

    async fn describe_blue_green_deployment(
        &self,
        identifier: &str,
    ) -> ProviderResult<BlueGreenDeployment> {
        self.enter("describe_blue_green_deployment", identifier)?;
        let mut state = self.state.lock().unwrap();
        if state.switchover_delay > 0 {
            state.switchover_delay -= 1;
            if state.switchover_delay == 0 {
                if let Some(d) = state.deployments.get_mut(identifier) {
                    if d.status == "SWITCHOVER_IN_PROGRESS" {
                        d.status = "SWITCHOVER_COMPLETED".to_string();
                    }
                }
            }
        }
        state
            .deployments
            .get(identifier)
            .cloned()
            .ok_or_else(|| ProviderError::DeploymentNotFound(identifier.to_string()))
    }

    async fn find_proxies_for_cluster(&self, cluster_id: &str) -> ProviderResult<Vec<ProxyInfo>> {
        self.enter("find_proxies_for_cluster", cluster_id)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .proxies
            .get(cluster_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_proxy_targets(&self, proxy_name: &str) -> ProviderResult<Vec<ProxyTarget>> {
        self.enter("get_proxy_targets", proxy_name)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .proxy_targets
            .get(proxy_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_orderable_instance_types(
        &self,
        _engine: &str,
        _engine_version: &str,
    ) -> ProviderResult<Vec<String>> {
        self.enter("get_orderable_instance_types", "")?;
        Ok(self.state.lock().unwrap().orderable_types.clone())
    }

    async fn get_valid_upgrade_targets(
        &self,
        _engine: &str,
        _engine_version: &str,
    ) -> ProviderResult<Vec<String>> {
        self.enter("get_valid_upgrade_targets", "")?;
        Ok(self.state.lock().unwrap().upgrade_targets.clone())
    }

    async fn get_snapshot_status(&self, snapshot_id: &str) -> ProviderResult<Option<String>> {
        self.enter("get_snapshot_status", snapshot_id)?;
        Ok(self.state.lock().unwrap().snapshots.get(snapshot_id).cloned())
    }

    async fn create_cluster_instance(&self, req: &CreateInstanceRequest) -> ProviderResult<()> {
        self.enter("create_cluster_instance", &req.instance_id)?;
        let mut state = self.state.lock().unwrap();
        if Self::instance_lookup(&state, &req.instance_id).is_some() {
            return Err(ProviderError::AlreadyExists(req.instance_id.clone()));
        }
        let cluster = state
            .clusters
            .get_mut(&req.cluster_id)
            .ok_or_else(|| ProviderError::ClusterNotFound(req.cluster_id.clone()))?;
        cluster.members.push(ClusterMember {
            instance_id: req.instance_id.clone(),
            role: MemberRole::Reader,
            status: "available".to_string(),
            instance_type: req.instance_type.clone(),
            storage_type: "aurora".to_string(),
            iops: None,
            storage_throughput: None,
            autoscaled: false,
            promotion_tier: req.promotion_tier,
        });
        Ok(())
    }

    async fn modify_instance(&self, req: &ModifyInstanceRequest) -> ProviderResult<()> {
        self.enter("modify_instance", &req.instance_id)?;
        let mut state = self.state.lock().unwrap();
        for cluster in state.clusters.values_mut() {
            if let Some(m) = cluster
                .members
                .iter_mut()
                .find(|m| m.instance_id == req.instance_id)
            {
                if let Some(t) = &req.instance_type {
                    m.instance_type = t.clone();
                }
                if let Some(s) = &req.storage_type {
                    m.storage_type = s.clone();
                }
                if req.iops.is_some() {
                    m.iops = req.iops;
                }
                if req.storage_throughput.is_some() {
                    m.storage_throughput = req.storage_throughput;
                }
                return Ok(());
            }
        }
        Err(ProviderError::InstanceNotFound(req.instance_id.clone()))
    }

    async fn delete_instance(&self, instance_id: &str) -> ProviderResult<()> {
        self.enter("delete_instance", instance_id)?;
        let mut state = self.state.lock().unwrap();
        for cluster in state.clusters.values_mut() {
            if let Some(pos) = cluster
                .members
                .iter()
                .position(|m| m.instance_id == instance_id)
            {
                cluster.members.remove(pos);
                return Ok(());
            }
        }
        Err(ProviderError::InstanceNotFound(instance_id.to_string()))
    }

    async fn reboot_instance(&self, instance_id: &str) -> ProviderResult<()> {
        self.enter("reboot_instance", instance_id)?;
        let state = self.state.lock().unwrap();
        if Self::instance_lookup(&state, instance_id).is_none() {
            return Err(ProviderError::InstanceNotFound(instance_id.to_string()));
        }
        Ok(())
    }

    async fn failover_cluster(
        &self,
        cluster_id: &str,
        target_instance: &str,
    ) -> ProviderResult<()> {
        self.enter("failover_cluster", target_instance)?;
        let mut state = self.state.lock().unwrap();
        let cluster = state
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| ProviderError::ClusterNotFound(cluster_id.to_string()))?;
        if !cluster
            .members
            .iter()
            .any(|m| m.instance_id == target_instance)
        {
            return Err(ProviderError::InstanceNotFound(target_instance.to_string()));
        }
        for m in &mut cluster.members {
            m.role = if m.instance_id == target_instance {
                MemberRole::Writer
            } else {
                MemberRole::Reader
            };
        }
        Ok(())
    }

    async fn modify_cluster(&self, req: &ModifyClusterRequest) -> ProviderResult<()> {
        self.enter("modify_cluster", &req.cluster_id)?;
        let mut state = self.state.lock().unwrap();
        let cluster = state
            .clusters
            .get_mut(&req.cluster_id)
            .ok_or_else(|| ProviderError::ClusterNotFound(req.cluster_id.clone()))?;
        if let Some(v) = &req.engine_version {
            cluster.engine_version = v.clone();
        }
        if let Some(g) = &req.parameter_group {
            cluster.parameter_group = g.clone();
        }
        Ok(())
    }

    async fn create_cluster_snapshot(
        &self,
        cluster_id: &str,
        snapshot_id: &str,
    ) -> ProviderResult<()> {
        self.enter("create_cluster_snapshot", snapshot_id)?;
        let mut state = self.state.lock().unwrap();
        if !state.clusters.contains_key(cluster_id) {
            return Err(ProviderError::ClusterNotFound(cluster_id.to_string()));
        }
        if state.snapshots.contains_key(snapshot_id) {
            return Err(ProviderError::AlreadyExists(snapshot_id.to_string()));
        }
        state
            .snapshots
            .insert(snapshot_id.to_string(), "available".to_string());
        Ok(())
    }

    async fn create_cluster_parameter_group(
        &self,
        name: &str,
        _family: &str,
        _description: &str,
    ) -> ProviderResult<()> {
        self.enter("create_cluster_parameter_group", name)?;
        let mut state = self.state.lock().unwrap();
        if state.parameter_groups.contains_key(name) {
            return Err(ProviderError::AlreadyExists(name.to_string()));
        }
        state.parameter_groups.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn modify_cluster_parameter_group(
        &self,
        name: &str,
        parameters: &[Parameter],
    ) -> ProviderResult<()> {
        self.enter("modify_cluster_parameter_group", name)?;
        let mut state = self.state.lock().unwrap();
        state
            .parameter_groups
            .entry(name.to_string())
            .or_default()
            .extend(parameters.iter().cloned());
        Ok(())
    }

    async fn create_instance_parameter_group(
        &self,
        name: &str,
        _family: &str,
        _description: &str,
    ) -> ProviderResult<()> {
        self.enter("create_instance_parameter_group", name)?;
        let mut state = self.state.lock().unwrap();
        if state.parameter_groups.contains_key(name) {
            return Err(ProviderError::AlreadyExists(name.to_string()));
        }
        state.parameter_groups.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn modify_instance_parameter_group(
        &self,
        name: &str,
        parameters: &[Parameter],
    ) -> ProviderResult<()> {
        self.enter("modify_instance_parameter_group", name)?;
        let mut state = self.state.lock().unwrap();
        state
            .parameter_groups
            .entry(name.to_string())
            .or_default()
            .extend(parameters.iter().cloned());
        Ok(())
    }

    async fn create_blue_green_deployment(
        &self,
        req: &CreateBlueGreenRequest,
    ) -> ProviderResult<String> {
        self.enter("create_blue_green_deployment", &req.name)?;
        let mut state = self.state.lock().unwrap();
        state.bg_counter += 1;
        let identifier = format!("bgd-{}", state.bg_counter);
        state.deployments.insert(
            identifier.clone(),
            BlueGreenDeployment {
                identifier: identifier.clone(),
                name: req.name.clone(),
                status: "AVAILABLE".to_string(),
                source: req.source_arn.clone(),
                target: Some(format!("{}-green", req.source_arn)),
                tasks: vec![BlueGreenTask {
                    name: "CREATING_GREEN_ENVIRONMENT".to_string(),
                    status: "COMPLETED".to_string(),
                }],
                switchover_details: Vec::new(),
            },
        );
        Ok(identifier)
    }

    async fn switchover_blue_green_deployment(
        &self,
        identifier: &str,
        _timeout_secs: Option<i64>,
    ) -> ProviderResult<()> {
        self.enter("switchover_blue_green_deployment", identifier)?;
        let mut state = self.state.lock().unwrap();
        let delay = state.switchover_delay;
        let deployment = state
            .deployments
            .get_mut(identifier)
            .ok_or_else(|| ProviderError::DeploymentNotFound(identifier.to_string()))?;
        deployment.status = if delay > 0 {
            "SWITCHOVER_IN_PROGRESS".to_string()
        } else {
            "SWITCHOVER_COMPLETED".to_string()
        };
        let source_arn = deployment.source.clone();
        let cluster_id = source_arn.rsplit(':').next().unwrap_or("").to_string();
        let mut details = vec![SwitchoverDetail {
            source: format!("{source_arn}-old1"),
            target: source_arn.clone(),
            status: Some("SWITCHOVER_COMPLETED".to_string()),
        }];
        let mut old_members = Vec::new();
        if let Some(cluster) = state.clusters.get(&cluster_id) {
            for m in &cluster.members {
                details.push(SwitchoverDetail {
                    source: format!(
                        "arn:aws:rds:eu-central-1:123456789012:db:{}-old1",
                        m.instance_id
                    ),
                    target: format!(
                        "arn:aws:rds:eu-central-1:123456789012:db:{}",
                        m.instance_id
                    ),
                    status: Some("SWITCHOVER_COMPLETED".to_string()),
                });
                old_members.push(member(&format!("{}-old1", m.instance_id), MemberRole::Reader));
            }
        }
        // The old environment survives under the -old1 names until cleanup.
        let old_cluster_id = format!("{cluster_id}-old1");
        let old_cluster = cluster(&old_cluster_id, old_members);
        state.clusters.insert(old_cluster_id, old_cluster);
        if let Some(deployment) = state.deployments.get_mut(identifier) {
            deployment.switchover_details = details;
        }
        Ok(())
    }

    async fn delete_blue_green_deployment(&self, identifier: &str) -> ProviderResult<()> {
        self.enter("delete_blue_green_deployment", identifier)?;
        let mut state = self.state.lock().unwrap();
        state
            .deployments
            .remove(identifier)
            .map(|_| ())
            .ok_or_else(|| ProviderError::DeploymentNotFound(identifier.to_string()))
    }

    async fn delete_cluster(&self, cluster_id: &str) -> ProviderResult<()> {
        self.enter("delete_cluster", cluster_id)?;
        let mut state = self.state.lock().unwrap();
        state
            .clusters
            .remove(cluster_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::ClusterNotFound(cluster_id.to_string()))
    }

    async fn register_proxy_targets(
        &self,
        proxy_name: &str,
        cluster_id: &str,
    ) -> ProviderResult<()> {
        self.enter("register_proxy_targets", proxy_name)?;
        let mut state = self.state.lock().unwrap();
        let instance_targets: Vec<ProxyTarget> = state
            .clusters
            .get(cluster_id)
            .map(|c| {
                c.members
                    .iter()
                    .map(|m| ProxyTarget {
                        id: m.instance_id.clone(),
                        target_type: "RDS_INSTANCE".to_string(),
                        health: "AVAILABLE".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut targets = vec![ProxyTarget {
            id: cluster_id.to_string(),
            target_type: "TRACKED_CLUSTER".to_string(),
            health: "AVAILABLE".to_string(),
        }];
        targets.extend(instance_targets);
        state.proxy_targets.insert(proxy_name.to_string(), targets);
        Ok(())
    }

    async fn deregister_proxy_targets(&self, proxy_name: &str) -> ProviderResult<()> {
        self.enter("deregister_proxy_targets", proxy_name)?;
        self.state
            .lock()
            .unwrap()
            .proxy_targets
            .insert(proxy_name.to_string(), Vec::new());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine builders
// ═══════════════════════════════════════════════════════════════════════════

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        default_region: "eu-central-1".to_string(),
        ..EngineConfig::fast()
    }
}

pub fn engine_with(provider: Arc<FakeProvider>) -> Engine {
    Engine::new(
        fast_config(),
        ProviderManager::single(provider),
        Arc::new(NullStore),
        Arc::new(NullNotifier),
    )
}

pub fn engine_with_store(provider: Arc<FakeProvider>, store: Arc<dyn OperationStore>) -> Engine {
    Engine::new(
        fast_config(),
        ProviderManager::single(provider),
        store,
        Arc::new(NullNotifier),
    )
}

/// Poll the engine until the operation settles in `target` or the deadline
/// passes.
pub async fn wait_for_state(
    engine: &Engine,
    id: &str,
    target: rds_maintenance::OperationState,
) -> rds_maintenance::Operation {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let op = engine.get_operation(id).await.expect("operation exists");
        if op.state == target {
            return op;
        }
        if std::time::Instant::now() > deadline {
            panic!(
                "operation {id} never reached {target:?}; state {:?}, step {} ({:?}), error {:?}, pause {:?}",
                op.state,
                op.current_step_index,
                op.current_step().map(|s| &s.name),
                op.error,
                op.pause_reason
            );
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
