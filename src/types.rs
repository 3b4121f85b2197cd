//! Domain model for maintenance operations.
//!
//! An [`Operation`] is an ordered plan of [`Step`]s against one cluster.
//! Every state change is recorded as an [`Event`]. All records serialize to
//! snake_case JSON; that shape is also the persistent format used by the
//! store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Step parameters and results are open JSON objects; handlers pull the keys
/// they need and later steps read earlier results through
/// [`Operation::find_completed_result`].
pub type StepParams = Map<String, Value>;

/// Default per-step retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ═══════════════════════════════════════════════════════════════════════════
// Action vocabulary
// ═══════════════════════════════════════════════════════════════════════════

/// The fixed vocabulary of step action tags.
///
/// Plan builders emit these and the handler dispatch matches on them; an
/// operation loaded with an action outside this set fails at dispatch, not at
/// decode (the step record itself is schema-valid).
pub mod actions {
    pub const GET_CLUSTER_INFO: &str = "get_cluster_info";
    pub const CREATE_TEMP_INSTANCE: &str = "create_temp_instance";
    pub const WAIT_INSTANCE_AVAILABLE: &str = "wait_instance_available";
    pub const MODIFY_INSTANCE: &str = "modify_instance";
    pub const DELETE_INSTANCE: &str = "delete_instance";
    pub const WAIT_INSTANCE_DELETED: &str = "wait_instance_deleted";
    pub const FAILOVER_CLUSTER: &str = "failover_cluster";
    pub const CREATE_SNAPSHOT: &str = "create_snapshot";
    pub const WAIT_SNAPSHOT_AVAILABLE: &str = "wait_snapshot_available";
    pub const MODIFY_CLUSTER: &str = "modify_cluster";
    pub const WAIT_CLUSTER_AVAILABLE: &str = "wait_cluster_available";
    pub const PREPARE_PARAMETER_GROUP: &str = "prepare_parameter_group";
    pub const CREATE_BLUE_GREEN_DEPLOYMENT: &str = "create_blue_green_deployment";
    pub const WAIT_BLUE_GREEN_AVAILABLE: &str = "wait_blue_green_available";
    pub const SWITCHOVER_BLUE_GREEN: &str = "switchover_blue_green";
    pub const CLEANUP_BLUE_GREEN: &str = "cleanup_blue_green";
    pub const REBOOT_INSTANCE: &str = "reboot_instance";
    pub const VALIDATE_PROXY_HEALTH: &str = "validate_proxy_health";
    pub const DEREGISTER_PROXY_TARGETS: &str = "deregister_proxy_targets";
    pub const REGISTER_PROXY_TARGETS: &str = "register_proxy_targets";
    /// Deprecated alias for [`REGISTER_PROXY_TARGETS`]; still dispatched.
    pub const RETARGET_PROXIES: &str = "retarget_proxies";
}

/// Step name sentinel for the temp instance's availability wait; this is the
/// one wait that may omit `instance_id` (the id is resolved from the
/// `create_temp_instance` result at run time).
pub const WAIT_FOR_TEMP_INSTANCE: &str = "Wait for temp instance";

// ═══════════════════════════════════════════════════════════════════════════
// Operation kind / state
// ═══════════════════════════════════════════════════════════════════════════

/// The four supported maintenance operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    InstanceTypeChange,
    StorageTypeChange,
    EngineUpgrade,
    InstanceCycle,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::InstanceTypeChange => write!(f, "instance_type_change"),
            OperationKind::StorageTypeChange => write!(f, "storage_type_change"),
            OperationKind::EngineUpgrade => write!(f, "engine_upgrade"),
            OperationKind::InstanceCycle => write!(f, "instance_cycle"),
        }
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
}

impl OperationState {
    /// Active operations hold the per-(cluster, region) exclusivity slot.
    pub fn is_active(&self) -> bool {
        matches!(self, OperationState::Running | OperationState::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::RolledBack
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationState::Created => write!(f, "created"),
            OperationState::Running => write!(f, "running"),
            OperationState::Paused => write!(f, "paused"),
            OperationState::Completed => write!(f, "completed"),
            OperationState::Failed => write!(f, "failed"),
            OperationState::RollingBack => write!(f, "rolling_back"),
            OperationState::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Lifecycle state of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    InProgress,
    Waiting,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepState::Pending => write!(f, "pending"),
            StepState::InProgress => write!(f, "in_progress"),
            StepState::Waiting => write!(f, "waiting"),
            StepState::Completed => write!(f, "completed"),
            StepState::Failed => write!(f, "failed"),
            StepState::Skipped => write!(f, "skipped"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Step
// ═══════════════════════════════════════════════════════════════════════════

/// One atomic action in an operation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique step identifier (UUID)
    pub id: String,

    /// Human-readable step name
    pub name: String,

    /// What the step does, for operators
    pub description: String,

    /// Action tag; see [`actions`]
    pub action: String,

    /// Action-specific parameters
    #[serde(default)]
    pub params: StepParams,

    /// Step status
    pub state: StepState,

    /// Structured result, readable by later steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error message from the most recent failed attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Human description of the condition a waiting step is polling for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_condition: Option<String>,

    /// Attempts consumed so far
    #[serde(default)]
    pub retry_count: u32,

    /// Per-step retry budget
    pub max_retries: u32,

    /// Set on the first attempt and preserved across retries, so elapsed
    /// time covers every attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            action: action.into(),
            params: StepParams::new(),
            state: StepState::Pending,
            result: None,
            error: None,
            wait_condition: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            started_at: None,
            completed_at: None,
        }
    }

    /// Attach parameters from a JSON object literal; non-object values are
    /// ignored.
    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params = map;
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// String-typed parameter accessor.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(|v| v.as_i64())
    }

    /// The explicit target instance of an instance-scoped step, if present.
    pub fn instance_id(&self) -> Option<&str> {
        self.param_str("instance_id")
    }

    /// Clear execution state back to pending; used by operation reset.
    pub fn reset(&mut self) {
        self.state = StepState::Pending;
        self.result = None;
        self.error = None;
        self.wait_condition = None;
        self.retry_count = 0;
        self.started_at = None;
        self.completed_at = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Operation
// ═══════════════════════════════════════════════════════════════════════════

/// One maintenance plan against a single (cluster, region).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation identifier (UUID)
    pub id: String,

    pub kind: OperationKind,

    pub cluster_id: String,

    pub region: String,

    /// Kind-specific parameter record, schema per kind (see the
    /// `*Params` types below)
    #[serde(default)]
    pub parameters: Value,

    /// Ordered plan
    pub steps: Vec<Step>,

    /// Index of the next step to execute; equals `steps.len()` once the
    /// operation has finished its plan
    #[serde(default)]
    pub current_step_index: usize,

    pub state: OperationState,

    /// Step indices the engine pauses before, for operator checkpoints
    #[serde(default)]
    pub pause_before_steps: BTreeSet<usize>,

    /// Per-operation budget for any single wait loop; 0 means the engine
    /// default applies
    #[serde(default)]
    pub wait_timeout_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn new(
        kind: OperationKind,
        cluster_id: impl Into<String>,
        region: impl Into<String>,
        parameters: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            cluster_id: cluster_id.into(),
            region: region.into(),
            parameters,
            steps: Vec::new(),
            current_step_index: 0,
            state: OperationState::Created,
            pause_before_steps: BTreeSet::new(),
            wait_timeout_secs: 0,
            error: None,
            pause_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.get_mut(self.current_step_index)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Most recent completed step with the given action tag, if any.
    ///
    /// Later steps discover resource ids created by earlier steps this way
    /// rather than holding references to each other.
    pub fn find_completed_step(&self, action: &str) -> Option<&Step> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.action == action && s.state == StepState::Completed)
    }

    /// Structured result of the most recent completed step with the given
    /// action tag.
    pub fn find_completed_result(&self, action: &str) -> Option<&Value> {
        self.find_completed_step(action).and_then(|s| s.result.as_ref())
    }

    /// Total validation: cursor bounds, pause indices, and the kind-specific
    /// parameter schema. Runs on create and on every load from the store.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidParameter("id: must not be empty".into()));
        }
        if self.cluster_id.is_empty() {
            return Err(Error::InvalidParameter(
                "cluster_id: must not be empty".into(),
            ));
        }
        if self.current_step_index > self.steps.len() {
            return Err(Error::InvalidParameter(format!(
                "current_step_index: {} out of bounds for {} steps",
                self.current_step_index,
                self.steps.len()
            )));
        }
        if let Some(&idx) = self.pause_before_steps.iter().next_back() {
            if idx >= self.steps.len() {
                return Err(Error::InvalidParameter(format!(
                    "pause_before_steps: index {} out of bounds for {} steps",
                    idx,
                    self.steps.len()
                )));
            }
        }
        self.parsed_parameters().map(|_| ())
    }

    /// Parse the kind-specific parameter record.
    pub fn parsed_parameters(&self) -> Result<OperationParameters> {
        OperationParameters::parse(self.kind, &self.parameters)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Kind-specific parameter records
// ═══════════════════════════════════════════════════════════════════════════

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTypeChangeParams {
    pub target_instance_type: String,
    #[serde(default)]
    pub exclude_instances: Vec<String>,
    #[serde(default)]
    pub skip_temp_instance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageTypeChangeParams {
    pub target_storage_type: String,
    #[serde(default)]
    pub iops: Option<i64>,
    #[serde(default)]
    pub storage_throughput: Option<i64>,
    #[serde(default)]
    pub exclude_instances: Vec<String>,
    #[serde(default)]
    pub skip_temp_instance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineUpgradeParams {
    pub target_engine_version: String,
    #[serde(default)]
    pub switchover_timeout: Option<i64>,
    #[serde(default)]
    pub db_cluster_parameter_group_name: Option<String>,
    #[serde(default)]
    pub db_instance_parameter_group_name: Option<String>,
    #[serde(default = "default_true")]
    pub pause_before_switchover: bool,
    #[serde(default = "default_true")]
    pub pause_before_proxy_deregister: bool,
    #[serde(default = "default_true")]
    pub pause_before_cleanup: bool,
    #[serde(default)]
    pub skip_proxy_retarget: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceCycleParams {
    #[serde(default)]
    pub exclude_instances: Vec<String>,
    #[serde(default)]
    pub skip_temp_instance: bool,
}

/// Parsed view over [`Operation::parameters`].
#[derive(Debug, Clone)]
pub enum OperationParameters {
    InstanceTypeChange(InstanceTypeChangeParams),
    StorageTypeChange(StorageTypeChangeParams),
    EngineUpgrade(EngineUpgradeParams),
    InstanceCycle(InstanceCycleParams),
}

impl OperationParameters {
    pub fn parse(kind: OperationKind, value: &Value) -> Result<Self> {
        let invalid =
            |e: serde_json::Error| Error::InvalidParameter(format!("parameters: {e}"));
        // An omitted parameter record means "all defaults".
        let empty = Value::Object(Map::new());
        let value = if value.is_null() { &empty } else { value };
        match kind {
            OperationKind::InstanceTypeChange => serde_json::from_value(value.clone())
                .map(OperationParameters::InstanceTypeChange)
                .map_err(invalid),
            OperationKind::StorageTypeChange => serde_json::from_value(value.clone())
                .map(OperationParameters::StorageTypeChange)
                .map_err(invalid),
            OperationKind::EngineUpgrade => serde_json::from_value(value.clone())
                .map(OperationParameters::EngineUpgrade)
                .map_err(invalid),
            OperationKind::InstanceCycle => serde_json::from_value(value.clone())
                .map(OperationParameters::InstanceCycle)
                .map_err(invalid),
        }
    }

    pub fn exclude_instances(&self) -> &[String] {
        match self {
            OperationParameters::InstanceTypeChange(p) => &p.exclude_instances,
            OperationParameters::StorageTypeChange(p) => &p.exclude_instances,
            OperationParameters::InstanceCycle(p) => &p.exclude_instances,
            OperationParameters::EngineUpgrade(_) => &[],
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Create request / intervention response
// ═══════════════════════════════════════════════════════════════════════════

/// Request consumed by `Engine::create_operation`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOperationRequest {
    pub kind: OperationKind,
    pub cluster_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    /// Seconds; overrides the engine's default wait budget
    #[serde(default)]
    pub wait_timeout: Option<u64>,
}

/// Operator response to a paused operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionAction {
    Continue,
    Rollback,
    Abort,
    MarkComplete,
}

impl std::fmt::Display for InterventionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterventionAction::Continue => write!(f, "continue"),
            InterventionAction::Rollback => write!(f, "rollback"),
            InterventionAction::Abort => write!(f, "abort"),
            InterventionAction::MarkComplete => write!(f, "mark_complete"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════

/// Event type tags; one per observable state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OperationCreated,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetry,
    OperationPaused,
    OperationResumed,
    InterventionRequired,
    RollbackStarted,
    RollbackCompleted,
    OperationCompleted,
    OperationAborted,
    OperationMarkedComplete,
    PauseStepsUpdated,
    OperationReset,
    TimeoutUpdated,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::OperationCreated => "operation_created",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::StepRetry => "step_retry",
            EventType::OperationPaused => "operation_paused",
            EventType::OperationResumed => "operation_resumed",
            EventType::InterventionRequired => "intervention_required",
            EventType::RollbackStarted => "rollback_started",
            EventType::RollbackCompleted => "rollback_completed",
            EventType::OperationCompleted => "operation_completed",
            EventType::OperationAborted => "operation_aborted",
            EventType::OperationMarkedComplete => "operation_marked_complete",
            EventType::PauseStepsUpdated => "pause_steps_updated",
            EventType::OperationReset => "operation_reset",
            EventType::TimeoutUpdated => "timeout_updated",
        };
        write!(f, "{s}")
    }
}

/// Immutable log entry scoped to one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier (UUID)
    pub id: String,

    pub operation_id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Per-operation append sequence; strictly monotonic, 1-based, never
    /// reused across process restarts
    #[serde(default)]
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        operation_id: impl Into<String>,
        event_type: EventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation_id: operation_id.into(),
            event_type,
            message: message.into(),
            data: None,
            sequence: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
