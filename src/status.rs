//! Status classifier for provider instance and cluster status strings.
//!
//! The provider reports lifecycle status as free-form strings. Handlers only
//! ever ask a handful of questions about them (is it usable, is it in
//! flight, is it broken, is it going away), so the vocabulary is pinned down
//! here in one place instead of being string-matched ad hoc at call sites.
//! The same classifier applies to instance and cluster status.

/// Statuses that indicate an in-flight change; the resource will settle on
/// its own and wait loops should keep polling.
pub const TRANSITIONAL_STATUSES: &[&str] = &[
    "creating",
    "modifying",
    "rebooting",
    "upgrading",
    "backing-up",
    "maintenance",
    "renaming",
    "starting",
    "storage-optimization",
    "storage-config-upgrade",
    "moving-to-vpc",
    "converting-to-vpc",
    "resetting-master-credentials",
    "configuring-enhanced-monitoring",
    "configuring-iam-database-auth",
    "configuring-log-exports",
    "configuring-activity-stream",
    "configuring-associated-roles",
    "configuring-performance-insights",
];

/// Statuses the resource cannot recover from without intervention.
pub const ERROR_STATUSES: &[&str] = &[
    "failed",
    "insufficient-capacity",
    "restore-error",
    "storage-full",
];

pub fn is_available(status: &str) -> bool {
    status == "available"
}

pub fn is_transitional(status: &str) -> bool {
    TRANSITIONAL_STATUSES.contains(&status)
}

pub fn is_error(status: &str) -> bool {
    ERROR_STATUSES.contains(&status)
        || status.starts_with("incompatible-")
        || status.starts_with("inaccessible-encryption-credentials")
}

pub fn is_deleting(status: &str) -> bool {
    matches!(status, "deleting" | "delete-precheck")
}

pub fn is_stopped(status: &str) -> bool {
    matches!(status, "stopped" | "stopping")
}

pub fn can_failover(status: &str) -> bool {
    is_available(status)
}

/// storage-full is an error status, but the provider still accepts
/// modifications against it (that is usually how you get out of it).
pub fn can_perform_operations(status: &str) -> bool {
    is_available(status) || status == "storage-full"
}
