//! Engine configuration.
//!
//! Programmatic defaults with an environment-variable loader for deployments
//! that configure through the process environment.

use std::env;
use std::time::Duration;

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Region used when a create request does not name one
    pub default_region: String,

    /// Budget for any single wait loop unless the operation overrides it
    pub default_wait_timeout: Duration,

    /// Ticker interval for wait loops; also the sleep between step retries
    pub default_poll_interval: Duration,

    /// Re-spawn step tasks for operations recovered in `running` state;
    /// when false they are demoted to paused for manual resume
    pub auto_resume_on_restart: bool,

    /// Per-step retry budget applied by plan builders
    pub default_max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_region: "us-east-1".to_string(),
            default_wait_timeout: Duration::from_secs(45 * 60),
            default_poll_interval: Duration::from_secs(30),
            auto_resume_on_restart: false,
            default_max_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_region: env::var("RDS_MAINT_REGION")
                .unwrap_or(defaults.default_region),
            default_wait_timeout: env::var("RDS_MAINT_WAIT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_wait_timeout),
            default_poll_interval: env::var("RDS_MAINT_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_poll_interval),
            auto_resume_on_restart: env::var("RDS_MAINT_AUTO_RESUME")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.auto_resume_on_restart),
            default_max_retries: env::var("RDS_MAINT_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_max_retries),
        }
    }

    /// Short intervals suitable for demos and tests.
    pub fn fast() -> Self {
        Self {
            default_wait_timeout: Duration::from_secs(5),
            default_poll_interval: Duration::from_millis(20),
            ..Self::default()
        }
    }
}
