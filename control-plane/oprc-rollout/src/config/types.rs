use std::time::Duration;

use envconfig::Envconfig;

use crate::crd::DEFAULT_REVISION_HISTORY_LIMIT;

#[derive(Envconfig, Clone, Debug)]
pub struct RolloutConfig {
    /// Field manager recorded on every write.
    /// Env: OPRC_ROLLOUT_FIELD_MANAGER
    #[envconfig(from = "OPRC_ROLLOUT_FIELD_MANAGER", default = "oprc-rollout")]
    pub field_manager: String,

    /// Phase class reconciled by the in-process ObjectSetPhase controller.
    /// Phases with any other class are left to external controllers.
    /// Env: OPRC_ROLLOUT_PHASE_CLASS
    #[envconfig(from = "OPRC_ROLLOUT_PHASE_CLASS", default = "default")]
    pub phase_class: String,

    /// Salt bumps allowed before a deployment gives up on naming collisions.
    /// Env: OPRC_ROLLOUT_MAX_COLLISION_RETRIES
    #[envconfig(from = "OPRC_ROLLOUT_MAX_COLLISION_RETRIES", default = "16")]
    pub max_collision_retries: i32,

    /// Used when a deployment leaves `revisionHistoryLimit` unset.
    /// Env: OPRC_ROLLOUT_REVISION_HISTORY_LIMIT
    #[envconfig(from = "OPRC_ROLLOUT_REVISION_HISTORY_LIMIT", default = "5")]
    pub revision_history_limit: i32,

    #[envconfig(nested)]
    pub timing: TimingConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct TimingConfig {
    /// Env: OPRC_ROLLOUT_REQUEUE_SECS
    #[envconfig(from = "OPRC_ROLLOUT_REQUEUE_SECS", default = "5")]
    pub requeue_secs: u64,
    /// Backoff while a declared dependency kind is not served.
    /// Env: OPRC_ROLLOUT_DEPENDENCY_BACKOFF_SECS
    #[envconfig(from = "OPRC_ROLLOUT_DEPENDENCY_BACKOFF_SECS", default = "30")]
    pub dependency_backoff_secs: u64,
    /// Env: OPRC_ROLLOUT_ERROR_REQUEUE_SECS
    #[envconfig(from = "OPRC_ROLLOUT_ERROR_REQUEUE_SECS", default = "15")]
    pub error_requeue_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            requeue_secs: 5,
            dependency_backoff_secs: 30,
            error_requeue_secs: 15,
        }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            field_manager: "oprc-rollout".into(),
            phase_class: "default".into(),
            max_collision_retries: 16,
            revision_history_limit: DEFAULT_REVISION_HISTORY_LIMIT,
            timing: TimingConfig::default(),
        }
    }
}

impl RolloutConfig {
    pub fn requeue(&self) -> Duration {
        Duration::from_secs(self.timing.requeue_secs)
    }

    pub fn dependency_backoff(&self) -> Duration {
        Duration::from_secs(self.timing.dependency_backoff_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.timing.error_requeue_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_env_defaults() {
        let cfg = RolloutConfig::init_from_hashmap(&HashMap::new()).unwrap();
        let def = RolloutConfig::default();
        assert_eq!(cfg.field_manager, def.field_manager);
        assert_eq!(cfg.phase_class, def.phase_class);
        assert_eq!(cfg.max_collision_retries, def.max_collision_retries);
        assert_eq!(cfg.revision_history_limit, def.revision_history_limit);
        assert_eq!(cfg.requeue(), def.requeue());
        assert_eq!(cfg.dependency_backoff(), Duration::from_secs(30));
        assert_eq!(cfg.error_requeue(), Duration::from_secs(15));
    }

    #[test]
    fn env_overrides_are_honoured() {
        let env = HashMap::from([
            ("OPRC_ROLLOUT_PHASE_CLASS".to_string(), "hosted".to_string()),
            ("OPRC_ROLLOUT_REQUEUE_SECS".to_string(), "1".to_string()),
            ("OPRC_ROLLOUT_REVISION_HISTORY_LIMIT".to_string(), "2".to_string()),
        ]);
        let cfg = RolloutConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(cfg.phase_class, "hosted");
        assert_eq!(cfg.requeue(), Duration::from_secs(1));
        assert_eq!(cfg.revision_history_limit, 2);
        assert_eq!(cfg.field_manager, "oprc-rollout");
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let env = HashMap::from([(
            "OPRC_ROLLOUT_ERROR_REQUEUE_SECS".to_string(),
            "soon".to_string(),
        )]);
        assert!(RolloutConfig::init_from_hashmap(&env).is_err());
    }
}
