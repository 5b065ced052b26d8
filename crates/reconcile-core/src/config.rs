//! Engine configuration.

use crate::apply::ApplyMode;
use kube::core::GroupVersionKind;
use std::time::Duration;
use thiserror::Error;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 2;
/// Default delay after the first failure.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(5);
/// Default ceiling on retry delays.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting is out of range or missing
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to watch, what to manage, and how hard to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Declaration kind
    pub watched_kind: GroupVersionKind,
    /// Kinds rendered and owned on behalf of each Declaration
    pub owned_kinds: Vec<GroupVersionKind>,
    /// Field manager identity used for apply
    pub field_manager: String,
    /// Number of parallel workers
    pub workers: usize,
    /// Ceiling on retry delays
    pub max_backoff: Duration,
    /// Delay after the first failure
    pub base_backoff: Duration,
    /// Take over contested fields on the first apply. A retry after a
    /// conflict always forces, so a contested key converges either way.
    pub force_apply: bool,
    /// Field-manager merge or whole-object replace
    pub apply_mode: ApplyMode,
    /// Restrict to one namespace; `None` watches all
    pub namespace: Option<String>,
    /// Re-run every Declaration this long after a successful reconcile
    pub resync_period: Option<Duration>,
}

impl ControllerConfig {
    /// Configuration with default tuning.
    pub fn new(
        watched_kind: GroupVersionKind,
        owned_kinds: Vec<GroupVersionKind>,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            watched_kind,
            owned_kinds,
            field_manager: field_manager.into(),
            workers: DEFAULT_WORKERS,
            max_backoff: DEFAULT_MAX_BACKOFF,
            base_backoff: DEFAULT_BASE_BACKOFF,
            force_apply: true,
            apply_mode: ApplyMode::Merge,
            namespace: None,
            resync_period: None,
        }
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Sets whether apply forces ownership.
    #[must_use]
    pub fn with_force_apply(mut self, force: bool) -> Self {
        self.force_apply = force;
        self
    }

    /// Sets how rendered objects are written.
    #[must_use]
    pub fn with_apply_mode(mut self, mode: ApplyMode) -> Self {
        self.apply_mode = mode;
        self
    }

    /// Restricts the engine to one namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Sets the periodic resync interval.
    #[must_use]
    pub fn with_resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period;
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.field_manager.trim().is_empty() {
            return Err(ConfigError::Invalid("field manager must not be empty".to_string()));
        }
        if self.owned_kinds.is_empty() {
            return Err(ConfigError::Invalid("at least one owned kind is required".to_string()));
        }
        if self.owned_kinds.contains(&self.watched_kind) {
            return Err(ConfigError::Invalid(format!(
                "{} cannot own itself",
                self.watched_kind.kind
            )));
        }
        if self.max_backoff.is_zero() {
            return Err(ConfigError::Invalid("max backoff must be positive".to_string()));
        }
        if self.base_backoff > self.max_backoff {
            return Err(ConfigError::Invalid(format!(
                "base backoff {:?} exceeds max backoff {:?}",
                self.base_backoff, self.max_backoff
            )));
        }
        if self.resync_period.is_some_and(|period| period.is_zero()) {
            return Err(ConfigError::Invalid("resync period must be positive".to_string()));
        }
        Ok(())
    }
}
