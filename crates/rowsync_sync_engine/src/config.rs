//! Configuration for orchestrators and the web client.

use rand::Rng;
use rowsync_core::{ConflictPolicy, SyncParameters};
use std::path::PathBuf;
use std::time::Duration;

/// Scope name used when none is configured.
pub const DEFAULT_SCOPE_NAME: &str = "DefaultScope";

/// Rows per batch part used when none is configured.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Reaction of a client told by the server that its scope is outdated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutdatedAction {
    /// Drop local data and download everything again.
    #[default]
    Reinitialize,
    /// Upload pending local edits, then reinitialize.
    ReinitializeWithUpload,
    /// Fail the run with [`SyncError::OutdatedScope`](crate::SyncError::OutdatedScope).
    Fail,
}

/// Options of one orchestrator.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Scope synchronized.
    pub scope_name: String,
    /// Directory for run batches.
    pub batch_directory: PathBuf,
    /// Directory for snapshots. Snapshots are disabled without one.
    pub snapshot_directory: Option<PathBuf>,
    /// Maximum rows per batch part. Zero puts a whole changeset in one part.
    pub batch_size: usize,
    /// Automatic conflict policy.
    pub conflict_policy: ConflictPolicy,
    /// What a client does when the server reports it outdated.
    pub outdated_action: OutdatedAction,
    /// Apply rows without enforcing foreign keys.
    pub disable_constraints_on_apply: bool,
    /// Delete run batches once applied.
    pub cleanup_batches: bool,
    /// Fail the run when a conflict hook aborts a row.
    pub escalate_conflict_abort: bool,
    /// Filter parameter values sent by a client.
    pub parameters: SyncParameters,
}

impl SyncOptions {
    /// Creates options for `scope_name` with batches under `batch_directory`.
    pub fn new(scope_name: impl Into<String>, batch_directory: impl Into<PathBuf>) -> Self {
        Self {
            scope_name: scope_name.into(),
            batch_directory: batch_directory.into(),
            snapshot_directory: None,
            batch_size: DEFAULT_BATCH_SIZE,
            conflict_policy: ConflictPolicy::default(),
            outdated_action: OutdatedAction::default(),
            disable_constraints_on_apply: false,
            cleanup_batches: true,
            escalate_conflict_abort: false,
            parameters: SyncParameters::new(),
        }
    }

    /// Sets the snapshot directory.
    pub fn with_snapshot_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.snapshot_directory = Some(directory.into());
        self
    }

    /// Sets the rows per batch part.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the outdated-scope reaction.
    pub fn with_outdated_action(mut self, action: OutdatedAction) -> Self {
        self.outdated_action = action;
        self
    }

    /// Disables foreign key checks while applying.
    pub fn with_constraints_disabled(mut self, disabled: bool) -> Self {
        self.disable_constraints_on_apply = disabled;
        self
    }

    /// Keeps or deletes run batches after use.
    pub fn with_cleanup_batches(mut self, cleanup: bool) -> Self {
        self.cleanup_batches = cleanup;
        self
    }

    /// Escalates hook aborts to run failures.
    pub fn with_escalated_conflict_abort(mut self, escalate: bool) -> Self {
        self.escalate_conflict_abort = escalate;
        self
    }

    /// Sets the filter parameters.
    pub fn with_parameters(mut self, parameters: SyncParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new(DEFAULT_SCOPE_NAME, std::env::temp_dir().join("rowsync"))
    }
}

/// How the web client resends a request after a retryable failure.
///
/// Attempt `n` (counting from zero) waits `first_delay * growth^(n-1)`,
/// capped at `delay_cap`, plus up to a quarter more when `jitter` is set.
/// The first attempt never waits.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per request, the first one included.
    pub attempts: u32,
    /// Wait before the second attempt.
    pub first_delay: Duration,
    /// Longest wait, before jitter.
    pub delay_cap: Duration,
    /// Factor between consecutive waits.
    pub growth: f64,
    /// Spreads clients that failed together.
    pub jitter: bool,
}

impl RetryPolicy {
    /// `attempts` tries, waiting 100ms then doubling up to 30s.
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts,
            first_delay: Duration::from_millis(100),
            delay_cap: Duration::from_secs(30),
            growth: 2.0,
            jitter: true,
        }
    }

    /// A single attempt.
    pub fn once() -> Self {
        Self {
            jitter: false,
            ..Self::attempts(1)
        }
    }

    /// Sets the wait before the second attempt.
    pub fn with_first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = delay;
        self
    }

    /// Sets the longest wait.
    pub fn with_delay_cap(mut self, cap: Duration) -> Self {
        self.delay_cap = cap;
        self
    }

    /// Sets the factor between waits.
    pub fn with_growth(mut self, growth: f64) -> Self {
        self.growth = growth;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let Some(retry) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let grown = self.first_delay.as_secs_f64() * self.growth.powi(retry.min(i32::MAX as u32) as i32);
        let capped = grown.min(self.delay_cap.as_secs_f64());
        let spread = if self.jitter {
            rand::thread_rng().gen_range(0.0..0.25)
        } else {
            0.0
        };
        Duration::from_secs_f64(capped * (1.0 + spread))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::attempts(3)
    }
}

/// Configuration of the HTTP web client.
#[derive(Debug, Clone)]
pub struct WebClientConfig {
    /// Server base URL, e.g. `https://sync.example.com`.
    pub base_url: String,
    /// Timeout of one HTTP request.
    pub timeout: Duration,
    /// Resending of requests that failed transiently.
    pub retry: RetryPolicy,
}

impl WebClientConfig {
    /// Creates a configuration for `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
