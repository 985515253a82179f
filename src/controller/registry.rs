//! Pass registry
//!
//! Per-descriptor bookkeeping shared by the connection reconciler and the
//! resource observer. Every status write on a `ClusterSync` comes back as a
//! watch event; the registry lets the reconciler tell those echoes apart from
//! real work (new descriptor, spec change, observer trigger, due requeue) and
//! remembers consecutive failures for the error backoff.

use std::fmt;
use std::time::Duration;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::requeue::Backoff;

/// Identity of a `ClusterSync`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorKey {
    /// Namespace of the descriptor
    pub namespace: String,
    /// Name of the descriptor
    pub name: String,
}

impl DescriptorKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Why a pass is allowed to run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunReason {
    /// First time this process sees the descriptor
    New,
    /// `metadata.generation` moved since the last pass
    GenerationChanged,
    /// A tracked resource changed locally
    Triggered,
    /// The scheduled requeue is due
    Due,
}

/// Decision of the pass gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    /// Run a pass now
    Run(RunReason),
    /// Nothing to do until the remaining time elapses
    Wait(Duration),
}

#[derive(Clone, Debug)]
struct PassState {
    observed_generation: Option<i64>,
    dirty: bool,
    next_run_at: Instant,
    consecutive_failures: u32,
}

/// Registry of descriptors this process has run passes for
#[derive(Debug, Default)]
pub struct PassRegistry {
    entries: DashMap<DescriptorKey, PassState>,
}

impl PassRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a pass should run for the descriptor at `generation`
    ///
    /// Returning `Run` consumes a pending trigger, so a trigger that arrives
    /// while the pass is in flight schedules another one.
    pub fn gate(&self, key: &DescriptorKey, generation: Option<i64>) -> Gate {
        let Some(mut state) = self.entries.get_mut(key) else {
            // Registered up front so observer triggers during the first pass are kept
            let mut state = self.entry(key);
            state.observed_generation = generation;
            return Gate::Run(RunReason::New);
        };

        let reason = if state.observed_generation != generation {
            Some(RunReason::GenerationChanged)
        } else if state.dirty {
            Some(RunReason::Triggered)
        } else if state.next_run_at <= Instant::now() {
            Some(RunReason::Due)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                state.dirty = false;
                Gate::Run(reason)
            }
            None => Gate::Wait(state.next_run_at.saturating_duration_since(Instant::now())),
        }
    }

    /// Record a successful pass and schedule the next one after `resync`
    pub fn record_success(&self, key: &DescriptorKey, generation: Option<i64>, resync: Duration) {
        let mut state = self.entry(key);
        state.observed_generation = generation;
        state.consecutive_failures = 0;
        state.next_run_at = Instant::now() + resync;
    }

    /// Record a failed pass and return the backoff before the next one
    pub fn record_failure(
        &self,
        key: &DescriptorKey,
        generation: Option<i64>,
        backoff: &Backoff,
    ) -> Duration {
        let mut state = self.entry(key);
        state.observed_generation = generation;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let delay = backoff.delay(state.consecutive_failures);
        state.next_run_at = Instant::now() + delay;
        delay
    }

    /// Force the next reconcile of a known descriptor to run a pass
    pub fn mark_dirty(&self, key: &DescriptorKey) {
        if let Some(mut state) = self.entries.get_mut(key) {
            state.dirty = true;
        }
    }

    /// Mark every known descriptor dirty and return their keys
    pub fn mark_all_dirty(&self) -> Vec<DescriptorKey> {
        let mut keys: Vec<DescriptorKey> = self
            .entries
            .iter_mut()
            .map(|mut entry| {
                entry.dirty = true;
                entry.key().clone()
            })
            .collect();
        keys.sort();
        keys
    }

    /// Drop everything known about a deleted descriptor
    pub fn forget(&self, key: &DescriptorKey) {
        self.entries.remove(key);
    }

    /// Consecutive failed passes for the descriptor
    pub fn consecutive_failures(&self, key: &DescriptorKey) -> u32 {
        self.entries
            .get(key)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }


    fn entry(&self, key: &DescriptorKey) -> RefMut<'_, DescriptorKey, PassState> {
        self.entries.entry(key.clone()).or_insert_with(|| PassState {
            observed_generation: None,
            dirty: false,
            next_run_at: Instant::now(),
            consecutive_failures: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESYNC: Duration = Duration::from_secs(60);

    fn key() -> DescriptorKey {
        DescriptorKey::new("resonance-system", "to-master")
    }

    #[test]
    fn key_displays_as_namespace_slash_name() {
        assert_eq!(key().to_string(), "resonance-system/to-master");
    }

    /// Story: our own status write echoes back as a watch event. The gate
    /// must swallow it instead of starting another pass.
    #[tokio::test(start_paused = true)]
    async fn story_status_echo_does_not_start_a_pass() {
        let registry = PassRegistry::new();
        assert_eq!(registry.gate(&key(), Some(1)), Gate::Run(RunReason::New));
        registry.record_success(&key(), Some(1), RESYNC);

        assert_eq!(registry.gate(&key(), Some(1)), Gate::Wait(RESYNC));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(
            registry.gate(&key(), Some(1)),
            Gate::Wait(Duration::from_secs(40))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_becomes_due() {
        let registry = PassRegistry::new();
        registry.record_success(&key(), Some(1), RESYNC);
        tokio::time::advance(RESYNC).await;
        assert_eq!(registry.gate(&key(), Some(1)), Gate::Run(RunReason::Due));
    }

    #[tokio::test(start_paused = true)]
    async fn spec_edit_runs_immediately() {
        let registry = PassRegistry::new();
        registry.record_success(&key(), Some(1), RESYNC);
        assert_eq!(
            registry.gate(&key(), Some(2)),
            Gate::Run(RunReason::GenerationChanged)
        );
    }

    /// Story: a tracked resource changes; the observer marks the descriptor
    /// and exactly one pass consumes that trigger.
    #[tokio::test(start_paused = true)]
    async fn story_observer_trigger_is_consumed_once() {
        let registry = PassRegistry::new();
        registry.record_success(&key(), Some(1), RESYNC);

        assert_eq!(registry.mark_all_dirty(), vec![key()]);
        assert_eq!(registry.gate(&key(), Some(1)), Gate::Run(RunReason::Triggered));
        registry.record_success(&key(), Some(1), RESYNC);
        assert_eq!(registry.gate(&key(), Some(1)), Gate::Wait(RESYNC));
    }

    #[test]
    fn marking_unknown_descriptor_is_a_noop() {
        let registry = PassRegistry::new();
        registry.mark_dirty(&key());
        assert!(registry.mark_all_dirty().is_empty());
        assert_eq!(registry.gate(&key(), Some(1)), Gate::Run(RunReason::New));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_grow_backoff_and_success_resets_it() {
        let registry = PassRegistry::new();
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(300));

        let first = registry.record_failure(&key(), Some(1), &backoff);
        let second = registry.record_failure(&key(), Some(1), &backoff);
        let third = registry.record_failure(&key(), Some(1), &backoff);
        assert_eq!(registry.consecutive_failures(&key()), 3);
        assert!(first < second && second < third);
        assert!(third >= Duration::from_secs(36));

        registry.record_success(&key(), Some(1), RESYNC);
        assert_eq!(registry.consecutive_failures(&key()), 0);
    }

    #[test]
    fn forget_drops_state() {
        let registry = PassRegistry::new();
        registry.record_success(&key(), Some(1), RESYNC);
        registry.forget(&key());
        assert_eq!(registry.gate(&key(), Some(1)), Gate::Run(RunReason::New));
    }
}
