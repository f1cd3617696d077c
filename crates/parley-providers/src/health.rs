//! Failure tracking for chain members.
//!
//! The chain reports every attempt here. A provider whose recent failures
//! outweigh the policy is flagged degraded for `/health` and the metrics
//! gauge. Flags are informational: the chain still tries providers in
//! configured order.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{info, warn};

/// When a provider counts as degraded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HealthPolicy {
    /// Attempts remembered per provider.
    pub window: usize,
    /// Failure ratio that must be exceeded.
    pub max_failure_ratio: f64,
    /// Attempts needed before any verdict.
    pub min_attempts: usize,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            window: 10,
            max_failure_ratio: 0.5,
            min_attempts: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    Ok,
    Failed,
}

/// Last `window` attempts of one provider, with a running failure count.
#[derive(Debug, Default)]
struct Recent {
    attempts: VecDeque<Attempt>,
    failures: usize,
    degraded: bool,
}

impl Recent {
    fn push(&mut self, attempt: Attempt, window: usize) {
        if self.attempts.len() == window {
            if let Some(Attempt::Failed) = self.attempts.pop_front() {
                self.failures -= 1;
            }
        }
        if attempt == Attempt::Failed {
            self.failures += 1;
        }
        self.attempts.push_back(attempt);
    }

    #[allow(clippy::cast_precision_loss)]
    fn failure_ratio(&self) -> f64 {
        if self.attempts.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.attempts.len() as f64
        }
    }

    fn verdict(&self, policy: &HealthPolicy) -> bool {
        self.attempts.len() >= policy.min_attempts
            && self.failure_ratio() > policy.max_failure_ratio
    }
}

/// Per-provider attempt history, shared by every chain.
#[derive(Debug)]
pub struct ProviderHealthTracker {
    policy: HealthPolicy,
    providers: Mutex<HashMap<String, Recent>>,
}

impl ProviderHealthTracker {
    /// Tracker using [`HealthPolicy::default`].
    pub fn new() -> Self {
        Self::with_policy(HealthPolicy::default())
    }

    /// Tracker with an explicit policy. The window is at least one attempt
    /// and the ratio is clamped to `0.0..=1.0`.
    pub fn with_policy(policy: HealthPolicy) -> Self {
        let policy = HealthPolicy {
            window: policy.window.max(1),
            max_failure_ratio: policy.max_failure_ratio.clamp(0.0, 1.0),
            min_attempts: policy.min_attempts,
        };
        Self {
            policy,
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// The active policy.
    pub fn policy(&self) -> HealthPolicy {
        self.policy
    }

    /// Note a successful attempt.
    pub fn record_success(&self, provider: &str) {
        self.record(provider, Attempt::Ok);
    }

    /// Note a failed attempt.
    pub fn record_failure(&self, provider: &str) {
        self.record(provider, Attempt::Failed);
    }

    /// Whether `provider` is currently flagged. Unknown providers are not.
    pub fn is_degraded(&self, provider: &str) -> bool {
        self.providers
            .lock()
            .get(provider)
            .is_some_and(|recent| recent.degraded)
    }

    /// Share of remembered attempts that failed, `0.0` when none are known.
    pub fn failure_ratio(&self, provider: &str) -> f64 {
        self.providers
            .lock()
            .get(provider)
            .map_or(0.0, Recent::failure_ratio)
    }

    /// Flagged providers in name order.
    pub fn degraded_providers(&self) -> Vec<String> {
        let providers = self.providers.lock();
        let mut names: Vec<String> = providers
            .iter()
            .filter_map(|(name, recent)| recent.degraded.then(|| name.clone()))
            .collect();
        names.sort_unstable();
        names
    }

    fn record(&self, provider: &str, attempt: Attempt) {
        let (was, now, ratio) = {
            let mut providers = self.providers.lock();
            let recent = providers.entry(provider.to_owned()).or_default();
            recent.push(attempt, self.policy.window);
            let was = recent.degraded;
            recent.degraded = recent.verdict(&self.policy);
            (was, recent.degraded, recent.failure_ratio())
        };

        metrics::gauge!("provider_degraded", "provider" => provider.to_owned())
            .set(if now { 1.0 } else { 0.0 });

        match (was, now) {
            (false, true) => warn!(provider, failure_ratio = ratio, "provider degraded"),
            (true, false) => info!(provider, failure_ratio = ratio, "provider recovered"),
            _ => {}
        }
    }
}

impl Default for ProviderHealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(window: usize) -> ProviderHealthTracker {
        ProviderHealthTracker::with_policy(HealthPolicy {
            window,
            ..HealthPolicy::default()
        })
    }

    #[test]
    fn nothing_recorded_means_healthy() {
        let health = ProviderHealthTracker::default();
        assert!(!health.is_degraded("openai"));
        assert!(health.failure_ratio("openai").abs() < f64::EPSILON);
        assert!(health.degraded_providers().is_empty());
    }

    #[test]
    fn one_failure_is_not_a_verdict() {
        let health = ProviderHealthTracker::new();
        health.record_failure("sidecar");
        assert!(!health.is_degraded("sidecar"));
        health.record_failure("sidecar");
        assert!(health.is_degraded("sidecar"));
    }

    #[test]
    fn exactly_half_failing_stays_healthy() {
        let health = tracker(4);
        for ok in [true, false, true, false] {
            if ok {
                health.record_success("p");
            } else {
                health.record_failure("p");
            }
        }
        assert!((health.failure_ratio("p") - 0.5).abs() < f64::EPSILON);
        assert!(!health.is_degraded("p"));
    }

    #[test]
    fn old_failures_age_out() {
        let health = tracker(3);
        for _ in 0..3 {
            health.record_failure("p");
        }
        assert!(health.is_degraded("p"));
        health.record_success("p");
        health.record_success("p");
        // one failure left of three
        assert!(!health.is_degraded("p"));
        assert!((health.failure_ratio("p") - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn flags_are_per_provider() {
        let health = tracker(4);
        for _ in 0..4 {
            health.record_failure("whisper");
            health.record_success("deepl");
        }
        health.record_failure("azure");
        health.record_failure("azure");
        assert_eq!(
            health.degraded_providers(),
            vec!["azure".to_owned(), "whisper".to_owned()]
        );
        assert!(!health.is_degraded("deepl"));
    }

    #[test]
    fn policy_is_normalized() {
        let health = ProviderHealthTracker::with_policy(HealthPolicy {
            window: 0,
            max_failure_ratio: 4.0,
            min_attempts: 1,
        });
        assert_eq!(health.policy().window, 1);
        assert!((health.policy().max_failure_ratio - 1.0).abs() < f64::EPSILON);
        health.record_failure("p");
        // a ratio can never exceed 1.0
        assert!(!health.is_degraded("p"));
    }
}
