//! Safety guards evaluated before any platform mutation: the static
//! blacklist, the per-target cooldown and the in-flight plan cap.
//!
//! Every refusal is side-effect-free. Admission into the in-flight set and
//! the cooldown claim on a target are each an atomic check-and-insert under
//! the guard mutex. The in-flight slot is released when its permit drops.

use autoheal_core::config::{BlacklistConfig, RemediationConfig};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum GuardRefusal {
    Blacklisted { target: String, namespace: String },
    Cooldown { target: String, remaining_secs: i64 },
    ConcurrencyLimit { active: usize, max: usize },
    AlreadyRunning { plan_id: String },
}

impl GuardRefusal {
    /// Metric label for the refusal.
    pub fn reason(&self) -> &'static str {
        match self {
            GuardRefusal::Blacklisted { .. } => "blacklist",
            GuardRefusal::Cooldown { .. } => "cooldown",
            GuardRefusal::ConcurrencyLimit { .. } => "concurrency",
            GuardRefusal::AlreadyRunning { .. } => "duplicate",
        }
    }
}

impl fmt::Display for GuardRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardRefusal::Blacklisted { target, namespace } => {
                write!(f, "Target is blacklisted: {namespace}/{target}")
            }
            GuardRefusal::Cooldown {
                target,
                remaining_secs,
            } => write!(
                f,
                "Target is in cooldown period: {target} ({remaining_secs}s remaining)"
            ),
            GuardRefusal::ConcurrencyLimit { active, max } => {
                write!(f, "Max concurrent executions reached ({active}/{max})")
            }
            GuardRefusal::AlreadyRunning { plan_id } => {
                write!(f, "Plan is already executing: {plan_id}")
            }
        }
    }
}

#[derive(Debug, Default)]
struct GuardState {
    in_flight: BTreeSet<String>,
    last_action: HashMap<String, DateTime<Utc>>,
}

pub struct SafetyGuards {
    blacklist: BlacklistConfig,
    cooldown: Duration,
    max_concurrent: usize,
    state: Mutex<GuardState>,
}

impl SafetyGuards {
    pub fn new(config: &RemediationConfig) -> Self {
        Self {
            blacklist: config.blacklist.clone(),
            cooldown: Duration::minutes(config.cooldown_minutes),
            max_concurrent: config.max_concurrent_actions,
            state: Mutex::new(GuardState::default()),
        }
    }

    /// Namespace deny-list, then label keys matched as substrings of the
    /// lowercased target name.
    pub fn check_blacklist(&self, target: &str, namespace: &str) -> Result<(), GuardRefusal> {
        let refused = || GuardRefusal::Blacklisted {
            target: target.to_string(),
            namespace: namespace.to_string(),
        };
        if self.blacklist.namespaces.iter().any(|n| n == namespace) {
            return Err(refused());
        }
        let lowered = target.to_lowercase();
        let label_hit = self.blacklist.labels.iter().any(|label| {
            let key = label.split('=').next().unwrap_or_default();
            !key.is_empty() && lowered.contains(&key.to_lowercase())
        });
        if label_hit {
            return Err(refused());
        }
        Ok(())
    }

    /// Checks the cooldown and stamps `now` as the target's last action in
    /// one critical section. Returns the previous stamp so a dispatch that
    /// fails can hand the target back with [`SafetyGuards::release_target`].
    pub fn claim_target(
        &self,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, GuardRefusal> {
        let mut state = self.state.lock();
        self.cooldown_refusal(&state, target, now)?;
        Ok(state.last_action.insert(target.to_string(), now))
    }

    /// Restores the stamp a failed claim replaced.
    pub fn release_target(&self, target: &str, previous: Option<DateTime<Utc>>) {
        let mut state = self.state.lock();
        match previous {
            Some(at) => state.last_action.insert(target.to_string(), at),
            None => state.last_action.remove(target),
        };
    }

    pub fn record_action(&self, target: &str, at: DateTime<Utc>) {
        self.state.lock().last_action.insert(target.to_string(), at);
    }

    fn cooldown_refusal(
        &self,
        state: &GuardState,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<(), GuardRefusal> {
        match state.last_action.get(target) {
            Some(last) if now - *last < self.cooldown => Err(GuardRefusal::Cooldown {
                target: target.to_string(),
                remaining_secs: (self.cooldown - (now - *last)).num_seconds(),
            }),
            _ => Ok(()),
        }
    }

    /// Admits `plan_id` into the in-flight set unless it is already there
    /// or the cap is reached.
    pub fn try_admit(&self, plan_id: &str) -> Result<InFlightPermit<'_>, GuardRefusal> {
        let mut state = self.state.lock();
        if state.in_flight.contains(plan_id) {
            return Err(GuardRefusal::AlreadyRunning {
                plan_id: plan_id.to_string(),
            });
        }
        let active = state.in_flight.len();
        if active >= self.max_concurrent {
            return Err(GuardRefusal::ConcurrencyLimit {
                active,
                max: self.max_concurrent,
            });
        }
        state.in_flight.insert(plan_id.to_string());
        Ok(InFlightPermit {
            guards: self,
            plan_id: plan_id.to_string(),
        })
    }

    /// In-flight plan ids, sorted.
    pub fn in_flight(&self) -> Vec<String> {
        self.state.lock().in_flight.iter().cloned().collect()
    }

    fn release(&self, plan_id: &str) {
        self.state.lock().in_flight.remove(plan_id);
    }
}

/// Holds a plan's in-flight slot until dropped.
pub struct InFlightPermit<'a> {
    guards: &'a SafetyGuards,
    plan_id: String,
}

impl Drop for InFlightPermit<'_> {
    fn drop(&mut self) {
        self.guards.release(&self.plan_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guards(max: usize) -> SafetyGuards {
        SafetyGuards::new(&RemediationConfig {
            max_concurrent_actions: max,
            ..Default::default()
        })
    }

    #[test]
    fn test_blacklist_namespace_and_label_key() {
        let g = guards(3);
        assert!(g.check_blacklist("coredns", "kube-system").is_err());
        // "do-not-remediate=true" matches on its key
        let err = g.check_blacklist("Do-Not-Remediate-ledger", "production").unwrap_err();
        assert_eq!(err.reason(), "blacklist");
        assert!(g.check_blacklist("trading-api", "production").is_ok());
    }

    #[test]
    fn test_cooldown_window() {
        let g = guards(3);
        let t0 = Utc::now();
        assert_eq!(g.claim_target("trading-api", t0), Ok(None));

        let err = g.claim_target("trading-api", t0 + Duration::minutes(2)).unwrap_err();
        match err {
            GuardRefusal::Cooldown { remaining_secs, .. } => assert_eq!(remaining_secs, 180),
            other => panic!("unexpected refusal: {other:?}"),
        }
        assert_eq!(
            g.claim_target("trading-api", t0 + Duration::minutes(5)),
            Ok(Some(t0))
        );
        assert!(g.claim_target("matching-engine", t0).is_ok());
    }

    #[test]
    fn test_permit_releases_slot() {
        let g = guards(2);
        let a = g.try_admit("PLAN-a").unwrap();
        let _b = g.try_admit("PLAN-b").unwrap();
        let refused = g.try_admit("PLAN-c").err().unwrap();
        assert_eq!(refused, GuardRefusal::ConcurrencyLimit { active: 2, max: 2 });
        assert_eq!(g.in_flight(), vec!["PLAN-a", "PLAN-b"]);

        drop(a);
        assert!(g.try_admit("PLAN-c").is_ok());
    }

    #[test]
    fn test_claim_target_is_exclusive() {
        let g = guards(3);
        let t0 = Utc::now();
        assert_eq!(g.claim_target("trading-api", t0), Ok(None));
        let err = g.claim_target("trading-api", t0).unwrap_err();
        assert_eq!(err.reason(), "cooldown");

        // a released claim restores the earlier state
        g.release_target("trading-api", None);
        assert!(g.claim_target("trading-api", t0).is_ok());

        let earlier = t0 - Duration::minutes(10);
        g.record_action("ledger", earlier);
        assert_eq!(g.claim_target("ledger", t0), Ok(Some(earlier)));
        g.release_target("ledger", Some(earlier));
        assert!(g
            .claim_target("ledger", earlier + Duration::minutes(1))
            .is_err());
        assert_eq!(g.claim_target("ledger", t0), Ok(Some(earlier)));
    }

    #[test]
    fn test_same_plan_is_not_admitted_twice() {
        let g = guards(3);
        let first = g.try_admit("PLAN-a").unwrap();
        let refused = g.try_admit("PLAN-a").err().unwrap();
        assert_eq!(
            refused,
            GuardRefusal::AlreadyRunning {
                plan_id: "PLAN-a".into()
            }
        );
        assert_eq!(refused.reason(), "duplicate");
        assert_eq!(g.in_flight(), vec!["PLAN-a"]);

        drop(first);
        assert!(g.in_flight().is_empty());
        assert!(g.try_admit("PLAN-a").is_ok());
    }
}
