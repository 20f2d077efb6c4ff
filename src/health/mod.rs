// Conduit — Health Tracker
//
// Per-ability reliability. Every completed call is classified by status
// code; neutral outcomes (401/403) are credential problems and leave the
// counters alone. Counters are applied with a compare-and-swap on the
// ability row so concurrent executions never lose an update. An ability
// whose score drops below 20 after at least 20 executions becomes defunct
// and stays defunct until reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Ability, AbilityStore, HealthSnapshot, HealthState, StoreError};

/// Minimum executions before an ability can become defunct.
pub const DEFUNCT_MIN_EXECUTIONS: u64 = 20;

/// Score below which an ability becomes defunct.
pub const DEFUNCT_SCORE_THRESHOLD: f64 = 20.0;

/// A snapshot is appended whenever the execution count hits a multiple of this.
pub const SNAPSHOT_INTERVAL: u64 = 10;

/// Snapshots included in a health report.
pub const REPORT_SNAPSHOT_LIMIT: usize = 20;

const MAX_CAS_ATTEMPTS: usize = 64;

/// Classification of one execution's status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Neutral,
    Failure,
}

pub fn classify(status: u16) -> Outcome {
    match status {
        200..=399 => Outcome::Success,
        401 | 403 => Outcome::Neutral,
        _ => Outcome::Failure,
    }
}

impl HealthState {
    /// The state after `outcome`, or `None` if the outcome is neutral.
    pub fn apply(&self, outcome: Outcome) -> Option<HealthState> {
        if outcome == Outcome::Neutral {
            return None;
        }

        let total_executions = self.total_executions + 1;
        let successful_executions =
            self.successful_executions + u64::from(outcome == Outcome::Success);
        let health_score =
            (100.0 * successful_executions as f64 / total_executions as f64).clamp(0.0, 100.0);
        let crossed = total_executions >= DEFUNCT_MIN_EXECUTIONS
            && health_score < DEFUNCT_SCORE_THRESHOLD;

        Some(HealthState {
            health_score,
            total_executions,
            successful_executions,
            is_defunct: self.is_defunct || crossed,
        })
    }

    /// Fraction of counted executions that succeeded; 1.0 before any.
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 1.0;
        }
        self.successful_executions as f64 / self.total_executions as f64
    }
}

/// Result of recording one outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthUpdate {
    pub outcome: Outcome,
    pub state: HealthState,
    /// True only on the execution that flipped the ability to defunct.
    pub became_defunct: bool,
}

/// Current health plus recent history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub ability_id: String,
    pub health_score: f64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub success_rate: f64,
    pub is_defunct: bool,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub snapshots: Vec<HealthSnapshot>,
}

pub struct HealthTracker<'a> {
    store: &'a dyn AbilityStore,
}

impl<'a> HealthTracker<'a> {
    pub fn new(store: &'a dyn AbilityStore) -> Self {
        Self { store }
    }

    /// Pre-execution gate: false when the ability is defunct.
    pub fn admits(&self, ability: &Ability) -> bool {
        !ability.health.is_defunct
    }

    /// Apply one execution outcome to the stored counters.
    pub fn record(
        &self,
        ability_id: &str,
        status: u16,
        executed_at: DateTime<Utc>,
    ) -> Result<HealthUpdate, StoreError> {
        let outcome = classify(status);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self
                .store
                .get(ability_id)?
                .ok_or_else(|| StoreError::NotFound(ability_id.to_string()))?
                .health;

            let Some(next) = current.apply(outcome) else {
                tracing::debug!(ability_id = %ability_id, status, "Neutral outcome, health unchanged");
                return Ok(HealthUpdate {
                    outcome,
                    state: current,
                    became_defunct: false,
                });
            };

            if !self
                .store
                .compare_and_set_health(ability_id, &current, &next, executed_at)?
            {
                tracing::debug!(ability_id = %ability_id, attempt, "Health update raced, retrying");
                continue;
            }

            let became_defunct = next.is_defunct && !current.is_defunct;
            if became_defunct {
                tracing::warn!(
                    ability_id = %ability_id,
                    health_score = next.health_score,
                    total_executions = next.total_executions,
                    "Ability marked defunct"
                );
            }

            if next.total_executions % SNAPSHOT_INTERVAL == 0 {
                self.snapshot(ability_id, &next, executed_at);
            }

            return Ok(HealthUpdate {
                outcome,
                state: next,
                became_defunct,
            });
        }

        Err(StoreError::Conflict(format!(
            "health update for '{}' kept racing after {} attempts",
            ability_id, MAX_CAS_ATTEMPTS
        )))
    }

    /// Best-effort: a failed snapshot is logged, never surfaced. Runs inline
    /// on the borrowed store.
    fn snapshot(&self, ability_id: &str, state: &HealthState, taken_at: DateTime<Utc>) {
        let snapshot = HealthSnapshot {
            ability_id: ability_id.to_string(),
            health_score: state.health_score,
            total_executions: state.total_executions,
            successful_executions: state.successful_executions,
            taken_at,
        };
        if let Err(e) = self.store.append_snapshot(&snapshot) {
            tracing::warn!(ability_id = %ability_id, error = %e, "Failed to append health snapshot");
        }
    }

    pub fn report(&self, ability_id: &str) -> Result<HealthReport, StoreError> {
        let ability = self
            .store
            .get(ability_id)?
            .ok_or_else(|| StoreError::NotFound(ability_id.to_string()))?;
        let snapshots = self.store.recent_snapshots(ability_id, REPORT_SNAPSHOT_LIMIT)?;

        Ok(HealthReport {
            ability_id: ability.id,
            health_score: ability.health.health_score,
            total_executions: ability.health.total_executions,
            successful_executions: ability.health.successful_executions,
            success_rate: ability.health.success_rate(),
            is_defunct: ability.health.is_defunct,
            last_execution_at: ability.last_execution_at,
            snapshots,
        })
    }

    /// Restore default health. Snapshot history is kept.
    pub fn reset(&self, ability_id: &str) -> Result<(), StoreError> {
        if !self.store.reset_health(ability_id)? {
            return Err(StoreError::NotFound(ability_id.to_string()));
        }
        tracing::info!(ability_id = %ability_id, "Ability health reset");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::RequestTemplate;
    use crate::store::{AbilityKind, Database, SqliteAbilityStore};

    fn insert_ability(store: &dyn AbilityStore, id: &str) {
        store
            .insert(&Ability {
                id: id.to_string(),
                owner_id: "user-1".to_string(),
                name: "Timeline".to_string(),
                description: None,
                kind: AbilityKind::Http {
                    template: RequestTemplate::get("https://api.x.com/2/timeline"),
                },
                dynamic_headers_required: false,
                dynamic_header_keys: Vec::new(),
                health: HealthState::default(),
                last_execution_at: None,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(200), Outcome::Success);
        assert_eq!(classify(302), Outcome::Success);
        assert_eq!(classify(399), Outcome::Success);
        assert_eq!(classify(401), Outcome::Neutral);
        assert_eq!(classify(403), Outcome::Neutral);
        assert_eq!(classify(400), Outcome::Failure);
        assert_eq!(classify(404), Outcome::Failure);
        assert_eq!(classify(405), Outcome::Failure);
        assert_eq!(classify(503), Outcome::Failure);
        assert_eq!(classify(101), Outcome::Failure);
    }

    #[test]
    fn test_apply_neutral_is_noop() {
        assert!(HealthState::default().apply(Outcome::Neutral).is_none());
    }

    #[test]
    fn test_apply_computes_score() {
        let state = HealthState::default()
            .apply(Outcome::Success)
            .and_then(|s| s.apply(Outcome::Failure))
            .and_then(|s| s.apply(Outcome::Failure))
            .and_then(|s| s.apply(Outcome::Success))
            .unwrap();
        assert_eq!(state.total_executions, 4);
        assert_eq!(state.successful_executions, 2);
        assert_eq!(state.health_score, 50.0);
        assert!(!state.is_defunct);
    }

    #[test]
    fn test_not_defunct_before_twenty_executions() {
        let mut state = HealthState::default();
        for _ in 0..19 {
            state = state.apply(Outcome::Failure).unwrap();
        }
        assert_eq!(state.health_score, 0.0);
        assert!(!state.is_defunct);

        state = state.apply(Outcome::Failure).unwrap();
        assert!(state.is_defunct);
    }

    #[test]
    fn test_defunct_is_sticky_until_reset() {
        let mut state = HealthState {
            health_score: 10.0,
            total_executions: 20,
            successful_executions: 2,
            is_defunct: true,
        };
        for _ in 0..30 {
            state = state.apply(Outcome::Success).unwrap();
        }
        assert!(state.health_score > 20.0);
        assert!(state.is_defunct);
    }

    #[test]
    fn test_record_two_of_twenty_five_is_defunct() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert_ability(&store, "ab-1");
        let tracker = HealthTracker::new(&store);

        let mut flips = 0;
        for i in 0..25 {
            let status = if i < 2 { 200 } else { 500 };
            let update = tracker.record("ab-1", status, Utc::now()).unwrap();
            flips += usize::from(update.became_defunct);
        }

        let ability = store.get("ab-1").unwrap().unwrap();
        assert_eq!(ability.health.total_executions, 25);
        assert_eq!(ability.health.successful_executions, 2);
        assert_eq!(ability.health.health_score, 8.0);
        assert!(ability.health.is_defunct);
        assert!(!tracker.admits(&ability));
        assert_eq!(flips, 1);
        assert!(ability.last_execution_at.is_some());
    }

    #[test]
    fn test_neutral_record_leaves_store_untouched() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert_ability(&store, "ab-1");
        let tracker = HealthTracker::new(&store);

        tracker.record("ab-1", 500, Utc::now()).unwrap();
        let before = store.get("ab-1").unwrap().unwrap().health;
        let update = tracker.record("ab-1", 401, Utc::now()).unwrap();
        tracker.record("ab-1", 403, Utc::now()).unwrap();

        assert_eq!(update.outcome, Outcome::Neutral);
        assert_eq!(store.get("ab-1").unwrap().unwrap().health, before);
    }

    #[test]
    fn test_snapshots_every_tenth_execution() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert_ability(&store, "ab-1");
        let tracker = HealthTracker::new(&store);

        for _ in 0..25 {
            tracker.record("ab-1", 200, Utc::now()).unwrap();
        }
        tracker.record("ab-1", 401, Utc::now()).unwrap();

        let report = tracker.report("ab-1").unwrap();
        assert_eq!(report.snapshots.len(), 2);
        assert_eq!(report.snapshots[0].total_executions, 20);
        assert_eq!(report.snapshots[1].total_executions, 10);
        assert_eq!(report.success_rate, 1.0);
    }

    #[test]
    fn test_snapshot_failure_never_fails_the_record() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert_ability(&store, "ab-1");
        db.conn().unwrap().execute_batch("DROP TABLE health_snapshots").unwrap();
        let tracker = HealthTracker::new(&store);

        for _ in 0..10 {
            tracker.record("ab-1", 200, Utc::now()).unwrap();
        }
        let ability = store.get("ab-1").unwrap().unwrap();
        assert_eq!(ability.health.total_executions, 10);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert_ability(&store, "ab-1");
        let tracker = HealthTracker::new(&store);

        for _ in 0..20 {
            tracker.record("ab-1", 500, Utc::now()).unwrap();
        }
        assert!(store.get("ab-1").unwrap().unwrap().health.is_defunct);

        tracker.reset("ab-1").unwrap();
        let health = store.get("ab-1").unwrap().unwrap().health;
        assert_eq!(health, HealthState::default());

        assert!(matches!(tracker.reset("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert_ability(&store, "ab-1");
        let tracker = HealthTracker::new(&store);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let tracker = &tracker;
                scope.spawn(move || {
                    for i in 0..25 {
                        let status = if (t + i) % 2 == 0 { 200 } else { 500 };
                        tracker.record("ab-1", status, Utc::now()).unwrap();
                    }
                });
            }
        });

        let health = store.get("ab-1").unwrap().unwrap().health;
        assert_eq!(health.total_executions, 100);
        assert_eq!(health.successful_executions, 50);
    }

    #[test]
    fn test_record_unknown_ability() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        let tracker = HealthTracker::new(&store);
        assert!(matches!(
            tracker.record("nope", 200, Utc::now()),
            Err(StoreError::NotFound(_))
        ));
    }
}
