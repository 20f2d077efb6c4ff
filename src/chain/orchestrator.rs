// Conduit — Chain Orchestrator
//
// Runs chain steps strictly in order. A step succeeds when its upstream call
// completes with a 2xx/3xx status. The carry (what flows into the next step)
// is the step's output, or its projection when the step has an output
// mapping; the next step's own params are laid over the carry.
//
// Every executed step has already performed its HTTP call and health update.
// Stopping a chain part-way rolls none of that back.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::dot_path::{extract, project};
use super::{ChainError, ChainStep};
use crate::health::{classify, Outcome};
use crate::sandbox::SandboxResult;
use crate::store::{Ability, AbilityKind, AbilityStore, HealthState};

/// Longest chain accepted.
pub const MAX_CHAIN_STEPS: usize = 10;

/// Prefix of every synthesized workflow ability id.
const WORKFLOW_ID_PREFIX: &str = "workflow-";

/// Executes one resolved step: credential resolution, health gate, sandbox
/// call and health update. Implemented by the execution engine.
#[async_trait]
pub trait StepRunner: Send + Sync {
    type Error: fmt::Display + Send;

    async fn run_step(
        &self,
        owner_id: &str,
        ability: &Ability,
        params: &Map<String, Value>,
    ) -> Result<SandboxResult, Self::Error>;
}

/// Declarative post-processing of the final output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputTransform {
    /// Return the value at one dot path.
    Path(String),
    /// Build `{targetField: value[sourcePath]}`.
    Projection(BTreeMap<String, String>),
}

impl OutputTransform {
    pub fn apply(&self, output: &Value) -> Result<Value, ChainError> {
        match self {
            OutputTransform::Path(path) => extract(output, path)
                .cloned()
                .ok_or_else(|| ChainError::Transform(format!("path '{}' not found in output", path))),
            OutputTransform::Projection(fields) => {
                let mut projected = Map::new();
                for (target, source) in fields {
                    let value = extract(output, source).ok_or_else(|| {
                        ChainError::Transform(format!("path '{}' not found in output", source))
                    })?;
                    projected.insert(target.clone(), value.clone());
                }
                Ok(Value::Object(projected))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainOptions {
    pub stop_on_error: bool,
    pub transform: Option<OutputTransform>,
    /// False when replaying an existing workflow.
    pub create_workflow: bool,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            transform: None,
            create_workflow: true,
        }
    }
}

/// Per-step outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub ability_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub success: bool,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub total_time_ms: u64,
    pub steps: Vec<StepRecord>,
    pub final_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_ability_id: Option<String>,
    /// Set when the chain succeeded but its workflow could not be saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub struct ChainOrchestrator<'a, R: StepRunner> {
    abilities: &'a dyn AbilityStore,
    runner: &'a R,
}

impl<'a, R: StepRunner> ChainOrchestrator<'a, R> {
    pub fn new(abilities: &'a dyn AbilityStore, runner: &'a R) -> Self {
        Self { abilities, runner }
    }

    /// Load and check every step's ability before anything runs.
    fn load_steps(&self, steps: &[ChainStep]) -> Result<Vec<Ability>, ChainError> {
        if steps.is_empty() || steps.len() > MAX_CHAIN_STEPS {
            return Err(ChainError::InvalidLength {
                got: steps.len(),
                max: MAX_CHAIN_STEPS,
            });
        }

        steps
            .iter()
            .map(|step| {
                let ability = self
                    .abilities
                    .get(&step.ability_id)?
                    .ok_or_else(|| ChainError::AbilityNotFound(step.ability_id.clone()))?;
                if ability.is_workflow() {
                    return Err(ChainError::NestedWorkflow(ability.id));
                }
                Ok(ability)
            })
            .collect()
    }

    pub async fn run(
        &self,
        owner_id: &str,
        steps: &[ChainStep],
        options: &ChainOptions,
    ) -> Result<ChainReport, ChainError> {
        let abilities = self.load_steps(steps)?;
        let started = Instant::now();

        let mut carry: Map<String, Value> = Map::new();
        let mut last_output: Option<Value> = None;
        let mut records = Vec::with_capacity(steps.len());

        for (index, (step, ability)) in steps.iter().zip(&abilities).enumerate() {
            let mut params = carry.clone();
            for (k, v) in &step.params {
                params.insert(k.clone(), v.clone());
            }

            let step_started = Instant::now();
            let outcome = self.runner.run_step(owner_id, ability, &params).await;
            let time_ms = step_started.elapsed().as_millis() as u64;

            let record = match outcome {
                Ok(result) if classify(result.status_code) == Outcome::Success => {
                    carry = match &step.output_mapping {
                        Some(mapping) => project(&result.body, mapping),
                        None => result.body.as_object().cloned().unwrap_or_default(),
                    };
                    last_output = Some(result.body.clone());
                    StepRecord {
                        ability_id: step.ability_id.clone(),
                        success: true,
                        status_code: Some(result.status_code),
                        time_ms,
                        output: Some(result.body),
                        error: None,
                    }
                }
                Ok(result) => StepRecord {
                    ability_id: step.ability_id.clone(),
                    success: false,
                    status_code: Some(result.status_code),
                    time_ms,
                    error: Some(format!("upstream returned status {}", result.status_code)),
                    output: Some(result.body),
                },
                Err(e) => StepRecord {
                    ability_id: step.ability_id.clone(),
                    success: false,
                    status_code: None,
                    time_ms,
                    output: None,
                    error: Some(e.to_string()),
                },
            };

            tracing::info!(
                step = index + 1,
                ability_id = %record.ability_id,
                success = record.success,
                time_ms,
                "Chain step finished"
            );

            let failed = !record.success;
            records.push(record);
            if failed && options.stop_on_error {
                tracing::info!(step = index + 1, "Chain halted on failed step");
                break;
            }
        }

        let completed_steps = records.iter().filter(|r| r.success).count();
        let success = completed_steps == steps.len();

        let mut report = ChainReport {
            success,
            completed_steps,
            total_steps: steps.len(),
            total_time_ms: 0,
            steps: records,
            final_output: None,
            transform_error: None,
            workflow_ability_id: None,
            workflow_error: None,
            note: None,
        };

        if success && steps.len() >= 2 && options.create_workflow {
            match self.create_workflow(owner_id, steps, &abilities) {
                Ok(id) => {
                    report.note = Some(format!(
                        "Created workflow ability '{}'; it can be executed independently like any other ability",
                        id
                    ));
                    report.workflow_ability_id = Some(id);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to save workflow ability");
                    report.workflow_error = Some(format!("Failed to save workflow ability: {}", e));
                }
            }
        }

        report.final_output = match (&options.transform, last_output) {
            (Some(transform), Some(output)) => match transform.apply(&output) {
                Ok(transformed) => Some(transformed),
                Err(e) => {
                    report.transform_error = Some(e.to_string());
                    Some(output)
                }
            },
            (_, output) => output,
        };
        report.total_time_ms = started.elapsed().as_millis() as u64;

        Ok(report)
    }

    fn create_workflow(
        &self,
        owner_id: &str,
        steps: &[ChainStep],
        abilities: &[Ability],
    ) -> Result<String, ChainError> {
        let mut keys: Vec<String> = Vec::new();
        for ability in abilities {
            for key in &ability.dynamic_header_keys {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }

        let name = abilities
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(" -> ");

        let workflow = Ability {
            id: format!("{}{}", WORKFLOW_ID_PREFIX, Uuid::new_v4()),
            owner_id: owner_id.to_string(),
            name,
            description: Some(format!("Workflow of {} chained abilities", steps.len())),
            kind: AbilityKind::Workflow {
                steps: steps.to_vec(),
            },
            dynamic_headers_required: !keys.is_empty(),
            dynamic_header_keys: keys,
            health: HealthState::default(),
            last_execution_at: None,
            created_at: Utc::now(),
        };

        self.abilities.insert(&workflow)?;
        tracing::info!(
            ability_id = %workflow.id,
            steps = steps.len(),
            "Workflow ability created"
        );
        Ok(workflow.id)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{RequestTemplate, SandboxError};
    use crate::store::{Database, HealthSnapshot, SqliteAbilityStore, StoreError};
    use chrono::DateTime;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted runner: fixed `(status, body)` per ability id, records params.
    struct ScriptedRunner {
        responses: HashMap<String, (u16, Value)>,
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    impl ScriptedRunner {
        fn new(responses: &[(&str, u16, Value)]) -> Self {
            Self {
                responses: responses
                    .iter()
                    .map(|(id, s, b)| (id.to_string(), (*s, b.clone())))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, Map<String, Value>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepRunner for ScriptedRunner {
        type Error = SandboxError;

        async fn run_step(
            &self,
            _owner_id: &str,
            ability: &Ability,
            params: &Map<String, Value>,
        ) -> Result<SandboxResult, SandboxError> {
            self.calls
                .lock()
                .unwrap()
                .push((ability.id.clone(), params.clone()));
            let (status, body) = self
                .responses
                .get(&ability.id)
                .cloned()
                .ok_or_else(|| SandboxError::Transport("connection refused".into()))?;
            Ok(SandboxResult {
                status_code: status,
                body,
                executed_at: Utc::now(),
                execution_time_ms: 1,
            })
        }
    }

    fn insert(store: &dyn AbilityStore, id: &str, name: &str, keys: &[&str]) {
        store
            .insert(&Ability {
                id: id.to_string(),
                owner_id: "user-1".to_string(),
                name: name.to_string(),
                description: None,
                kind: AbilityKind::Http {
                    template: RequestTemplate::get("https://api.x.com/v1"),
                },
                dynamic_headers_required: !keys.is_empty(),
                dynamic_header_keys: keys.iter().map(|k| k.to_string()).collect(),
                health: HealthState::default(),
                last_execution_at: None,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    fn step(id: &str, params: Value, mapping: &[(&str, &str)]) -> ChainStep {
        ChainStep {
            ability_id: id.to_string(),
            params: params.as_object().cloned().unwrap_or_default(),
            output_mapping: (!mapping.is_empty()).then(|| {
                mapping
                    .iter()
                    .map(|(s, t)| (s.to_string(), t.to_string()))
                    .collect()
            }),
        }
    }

    #[tokio::test]
    async fn test_two_step_chain_threads_mapping_and_creates_workflow() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert(&store, "search", "Search tweets", &["api.x.com::Authorization"]);
        insert(&store, "like", "Like tweet", &["api.x.com::Authorization", "api.x.com::X-Csrf"]);

        let runner = ScriptedRunner::new(&[
            ("search", 200, json!({ "tweets": [{ "id": "123" }] })),
            ("like", 200, json!({ "liked": true })),
        ]);
        let orchestrator = ChainOrchestrator::new(&store, &runner);

        let steps = vec![
            step("search", json!({ "q": "rust" }), &[("tweets.0.id", "tweetId")]),
            step("like", json!({ "reason": "great" }), &[]),
        ];
        let report = orchestrator
            .run("user-1", &steps, &ChainOptions::default())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.completed_steps, 2);
        assert_eq!(report.final_output, Some(json!({ "liked": true })));

        let calls = runner.calls();
        assert_eq!(
            Value::Object(calls[1].1.clone()),
            json!({ "tweetId": "123", "reason": "great" })
        );

        let workflow_id = report.workflow_ability_id.unwrap();
        assert!(workflow_id.starts_with("workflow-"));
        let workflow = store.get(&workflow_id).unwrap().unwrap();
        assert_eq!(workflow.name, "Search tweets -> Like tweet");
        assert_eq!(
            workflow.dynamic_header_keys,
            vec!["api.x.com::Authorization".to_string(), "api.x.com::X-Csrf".to_string()]
        );
        assert!(workflow.dynamic_headers_required);
        assert!(matches!(workflow.kind, AbilityKind::Workflow { ref steps } if steps.len() == 2));
    }

    #[tokio::test]
    async fn test_single_step_never_creates_workflow() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert(&store, "search", "Search", &[]);
        let runner = ScriptedRunner::new(&[("search", 200, json!({}))]);

        let report = ChainOrchestrator::new(&store, &runner)
            .run("user-1", &[step("search", json!({}), &[])], &ChainOptions::default())
            .await
            .unwrap();

        assert!(report.success);
        assert!(report.workflow_ability_id.is_none());
        assert_eq!(store.list_for_owner("user-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_mapping_source_omits_target() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert(&store, "a", "A", &[]);
        insert(&store, "b", "B", &[]);
        let runner = ScriptedRunner::new(&[
            ("a", 200, json!({ "items": [] })),
            ("b", 200, json!({})),
        ]);

        let steps = vec![
            step("a", json!({}), &[("items.0.id", "itemId")]),
            step("b", json!({ "x": 1 }), &[]),
        ];
        ChainOrchestrator::new(&store, &runner)
            .run("user-1", &steps, &ChainOptions::default())
            .await
            .unwrap();

        assert_eq!(Value::Object(runner.calls()[1].1.clone()), json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn test_stop_on_error_halts_and_creates_nothing() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert(&store, "a", "A", &[]);
        insert(&store, "b", "B", &[]);
        insert(&store, "c", "C", &[]);
        let runner = ScriptedRunner::new(&[
            ("a", 200, json!({ "v": 1 })),
            ("b", 500, json!({ "error": "boom" })),
            ("c", 200, json!({})),
        ]);

        let steps = vec![
            step("a", json!({}), &[]),
            step("b", json!({}), &[]),
            step("c", json!({}), &[]),
        ];
        let report = ChainOrchestrator::new(&store, &runner)
            .run("user-1", &steps, &ChainOptions::default())
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.completed_steps, 1);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[1].status_code, Some(500));
        assert!(report.workflow_ability_id.is_none());
        assert_eq!(report.final_output, Some(json!({ "v": 1 })));
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_continue_on_error_carries_last_successful_output() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert(&store, "a", "A", &[]);
        insert(&store, "b", "B", &[]);
        insert(&store, "c", "C", &[]);
        let runner = ScriptedRunner::new(&[
            ("a", 200, json!({ "token": "t1" })),
            ("c", 200, json!({ "done": true })),
        ]);

        let steps = vec![
            step("a", json!({}), &[]),
            step("b", json!({}), &[]),
            step("c", json!({}), &[]),
        ];
        let options = ChainOptions {
            stop_on_error: false,
            ..ChainOptions::default()
        };
        let report = ChainOrchestrator::new(&store, &runner)
            .run("user-1", &steps, &options)
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.completed_steps, 2);
        assert!(report.steps[1].error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(Value::Object(runner.calls()[2].1.clone()), json!({ "token": "t1" }));
        assert!(report.workflow_ability_id.is_none());
    }

    #[tokio::test]
    async fn test_rejects_invalid_lengths_and_nested_workflows() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert(&store, "a", "A", &[]);
        let runner = ScriptedRunner::new(&[("a", 200, json!({}))]);
        let orchestrator = ChainOrchestrator::new(&store, &runner);

        let err = orchestrator
            .run("user-1", &[], &ChainOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidLength { got: 0, .. }));

        let eleven: Vec<ChainStep> = (0..11).map(|_| step("a", json!({}), &[])).collect();
        let err = orchestrator
            .run("user-1", &eleven, &ChainOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidLength { got: 11, .. }));

        let err = orchestrator
            .run("user-1", &[step("ghost", json!({}), &[])], &ChainOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::AbilityNotFound(_)));

        let report = orchestrator
            .run(
                "user-1",
                &[step("a", json!({}), &[]), step("a", json!({}), &[])],
                &ChainOptions::default(),
            )
            .await
            .unwrap();
        let workflow_id = report.workflow_ability_id.unwrap();

        let err = orchestrator
            .run("user-1", &[step(&workflow_id, json!({}), &[])], &ChainOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::NestedWorkflow(_)));
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_transform_failure_keeps_workflow() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert(&store, "a", "A", &[]);
        insert(&store, "b", "B", &[]);
        let runner = ScriptedRunner::new(&[
            ("a", 200, json!({})),
            ("b", 200, json!({ "data": { "id": 7 } })),
        ]);
        let orchestrator = ChainOrchestrator::new(&store, &runner);
        let steps = vec![step("a", json!({}), &[]), step("b", json!({}), &[])];

        let options = ChainOptions {
            transform: Some(OutputTransform::Path("data.id".to_string())),
            ..ChainOptions::default()
        };
        let report = orchestrator.run("user-1", &steps, &options).await.unwrap();
        assert_eq!(report.final_output, Some(json!(7)));

        let options = ChainOptions {
            transform: Some(OutputTransform::Path("data.missing".to_string())),
            ..ChainOptions::default()
        };
        let report = orchestrator.run("user-1", &steps, &options).await.unwrap();
        assert!(report.transform_error.is_some());
        assert!(report.workflow_ability_id.is_some());
        assert_eq!(report.final_output, Some(json!({ "data": { "id": 7 } })));
    }

    /// Delegates to SQLite but refuses every insert after the fixtures.
    struct ReadOnlyStore<'a> {
        inner: SqliteAbilityStore<'a>,
    }

    impl AbilityStore for ReadOnlyStore<'_> {
        fn insert(&self, _ability: &Ability) -> Result<(), StoreError> {
            Err(StoreError::Other("disk is read-only".into()))
        }
        fn get(&self, id: &str) -> Result<Option<Ability>, StoreError> {
            self.inner.get(id)
        }
        fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Ability>, StoreError> {
            self.inner.list_for_owner(owner_id)
        }
        fn compare_and_set_health(
            &self,
            id: &str,
            expected: &HealthState,
            next: &HealthState,
            executed_at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.compare_and_set_health(id, expected, next, executed_at)
        }
        fn reset_health(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.reset_health(id)
        }
        fn append_snapshot(&self, snapshot: &HealthSnapshot) -> Result<(), StoreError> {
            self.inner.append_snapshot(snapshot)
        }
        fn recent_snapshots(&self, id: &str, limit: usize) -> Result<Vec<HealthSnapshot>, StoreError> {
            self.inner.recent_snapshots(id, limit)
        }
    }

    #[tokio::test]
    async fn test_workflow_save_failure_is_reported() {
        let db = Database::open_in_memory().unwrap();
        let sqlite = SqliteAbilityStore::new(&db);
        insert(&sqlite, "a", "A", &[]);
        insert(&sqlite, "b", "B", &[]);
        let store = ReadOnlyStore {
            inner: SqliteAbilityStore::new(&db),
        };
        let runner = ScriptedRunner::new(&[("a", 200, json!({})), ("b", 200, json!({ "ok": 1 }))]);

        let report = ChainOrchestrator::new(&store, &runner)
            .run(
                "user-1",
                &[step("a", json!({}), &[]), step("b", json!({}), &[])],
                &ChainOptions::default(),
            )
            .await
            .unwrap();

        assert!(report.success);
        assert!(report.workflow_ability_id.is_none());
        assert!(report.note.is_none());
        let error = report.workflow_error.as_deref().unwrap();
        assert!(error.contains("disk is read-only"), "{}", error);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["workflowError"].is_string());
    }

    #[test]
    fn test_transform_deserializes_path_or_projection() {
        let path: OutputTransform = serde_json::from_value(json!("a.b")).unwrap();
        assert_eq!(path, OutputTransform::Path("a.b".to_string()));

        let projection: OutputTransform =
            serde_json::from_value(json!({ "first": "items.0" })).unwrap();
        let out = projection.apply(&json!({ "items": ["x", "y"] })).unwrap();
        assert_eq!(out, json!({ "first": "x" }));
    }

    #[tokio::test]
    async fn test_replay_mode_creates_no_workflow() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteAbilityStore::new(&db);
        insert(&store, "a", "A", &[]);
        insert(&store, "b", "B", &[]);
        let runner = ScriptedRunner::new(&[("a", 200, json!({})), ("b", 200, json!({}))]);

        let options = ChainOptions {
            create_workflow: false,
            ..ChainOptions::default()
        };
        let report = ChainOrchestrator::new(&store, &runner)
            .run(
                "user-1",
                &[step("a", json!({}), &[]), step("b", json!({}), &[])],
                &options,
            )
            .await
            .unwrap();
        assert!(report.success);
        assert!(report.workflow_ability_id.is_none());
    }
}
