// Conduit — Execution Engine
//
// The top-level operations: run one ability, run a chain, query and reset
// health, store credentials and register abilities. Every call is
// independent; the only shared state is the persisted records.
//
// SECURITY: the decryption key is borrowed for the duration of one call and
// resolved credentials are moved into the sandbox, which drops them before
// returning. Nothing in this module logs or stores either.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::chain::{
    ChainError, ChainOptions, ChainOrchestrator, ChainReport, ChainStep, OutputTransform, StepRunner,
};
use crate::health::{classify, HealthReport, HealthTracker, Outcome};
use crate::sandbox::{HttpTransport, RequestTemplate, Sandbox, SandboxError, SandboxResult};
use crate::store::{
    Ability, AbilityKind, AbilityStore, CredentialStore, CredentialSummary, HealthState,
    NewAbility, NewCredential, StoreError,
};
use crate::vault::{CredentialResolver, DecryptionKey, DynamicHeaderKey, VaultError};

/// HTTP status reported with a defunct rejection.
pub const GONE_STATUS: u16 = 410;

/// Status reported for a workflow whose failing step never got a response.
const NO_RESPONSE_STATUS: u16 = 502;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Ability not found: {0}")]
    AbilityNotFound(String),

    #[error(
        "Ability '{ability_id}' is defunct (health score {:.0} after {} executions); search for an alternative ability",
        .health.health_score,
        .health.total_executions
    )]
    Defunct {
        ability_id: String,
        health: HealthState,
    },

    #[error("Ability '{0}' requires credentials but no decryption key was supplied")]
    MissingDecryptionKey(String),

    #[error(transparent)]
    Credentials(#[from] VaultError),

    #[error("Sandbox execution failed: {0}")]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// True when required credentials could not be resolved.
    pub fn is_missing_credentials(&self) -> bool {
        matches!(
            self,
            EngineError::Credentials(VaultError::MissingCredentials(_))
                | EngineError::MissingDecryptionKey(_)
        )
    }
}

// ─── Response Shapes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub score: f64,
    pub total_executions: u64,
    pub success_rate: f64,
}

impl From<&HealthState> for HealthSummary {
    fn from(state: &HealthState) -> Self {
        Self {
            score: state.health_score,
            total_executions: state.total_executions,
            success_rate: state.success_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    pub result: SandboxResult,
    pub health: HealthSummary,
    /// Step detail when the ability is a workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainReport>,
}

/// Body returned to callers for a failed execute call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureResponse {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defunct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_executions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl From<&EngineError> for FailureResponse {
    fn from(err: &EngineError) -> Self {
        let mut response = FailureResponse {
            success: false,
            error: err.to_string(),
            defunct: None,
            health_score: None,
            total_executions: None,
            success_rate: None,
            status: None,
        };
        match err {
            EngineError::Defunct { health, .. } => {
                response.defunct = Some(true);
                response.health_score = Some(health.health_score);
                response.total_executions = Some(health.total_executions);
                response.success_rate = Some(health.success_rate());
                response.status = Some(GONE_STATUS);
            }
            EngineError::AbilityNotFound(_) => response.status = Some(404),
            _ => {}
        }
        response
    }
}

/// Options accepted by the execute-chain operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRequest {
    pub chain: Vec<ChainStep>,
    #[serde(default)]
    pub stop_on_error: Option<bool>,
    #[serde(default, alias = "transformCode")]
    pub transform: Option<OutputTransform>,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct ExecutionEngine<'a> {
    credentials: &'a dyn CredentialStore,
    abilities: &'a dyn AbilityStore,
    transport: &'a dyn HttpTransport,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(
        credentials: &'a dyn CredentialStore,
        abilities: &'a dyn AbilityStore,
        transport: &'a dyn HttpTransport,
    ) -> Self {
        Self {
            credentials,
            abilities,
            transport,
        }
    }

    fn load(&self, ability_id: &str) -> Result<Ability, EngineError> {
        self.abilities
            .get(ability_id)?
            .ok_or_else(|| EngineError::AbilityNotFound(ability_id.to_string()))
    }

    fn gate(&self, ability: &Ability) -> Result<(), EngineError> {
        if HealthTracker::new(self.abilities).admits(ability) {
            return Ok(());
        }
        tracing::info!(ability_id = %ability.id, "Rejected execution of defunct ability");
        Err(EngineError::Defunct {
            ability_id: ability.id.clone(),
            health: ability.health.clone(),
        })
    }

    /// Execute one ability by id.
    pub async fn execute_ability(
        &self,
        owner_id: &str,
        ability_id: &str,
        params: Map<String, Value>,
        key: Option<&DecryptionKey>,
    ) -> Result<ExecuteResponse, EngineError> {
        let ability = self.load(ability_id)?;
        self.gate(&ability)?;

        match &ability.kind {
            AbilityKind::Http { template } => {
                let (result, health) = self
                    .run_http(owner_id, &ability, template, &params, key)
                    .await?;
                Ok(ExecuteResponse {
                    success: classify(result.status_code) == Outcome::Success,
                    result,
                    health: HealthSummary::from(&health),
                    chain: None,
                })
            }
            AbilityKind::Workflow { steps } => {
                self.replay_workflow(owner_id, &ability, steps, params, key)
                    .await
            }
        }
    }

    /// Resolve, sandbox, record. The caller has already applied the gate.
    async fn run_http(
        &self,
        owner_id: &str,
        ability: &Ability,
        template: &RequestTemplate,
        params: &Map<String, Value>,
        key: Option<&DecryptionKey>,
    ) -> Result<(SandboxResult, HealthState), EngineError> {
        let credentials = if ability.dynamic_headers_required
            && !ability.dynamic_header_keys.is_empty()
        {
            let key = key.ok_or_else(|| EngineError::MissingDecryptionKey(ability.id.clone()))?;
            let resolved = CredentialResolver::new(self.credentials).resolve(
                owner_id,
                key,
                &ability.dynamic_header_keys,
            )?;
            Some(resolved)
        } else {
            None
        };

        let result = Sandbox::new(self.transport)
            .execute(template, params, credentials)
            .await?;

        let update = HealthTracker::new(self.abilities).record(
            &ability.id,
            result.status_code,
            result.executed_at,
        )?;

        tracing::info!(
            ability_id = %ability.id,
            status = result.status_code,
            outcome = ?update.outcome,
            health_score = update.state.health_score,
            elapsed_ms = result.execution_time_ms,
            "Ability executed"
        );

        Ok((result, update.state))
    }

    /// Replay a stored workflow. Call params are laid over the first step's.
    async fn replay_workflow(
        &self,
        owner_id: &str,
        workflow: &Ability,
        steps: &[ChainStep],
        params: Map<String, Value>,
        key: Option<&DecryptionKey>,
    ) -> Result<ExecuteResponse, EngineError> {
        let mut steps = steps.to_vec();
        if let Some(first) = steps.first_mut() {
            for (k, v) in params {
                first.params.insert(k, v);
            }
        }

        let options = ChainOptions {
            stop_on_error: true,
            transform: None,
            create_workflow: false,
        };

        let executed_at = Utc::now();
        let runner = EngineStepRunner { engine: self, key };
        let report = ChainOrchestrator::new(self.abilities, &runner)
            .run(owner_id, &steps, &options)
            .await?;

        let last_status = report.steps.last().and_then(|s| s.status_code);
        let health = match last_status {
            Some(status) => {
                HealthTracker::new(self.abilities)
                    .record(&workflow.id, status, Utc::now())?
                    .state
            }
            None => self.load(&workflow.id)?.health,
        };

        tracing::info!(
            ability_id = %workflow.id,
            completed = report.completed_steps,
            total = report.total_steps,
            "Workflow replayed"
        );

        Ok(ExecuteResponse {
            success: report.success,
            result: SandboxResult {
                status_code: last_status.unwrap_or(NO_RESPONSE_STATUS),
                body: report.final_output.clone().unwrap_or(Value::Null),
                executed_at,
                execution_time_ms: report.total_time_ms,
            },
            health: HealthSummary::from(&health),
            chain: Some(report),
        })
    }

    /// Run an ad-hoc chain; a fully successful chain of 2+ steps is saved as
    /// a workflow ability.
    pub async fn execute_chain(
        &self,
        owner_id: &str,
        request: ChainRequest,
        key: Option<&DecryptionKey>,
    ) -> Result<ChainReport, EngineError> {
        let options = ChainOptions {
            stop_on_error: request.stop_on_error.unwrap_or(true),
            transform: request.transform,
            create_workflow: true,
        };
        let runner = EngineStepRunner { engine: self, key };
        let report = ChainOrchestrator::new(self.abilities, &runner)
            .run(owner_id, &request.chain, &options)
            .await?;
        Ok(report)
    }

    pub fn health_report(&self, ability_id: &str) -> Result<HealthReport, EngineError> {
        HealthTracker::new(self.abilities)
            .report(ability_id)
            .map_err(|e| not_found_as_ability(e, ability_id))
    }

    pub fn reset_health(&self, ability_id: &str) -> Result<HealthReport, EngineError> {
        let tracker = HealthTracker::new(self.abilities);
        tracker
            .reset(ability_id)
            .map_err(|e| not_found_as_ability(e, ability_id))?;
        Ok(tracker.report(ability_id)?)
    }

    /// Store pre-encrypted credentials. Plaintext never reaches this path.
    pub fn store_credentials(
        &self,
        owner_id: &str,
        credentials: Vec<NewCredential>,
    ) -> Result<Vec<Uuid>, EngineError> {
        let mut ids = Vec::with_capacity(credentials.len());
        for mut credential in credentials {
            credential.domain = credential.domain.trim().to_ascii_lowercase();
            credential.key = credential.key.trim().to_string();
            if credential.domain.is_empty() || credential.key.is_empty() {
                return Err(EngineError::InvalidRequest(
                    "credential domain and key must not be empty".into(),
                ));
            }
            if credential.encrypted_value.ciphertext.is_empty()
                || credential.encrypted_value.iv.is_empty()
            {
                return Err(EngineError::InvalidRequest(
                    "credential value must be pre-encrypted {ciphertext, iv}".into(),
                ));
            }
            ids.push(self.credentials.upsert(owner_id, credential)?);
        }
        Ok(ids)
    }

    pub fn list_credentials(&self, owner_id: &str) -> Result<Vec<CredentialSummary>, EngineError> {
        Ok(self.credentials.list_summaries(owner_id)?)
    }

    pub fn delete_credential(&self, owner_id: &str, id: &Uuid) -> Result<bool, EngineError> {
        Ok(self.credentials.delete(owner_id, id)?)
    }

    pub fn credential_audit(&self, owner_id: &str, id: &Uuid) -> Result<Vec<String>, EngineError> {
        Ok(self.credentials.get_audit_logs(owner_id, id)?)
    }

    /// Register an HTTP ability. Health starts at defaults.
    pub fn register_ability(&self, owner_id: &str, new: NewAbility) -> Result<Ability, EngineError> {
        if new.name.trim().is_empty() {
            return Err(EngineError::InvalidRequest("ability name must not be empty".into()));
        }
        new.template
            .validate()
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;

        let mut keys: Vec<String> = Vec::with_capacity(new.dynamic_header_keys.len());
        for raw in &new.dynamic_header_keys {
            let parsed: DynamicHeaderKey = raw
                .parse()
                .map_err(|e: VaultError| EngineError::InvalidRequest(e.to_string()))?;
            let canonical = parsed.to_string();
            if !keys.contains(&canonical) {
                keys.push(canonical);
            }
        }

        let ability = Ability {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            owner_id: owner_id.to_string(),
            name: new.name.trim().to_string(),
            description: new.description,
            kind: AbilityKind::Http {
                template: new.template,
            },
            dynamic_headers_required: !keys.is_empty(),
            dynamic_header_keys: keys,
            health: HealthState::default(),
            last_execution_at: None,
            created_at: Utc::now(),
        };
        self.abilities.insert(&ability).map_err(|e| match e {
            StoreError::Conflict(id) => {
                EngineError::InvalidRequest(format!("ability id '{}' already exists", id))
            }
            other => EngineError::Store(other),
        })?;

        tracing::info!(
            ability_id = %ability.id,
            required_credentials = ability.dynamic_header_keys.len(),
            "Ability registered"
        );
        Ok(ability)
    }

    pub fn list_abilities(&self, owner_id: &str) -> Result<Vec<Ability>, EngineError> {
        Ok(self.abilities.list_for_owner(owner_id)?)
    }
}

fn not_found_as_ability(err: StoreError, ability_id: &str) -> EngineError {
    match err {
        StoreError::NotFound(_) => EngineError::AbilityNotFound(ability_id.to_string()),
        other => EngineError::Store(other),
    }
}

/// Chain steps run through the same gate, resolver, sandbox and tracker as
/// single executions.
struct EngineStepRunner<'e, 'a> {
    engine: &'e ExecutionEngine<'a>,
    key: Option<&'e DecryptionKey>,
}

#[async_trait]
impl<'e, 'a> StepRunner for EngineStepRunner<'e, 'a> {
    type Error = EngineError;

    async fn run_step(
        &self,
        owner_id: &str,
        ability: &Ability,
        params: &Map<String, Value>,
    ) -> Result<SandboxResult, EngineError> {
        let current = self.engine.load(&ability.id)?;
        self.engine.gate(&current)?;
        let AbilityKind::Http { template } = &current.kind else {
            return Err(ChainError::NestedWorkflow(current.id.clone()).into());
        };

        let started = Instant::now();
        let (result, _) = self
            .engine
            .run_http(owner_id, &current, template, params, self.key)
            .await?;
        tracing::debug!(
            ability_id = %current.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Chain step executed"
        );
        Ok(result)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
