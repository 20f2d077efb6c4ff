// Conduit — Unix Domain Socket Server
//
// Listens on a Unix domain socket for newline-delimited JSON-RPC 2.0
// requests. Each connection is handled in its own tokio task; requests on a
// connection are processed in order. Caller identity (`ownerId`) arrives
// already resolved in the params of each request.

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use uuid::Uuid;

use crate::chain::ChainError;
use crate::engine::{ChainRequest, EngineError, ExecutionEngine, FailureResponse};
use crate::error::ConduitError;
use crate::sandbox::HttpTransport;
use crate::store::{
    Database, NewAbility, NewCredential, SqliteAbilityStore, SqliteCredentialStore,
};
use crate::vault::{DecryptionKey, VaultError};

use super::protocol::{
    JsonRpcRequest, JsonRpcResponse, ABILITY_DEFUNCT, ABILITY_NOT_FOUND, INTERNAL_ERROR,
    INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, MISSING_CREDENTIALS, SANDBOX_FAILED,
};

/// Unix Domain Socket server for Conduit.
pub struct UdsServer {
    db: Arc<Database>,
    transport: Arc<dyn HttpTransport>,
    socket_path: PathBuf,
}

impl UdsServer {
    pub fn new(db: Arc<Database>, transport: Arc<dyn HttpTransport>, socket_path: PathBuf) -> Self {
        Self {
            db,
            transport,
            socket_path,
        }
    }

    /// Bind the socket with owner-only permissions, replacing a stale file.
    pub async fn bind(&self) -> Result<UnixListener, ConduitError> {
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if self.socket_path.exists() {
            tokio::fs::remove_file(&self.socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        tracing::info!(socket = %self.socket_path.display(), "Conduit UDS server listening");
        Ok(listener)
    }

    /// Accept connections until the process is terminated.
    pub async fn serve(&self, listener: UnixListener) -> Result<(), ConduitError> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let db = Arc::clone(&self.db);
            let transport = Arc::clone(&self.transport);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, db, transport).await {
                    tracing::error!(error = %e, "Connection handler error");
                }
            });
        }
    }

    pub async fn run(&self) -> Result<(), ConduitError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }
}

/// Read newline-delimited requests and write one response line for each.
async fn handle_connection(
    stream: UnixStream,
    db: Arc<Database>,
    transport: Arc<dyn HttpTransport>,
) -> Result<(), ConduitError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = process_request(&line, &db, transport.as_ref()).await;
        let mut json = serde_json::to_string(&response)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Parse and dispatch a single JSON-RPC request.
pub(crate) async fn process_request(
    raw: &str,
    db: &Database,
    transport: &dyn HttpTransport,
) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => return JsonRpcResponse::parse_error(format!("Parse error: {}", e)),
    };

    if let Err(e) = request.validate() {
        return JsonRpcResponse::error(request.id, INVALID_REQUEST, e);
    }

    let credentials = SqliteCredentialStore::new(db);
    let abilities = SqliteAbilityStore::new(db);
    let engine = ExecutionEngine::new(&credentials, &abilities, transport);

    let id = request.id;
    let params = request.params;

    tracing::debug!(method = %request.method, "Dispatching request");

    let outcome = match request.method.as_str() {
        "execute_ability" => handle_execute_ability(&engine, params).await,
        "execute_chain" => handle_execute_chain(&engine, params).await,
        "get_health" => handle_get_health(&engine, params),
        "reset_health" => handle_reset_health(&engine, params),
        "store_credentials" => handle_store_credentials(&engine, params),
        "list_credentials" => handle_list_credentials(&engine, params),
        "delete_credential" => handle_delete_credential(&engine, params),
        "register_ability" => handle_register_ability(&engine, params),
        "list_abilities" => handle_list_abilities(&engine, params),
        other => {
            return JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Unknown method: {}", other),
            )
        }
    };

    match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(failure) => failure.into_response(id),
    }
}

// ─── Failures ────────────────────────────────────────────────────────────────

/// Why a handler could not produce a result.
enum Failure {
    Params(String),
    Internal(String),
    Engine(EngineError),
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Failure::Engine(e)
    }
}

impl From<serde_json::Error> for Failure {
    fn from(e: serde_json::Error) -> Self {
        Failure::Internal(format!("Failed to serialize result: {}", e))
    }
}

impl Failure {
    fn into_response(self, id: Value) -> JsonRpcResponse {
        let err = match self {
            Failure::Params(message) => return JsonRpcResponse::error(id, INVALID_PARAMS, message),
            Failure::Internal(message) => {
                tracing::error!(error = %message, "Request failed");
                return JsonRpcResponse::error(id, INTERNAL_ERROR, message);
            }
            Failure::Engine(err) => err,
        };

        let code = error_code(&err);
        let message = err.to_string();
        match code {
            MISSING_CREDENTIALS | ABILITY_DEFUNCT | ABILITY_NOT_FOUND | SANDBOX_FAILED => {
                let data = serde_json::to_value(FailureResponse::from(&err)).unwrap_or(Value::Null);
                JsonRpcResponse::error_with_data(id, code, message, data)
            }
            INTERNAL_ERROR => {
                tracing::error!(error = %message, "Request failed");
                JsonRpcResponse::error(id, code, message)
            }
            _ => JsonRpcResponse::error(id, code, message),
        }
    }
}

fn error_code(err: &EngineError) -> i32 {
    if err.is_missing_credentials() {
        return MISSING_CREDENTIALS;
    }
    match err {
        EngineError::Defunct { .. } => ABILITY_DEFUNCT,
        EngineError::AbilityNotFound(_) | EngineError::Chain(ChainError::AbilityNotFound(_)) => {
            ABILITY_NOT_FOUND
        }
        EngineError::Sandbox(_) => SANDBOX_FAILED,
        EngineError::InvalidRequest(_)
        | EngineError::Chain(ChainError::InvalidLength { .. })
        | EngineError::Chain(ChainError::NestedWorkflow(_))
        | EngineError::Credentials(VaultError::MalformedKey(_))
        | EngineError::Credentials(VaultError::InvalidKey(_)) => INVALID_PARAMS,
        _ => INTERNAL_ERROR,
    }
}

// ─── Params ──────────────────────────────────────────────────────────────────

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, Failure> {
    serde_json::from_value(params).map_err(|e| Failure::Params(format!("Invalid params: {}", e)))
}

fn parse_key(raw: Option<&str>) -> Result<Option<DecryptionKey>, Failure> {
    raw.map(DecryptionKey::parse)
        .transpose()
        .map_err(|e| Failure::Params(e.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerParams {
    owner_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AbilityParams {
    ability_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteParams {
    owner_id: String,
    ability_id: String,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    decryption_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainParams {
    owner_id: String,
    #[serde(default)]
    decryption_key: Option<String>,
    #[serde(flatten)]
    request: ChainRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreCredentialsParams {
    owner_id: String,
    credentials: Vec<NewCredential>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteCredentialParams {
    owner_id: String,
    id: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterAbilityParams {
    owner_id: String,
    ability: NewAbility,
}

// ─── Method Handlers ─────────────────────────────────────────────────────────

async fn handle_execute_ability(engine: &ExecutionEngine<'_>, params: Value) -> Result<Value, Failure> {
    let p: ExecuteParams = parse_params(params)?;
    let key = parse_key(p.decryption_key.as_deref())?;
    let response = engine
        .execute_ability(&p.owner_id, &p.ability_id, p.params, key.as_ref())
        .await?;
    Ok(serde_json::to_value(response)?)
}

async fn handle_execute_chain(engine: &ExecutionEngine<'_>, params: Value) -> Result<Value, Failure> {
    let p: ChainParams = parse_params(params)?;
    let key = parse_key(p.decryption_key.as_deref())?;
    let report = engine.execute_chain(&p.owner_id, p.request, key.as_ref()).await?;
    Ok(serde_json::to_value(report)?)
}

fn handle_get_health(engine: &ExecutionEngine<'_>, params: Value) -> Result<Value, Failure> {
    let p: AbilityParams = parse_params(params)?;
    Ok(serde_json::to_value(engine.health_report(&p.ability_id)?)?)
}

fn handle_reset_health(engine: &ExecutionEngine<'_>, params: Value) -> Result<Value, Failure> {
    let p: AbilityParams = parse_params(params)?;
    Ok(serde_json::to_value(engine.reset_health(&p.ability_id)?)?)
}

fn handle_store_credentials(engine: &ExecutionEngine<'_>, params: Value) -> Result<Value, Failure> {
    let p: StoreCredentialsParams = parse_params(params)?;
    let ids = engine.store_credentials(&p.owner_id, p.credentials)?;
    Ok(serde_json::json!({ "stored": ids.len(), "ids": ids }))
}

fn handle_list_credentials(engine: &ExecutionEngine<'_>, params: Value) -> Result<Value, Failure> {
    let p: OwnerParams = parse_params(params)?;
    Ok(serde_json::to_value(engine.list_credentials(&p.owner_id)?)?)
}

fn handle_delete_credential(engine: &ExecutionEngine<'_>, params: Value) -> Result<Value, Failure> {
    let p: DeleteCredentialParams = parse_params(params)?;
    if engine.delete_credential(&p.owner_id, &p.id)? {
        Ok(serde_json::json!({ "deleted": true, "id": p.id }))
    } else {
        Err(Failure::Params(format!("Credential not found: {}", p.id)))
    }
}

fn handle_register_ability(engine: &ExecutionEngine<'_>, params: Value) -> Result<Value, Failure> {
    let p: RegisterAbilityParams = parse_params(params)?;
    Ok(serde_json::to_value(engine.register_ability(&p.owner_id, p.ability)?)?)
}

fn handle_list_abilities(engine: &ExecutionEngine<'_>, params: Value) -> Result<Value, Failure> {
    let p: OwnerParams = parse_params(params)?;
    Ok(serde_json::to_value(engine.list_abilities(&p.owner_id)?)?)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
