// Conduit — CLI Command Handlers
//
// Each function handles one CLI subcommand. They open the database from the
// resolved settings and go through the execution engine, the same path the
// socket server uses. `serve` starts the UDS server.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::Settings;
use crate::engine::{ChainRequest, ExecutionEngine};
use crate::error::ConduitError;
use crate::gateway::UdsServer;
use crate::sandbox::HttpTransport;
use crate::store::{
    CredentialType, NewAbility, NewCredential, SqliteAbilityStore, SqliteCredentialStore,
};
use crate::vault::{seal, DecryptionKey};

use super::{AbilityCommand, Cli, Commands, CredentialCommand, HealthCommand, KeyArgs};

/// Execute the parsed CLI command.
pub async fn execute(cli: Cli) -> Result<(), ConduitError> {
    let settings = Settings::resolve(cli.data_dir, cli.socket, cli.http_timeout_secs)?;

    match cli.command {
        Commands::Serve => cmd_serve(&settings).await,
        Commands::Keygen { passphrase, owner } => cmd_keygen(passphrase, owner),
        Commands::Credential { action } => cmd_credential(&settings, action),
        Commands::Ability { action } => cmd_ability(&settings, action),
        Commands::Execute {
            owner,
            ability_id,
            params,
            key,
        } => cmd_execute(&settings, owner, ability_id, params, key).await,
        Commands::Chain { owner, file, key } => cmd_chain(&settings, owner, &file, key).await,
        Commands::Health { action } => cmd_health(&settings, action),
    }
}

// ─── Serve ───────────────────────────────────────────────────────────────────

async fn cmd_serve(settings: &Settings) -> Result<(), ConduitError> {
    let db = Arc::new(settings.open_database()?);
    let transport: Arc<dyn HttpTransport> = Arc::new(settings.transport()?);

    println!("Starting Conduit UDS server at {}...", settings.socket_path.display());
    println!("  Database: {}", settings.db_path().display());

    let server = UdsServer::new(db, transport, settings.socket_path.clone());
    server.run().await
}

// ─── Keygen ──────────────────────────────────────────────────────────────────

fn cmd_keygen(passphrase: Option<String>, owner: Option<String>) -> Result<(), ConduitError> {
    let key = match (passphrase, owner) {
        (Some(passphrase), Some(owner)) => DecryptionKey::derive_from_passphrase(&passphrase, &owner)?,
        (Some(_), None) => {
            return Err(ConduitError::Other("--passphrase requires --owner".to_string()))
        }
        (None, _) => DecryptionKey::generate(),
    };

    println!("{}", key.to_base64().as_str());
    eprintln!("Keep this key safe: stored credentials cannot be recovered without it.");
    Ok(())
}

// ─── Credentials ─────────────────────────────────────────────────────────────

fn cmd_credential(settings: &Settings, action: CredentialCommand) -> Result<(), ConduitError> {
    let db = settings.open_database()?;
    let transport = settings.transport()?;
    let (credentials, abilities) = (SqliteCredentialStore::new(&db), SqliteAbilityStore::new(&db));
    let engine = ExecutionEngine::new(&credentials, &abilities, &transport);

    match action {
        CredentialCommand::Add {
            owner,
            domain,
            credential_type,
            name,
            secret,
            key,
        } => cmd_credential_add(&engine, owner, domain, credential_type, name, secret, key),
        CredentialCommand::List { owner } => {
            let summaries = engine.list_credentials(&owner)?;
            if summaries.is_empty() {
                println!("No credentials stored for '{}'.", owner);
                println!("Add one with: conduit credential add --owner <id> --domain <host> --name <header> --secret <value>");
                return Ok(());
            }

            println!("Stored credentials ({}):\n", summaries.len());
            for summary in &summaries {
                println!(
                    "  {} │ {:7} │ {:24} │ {}",
                    summary.id, summary.credential_type.as_str(), summary.domain, summary.key,
                );
            }
            Ok(())
        }
        CredentialCommand::Delete { owner, id } => {
            let id = parse_uuid(&id)?;
            if engine.delete_credential(&owner, &id)? {
                println!("✓ Credential {} deleted", id);
            } else {
                println!("Credential not found: {}", id);
            }
            Ok(())
        }
        CredentialCommand::Audit { owner, id } => {
            let id = parse_uuid(&id)?;
            let logs = engine.credential_audit(&owner, &id)?;
            if logs.is_empty() {
                println!("No audit logs found for credential: {}", id);
                return Ok(());
            }

            println!("Audit Log for Credential: {}", id);
            println!("{:-<80}", "");
            for log in logs {
                println!("{}", log);
            }
            println!("{:-<80}", "");
            Ok(())
        }
    }
}

fn cmd_credential_add(
    engine: &ExecutionEngine<'_>,
    owner: String,
    domain: String,
    credential_type: CredentialType,
    name: String,
    secret: String,
    key: KeyArgs,
) -> Result<(), ConduitError> {
    let key = resolve_key(&key, &owner)?
        .ok_or_else(|| ConduitError::Other("credential add needs --key or --passphrase".to_string()))?;

    let secret = Zeroizing::new(secret);
    let encrypted_value = seal(&key, &secret)?;

    let ids = engine.store_credentials(
        &owner,
        vec![NewCredential {
            domain: domain.clone(),
            credential_type,
            key: name.clone(),
            encrypted_value,
            metadata: Value::Null,
        }],
    )?;

    println!("✓ Credential stored");
    for id in ids {
        println!("  ID:     {}", id);
    }
    println!("  Target: {}::{} ({})", domain, name, credential_type);
    Ok(())
}

// ─── Abilities ───────────────────────────────────────────────────────────────

fn cmd_ability(settings: &Settings, action: AbilityCommand) -> Result<(), ConduitError> {
    let db = settings.open_database()?;
    let transport = settings.transport()?;
    let (credentials, abilities) = (SqliteCredentialStore::new(&db), SqliteAbilityStore::new(&db));
    let engine = ExecutionEngine::new(&credentials, &abilities, &transport);

    match action {
        AbilityCommand::Register { owner, file } => {
            let new: NewAbility = read_json(&file)?;
            let ability = engine.register_ability(&owner, new)?;
            println!("✓ Ability registered");
            println!("  ID:          {}", ability.id);
            println!("  Name:        {}", ability.name);
            if !ability.dynamic_header_keys.is_empty() {
                println!("  Credentials: {}", ability.dynamic_header_keys.join(", "));
            }
            Ok(())
        }
        AbilityCommand::List { owner } => {
            let list = engine.list_abilities(&owner)?;
            if list.is_empty() {
                println!("No abilities registered for '{}'.", owner);
                return Ok(());
            }

            println!("Abilities ({}):\n", list.len());
            for ability in &list {
                println!(
                    "  {:40} │ {:8} │ {:5.1} │ {}{}",
                    ability.id,
                    if ability.is_workflow() { "workflow" } else { "http" },
                    ability.health.health_score,
                    ability.name,
                    if ability.health.is_defunct { " (defunct)" } else { "" },
                );
            }
            Ok(())
        }
    }
}

// ─── Execute / Chain ─────────────────────────────────────────────────────────

async fn cmd_execute(
    settings: &Settings,
    owner: String,
    ability_id: String,
    params: String,
    key: KeyArgs,
) -> Result<(), ConduitError> {
    let params: Map<String, Value> = serde_json::from_str(&params)
        .map_err(|e| ConduitError::Other(format!("--params must be a JSON object: {}", e)))?;
    let key = resolve_key(&key, &owner)?;

    let db = settings.open_database()?;
    let transport = settings.transport()?;
    let (credentials, abilities) = (SqliteCredentialStore::new(&db), SqliteAbilityStore::new(&db));
    let engine = ExecutionEngine::new(&credentials, &abilities, &transport);

    let response = engine
        .execute_ability(&owner, &ability_id, params, key.as_ref())
        .await?;
    print_json(&response)
}

async fn cmd_chain(settings: &Settings, owner: String, file: &Path, key: KeyArgs) -> Result<(), ConduitError> {
    let request: ChainRequest = read_json(file)?;
    let key = resolve_key(&key, &owner)?;

    let db = settings.open_database()?;
    let transport = settings.transport()?;
    let (credentials, abilities) = (SqliteCredentialStore::new(&db), SqliteAbilityStore::new(&db));
    let engine = ExecutionEngine::new(&credentials, &abilities, &transport);

    let report = engine.execute_chain(&owner, request, key.as_ref()).await?;
    print_json(&report)
}

// ─── Health ──────────────────────────────────────────────────────────────────

fn cmd_health(settings: &Settings, action: HealthCommand) -> Result<(), ConduitError> {
    let db = settings.open_database()?;
    let transport = settings.transport()?;
    let (credentials, abilities) = (SqliteCredentialStore::new(&db), SqliteAbilityStore::new(&db));
    let engine = ExecutionEngine::new(&credentials, &abilities, &transport);

    let report = match action {
        HealthCommand::Show { ability_id } => engine.health_report(&ability_id)?,
        HealthCommand::Reset { ability_id } => {
            let report = engine.reset_health(&ability_id)?;
            println!("✓ Health reset for {}", ability_id);
            report
        }
    };
    print_json(&report)
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// `--key` wins; `--passphrase` is derived with the owner as salt.
fn resolve_key(args: &KeyArgs, owner: &str) -> Result<Option<DecryptionKey>, ConduitError> {
    if let Some(raw) = args.key.as_deref() {
        return Ok(Some(DecryptionKey::parse(raw)?));
    }
    match args.passphrase.as_deref() {
        Some(passphrase) => Ok(Some(DecryptionKey::derive_from_passphrase(passphrase, owner)?)),
        None => Ok(None),
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, ConduitError> {
    Uuid::parse_str(raw).map_err(|e| ConduitError::Other(format!("Invalid UUID: {}", e)))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConduitError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ConduitError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_key_prefers_explicit_key() {
        let generated = DecryptionKey::generate();
        let args = KeyArgs {
            key: Some(generated.to_base64().as_str().to_string()),
            passphrase: Some("ignored".to_string()),
        };
        let resolved = resolve_key(&args, "user-1").unwrap().unwrap();

        let sealed = seal(&resolved, "v").unwrap();
        assert_eq!(crate::vault::open(&generated, &sealed).unwrap().as_str(), "v");
    }

    #[test]
    fn test_resolve_key_absent() {
        assert!(resolve_key(&KeyArgs::default(), "user-1").unwrap().is_none());
    }

    #[test]
    fn test_passphrase_key_is_owner_scoped() {
        let args = KeyArgs {
            key: None,
            passphrase: Some("correct horse".to_string()),
        };
        let a = resolve_key(&args, "user-1").unwrap().unwrap();
        let b = resolve_key(&args, "user-2").unwrap().unwrap();

        let sealed = seal(&a, "v").unwrap();
        assert!(crate::vault::open(&b, &sealed).is_err());
    }

    #[test]
    fn test_read_json_ability_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ability.json");
        std::fs::write(
            &path,
            r#"{"name":"Status","template":{"url":"https://api.x.com/status"}}"#,
        )
        .unwrap();

        let new: NewAbility = read_json(&path).unwrap();
        assert_eq!(new.name, "Status");
        assert!(new.dynamic_header_keys.is_empty());
    }
}
