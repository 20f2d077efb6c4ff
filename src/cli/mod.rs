// Conduit — CLI Module
//
// Command-line interface using clap derive macros.
// Subcommands: serve, keygen, credential, ability, execute, chain, health.

mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{ENV_DATA_DIR, ENV_HTTP_TIMEOUT, ENV_SOCKET};
use crate::store::CredentialType;

pub use commands::execute;

/// Conduit — credential-scoped execution of recorded HTTP abilities.
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory holding conduit.db.
    #[arg(long, global = true, env = ENV_DATA_DIR)]
    pub data_dir: Option<PathBuf>,

    /// Unix socket path for `serve`.
    #[arg(long, global = true, env = ENV_SOCKET)]
    pub socket: Option<PathBuf>,

    /// Outbound HTTP timeout in seconds.
    #[arg(long, global = true, env = ENV_HTTP_TIMEOUT)]
    pub http_timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the JSON-RPC server on the Unix socket.
    Serve,

    /// Print a decryption key: random, or derived from a passphrase.
    Keygen {
        /// Derive from this passphrase instead of generating randomly.
        #[arg(long, requires = "owner")]
        passphrase: Option<String>,

        /// Owner the passphrase-derived key is salted with.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Manage stored credentials.
    Credential {
        #[command(subcommand)]
        action: CredentialCommand,
    },

    /// Manage registered abilities.
    Ability {
        #[command(subcommand)]
        action: AbilityCommand,
    },

    /// Execute one ability.
    Execute {
        #[arg(long)]
        owner: String,

        /// The ability id.
        ability_id: String,

        /// Template parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Run a chain of abilities described in a JSON file.
    Chain {
        #[arg(long)]
        owner: String,

        /// JSON file: {"chain": [...], "stopOnError": bool, "transform": ...}
        #[arg(long)]
        file: PathBuf,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Inspect or reset ability health.
    Health {
        #[command(subcommand)]
        action: HealthCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum CredentialCommand {
    /// Encrypt a secret locally and store it.
    Add {
        #[arg(long)]
        owner: String,

        /// Domain the credential applies to (e.g., "api.github.com").
        #[arg(long)]
        domain: String,

        /// Where it is injected: header, cookie, query or body.
        #[arg(long = "type", default_value = "header")]
        credential_type: CredentialType,

        /// Header, cookie, query or body field name.
        #[arg(long)]
        name: String,

        /// The secret value.
        /// For production use, prefer an environment variable to avoid shell history exposure.
        #[arg(long, env = "CONDUIT_SECRET", hide_env_values = true)]
        secret: String,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// List an owner's credentials (metadata only).
    List {
        #[arg(long)]
        owner: String,
    },

    /// Delete a credential.
    Delete {
        #[arg(long)]
        owner: String,

        id: String,
    },

    /// Show the access log of a credential.
    Audit {
        #[arg(long)]
        owner: String,

        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum AbilityCommand {
    /// Register an HTTP ability from a JSON file.
    Register {
        #[arg(long)]
        owner: String,

        /// JSON file: {"name", "template", "dynamicHeaderKeys", ...}
        #[arg(long)]
        file: PathBuf,
    },

    /// List an owner's abilities.
    List {
        #[arg(long)]
        owner: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum HealthCommand {
    /// Show health and recent snapshots.
    Show { ability_id: String },

    /// Clear health back to defaults.
    Reset { ability_id: String },
}

/// Where the decryption key comes from.
#[derive(Args, Debug, Default)]
pub struct KeyArgs {
    /// Decryption key as 64 hex chars or base64.
    #[arg(long, env = "CONDUIT_KEY", hide_env_values = true, conflicts_with = "passphrase")]
    pub key: Option<String>,

    /// Derive the key from a passphrase (salted with --owner).
    #[arg(long, env = "CONDUIT_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,
}
