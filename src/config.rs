// Conduit — Runtime settings
//
// Paths and timeouts come from CLI flags, which clap also fills from the
// CONDUIT_* environment variables. Anything left unset falls back to the
// platform data directory and the per-user runtime directory.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConduitError;
use crate::sandbox::ReqwestTransport;
use crate::store::Database;

pub const ENV_DATA_DIR: &str = "CONDUIT_DATA_DIR";
pub const ENV_SOCKET: &str = "CONDUIT_SOCKET";
pub const ENV_HTTP_TIMEOUT: &str = "CONDUIT_HTTP_TIMEOUT_SECS";

const DB_FILE: &str = "conduit.db";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub http_timeout: Duration,
}

impl Settings {
    /// Fill unset values with defaults.
    pub fn resolve(
        data_dir: Option<PathBuf>,
        socket_path: Option<PathBuf>,
        http_timeout_secs: Option<u64>,
    ) -> Result<Self, ConduitError> {
        let timeout = http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        if timeout == 0 {
            return Err(ConduitError::Config(format!(
                "{} must be greater than zero",
                ENV_HTTP_TIMEOUT
            )));
        }

        Ok(Self {
            data_dir: data_dir.unwrap_or_else(Self::default_data_dir),
            socket_path: socket_path.unwrap_or_else(Self::default_socket_path),
            http_timeout: Duration::from_secs(timeout),
        })
    }

    /// `<platform data dir>/conduit`
    pub fn default_data_dir() -> PathBuf {
        dirs_next::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("conduit")
    }

    /// `$XDG_RUNTIME_DIR/conduit/conduit.sock`, falling back to `/tmp`.
    pub fn default_socket_path() -> PathBuf {
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        runtime_dir.join("conduit").join("conduit.sock")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    /// Open (creating if needed) the database under the data dir.
    pub fn open_database(&self) -> Result<Database, ConduitError> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(Database::open(&self.db_path())?)
    }

    pub fn transport(&self) -> Result<ReqwestTransport, ConduitError> {
        Ok(ReqwestTransport::new(self.http_timeout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(None, None, None).unwrap();
        assert!(settings.data_dir.ends_with("conduit"));
        assert!(settings.socket_path.ends_with("conduit/conduit.sock"));
        assert_eq!(settings.http_timeout, Duration::from_secs(30));
        assert!(settings.db_path().ends_with("conduit.db"));
    }

    #[test]
    fn test_overrides_win() {
        let settings = Settings::resolve(
            Some(PathBuf::from("/srv/conduit")),
            Some(PathBuf::from("/run/c.sock")),
            Some(5),
        )
        .unwrap();
        assert_eq!(settings.db_path(), PathBuf::from("/srv/conduit/conduit.db"));
        assert_eq!(settings.socket_path, PathBuf::from("/run/c.sock"));
        assert_eq!(settings.http_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(matches!(
            Settings::resolve(None, None, Some(0)),
            Err(ConduitError::Config(_))
        ));
    }

    #[test]
    fn test_open_database_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested").join("data");
        let settings = Settings::resolve(Some(data_dir.clone()), None, None).unwrap();

        settings.open_database().unwrap();
        assert!(data_dir.join("conduit.db").exists());
    }
}
