//! Connection configuration.
//!
//! Values come from a TOML file and are then overridden by command-line
//! flags or environment variables:
//!
//! ```toml
//! [connection]
//! host = "localhost"
//! port = 5432
//! user = "postgres"
//! database = "postgres"
//! password = "secret"
//! default_query = "SELECT * FROM users;"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PgError, PgResult};
use crate::protocol::framing::DEFAULT_MAX_FRAME_LEN;

/// Local config file name, looked up in the working directory.
pub const LOCAL_CONFIG: &str = "pgwire.toml";

/// Parameters for a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub password: Option<String>,
    pub application_name: Option<String>,
    /// Sent when the user submits an empty command.
    pub default_query: String,
    pub connect_timeout_ms: u64,
    /// Upper bound for a single read; `None` waits until the server closes.
    pub read_timeout_ms: Option<u64>,
    pub max_frame_len: usize,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            database: "postgres".to_string(),
            password: None,
            application_name: None,
            default_query: "SELECT * FROM users;".to_string(),
            connect_timeout_ms: 10_000,
            read_timeout_ms: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    connection: ConnectConfig,
}

impl ConnectConfig {
    /// Parse the `[connection]` table of a TOML document.
    pub fn from_toml(content: &str) -> PgResult<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| PgError::Config(e.to_string()))?;
        file.connection.validate()
    }

    /// Load from an explicit path.
    pub fn from_file(path: &Path) -> PgResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PgError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from `path` if given, else the first existing default location,
    /// else built-in defaults.
    pub fn load(path: Option<&Path>) -> PgResult<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match default_locations().into_iter().find(|p| p.exists()) {
            Some(found) => {
                tracing::debug!(path = %found.display(), "loading config");
                Self::from_file(&found)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    /// Reject values the protocol cannot carry.
    pub fn validate(self) -> PgResult<Self> {
        if self.user.is_empty() {
            return Err(PgError::Config("user must not be empty".to_string()));
        }
        let fields = [
            ("user", Some(&self.user)),
            ("database", Some(&self.database)),
            ("application_name", self.application_name.as_ref()),
            ("default_query", Some(&self.default_query)),
        ];
        for (name, value) in fields {
            if value.is_some_and(|v| v.contains('\0')) {
                return Err(PgError::Config(format!("{} contains a NUL byte", name)));
            }
        }
        if self.max_frame_len < 5 {
            return Err(PgError::Config("max_frame_len must be at least 5".to_string()));
        }
        Ok(self)
    }
}

/// `./pgwire.toml`, then `<config dir>/pgwire-lite/config.toml`.
fn default_locations() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("pgwire-lite").join("config.toml"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectConfig::default();
        assert_eq!(config.address(), "localhost:5432");
        assert_eq!(config.default_query, "SELECT * FROM users;");
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ConnectConfig::from_toml(
            r#"
            [connection]
            user = "alice"
            database = "inventory"
            port = 6543
            "#,
        )
        .unwrap();
        assert_eq!(config.user, "alice");
        assert_eq!(config.port, 6543);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.password, None);
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(ConnectConfig::from_toml("").unwrap(), ConnectConfig::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ConnectConfig::from_toml("[connection]\nport = \"x\"").is_err());
        assert!(ConnectConfig::from_toml("[connection]\nuser = \"\"").is_err());
        assert!(ConnectConfig::from_toml("[connection]\ndatabase = \"a\\u0000b\"").is_err());
    }
}
