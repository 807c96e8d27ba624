//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::go_duration;

/// Directory under `data_path` holding logs, caches and spools
pub const DEFAULT_TMP_PATH: &str = "tmp";
/// Upload cache directory under the tmp tree
pub const UPLOAD_PATH: &str = "upload";
/// Directory under `data_path` scanned for plugin executables
pub const PLUGIN_PATH: &str = "plugins";

/// Root of the YAML config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub db: DbConfig,
    pub app: AppConfig,
}

/// Database section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// `sqlite` or `mysql`
    pub driver: String,
    pub user: String,
    pub password: String,
    pub dsn: String,
    pub db_name: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            user: String::new(),
            password: String::new(),
            dsn: String::new(),
            db_name: "oms".to_string(),
        }
    }
}

/// Run mode, picks the default log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Dev,
    #[default]
    Release,
}

/// Application section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    /// HTTP bind address
    pub addr: String,
    /// HTTP port
    pub port: u16,
    pub mode: RunMode,
    /// Start persisted jobs and tunnels on boot
    pub run_start: bool,
    /// Root for the database file and the tmp tree
    pub data_path: PathBuf,
    /// Retention window for job run history
    #[serde(with = "go_duration")]
    pub temp_date: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "oms".to_string(),
            addr: "0.0.0.0".to_string(),
            port: 9090,
            mode: RunMode::Release,
            run_start: true,
            data_path: PathBuf::from("data"),
            temp_date: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl ServerConfig {
    /// HTTP listen address
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.app.addr, self.app.port)
    }

    /// `<data_path>/tmp`
    pub fn tmp_path(&self) -> PathBuf {
        self.app.data_path.join(DEFAULT_TMP_PATH)
    }

    /// `<data_path>/tmp/upload`
    pub fn upload_path(&self) -> PathBuf {
        self.tmp_path().join(UPLOAD_PATH)
    }

    /// `<data_path>/plugins`
    pub fn plugin_path(&self) -> PathBuf {
        self.app.data_path.join(PLUGIN_PATH)
    }

    /// SQLite database file, `<data_path>/<db_name>.db`
    pub fn sqlite_path(&self) -> PathBuf {
        let name = if self.db.db_name.is_empty() {
            "oms"
        } else {
            self.db.db_name.as_str()
        };
        self.app.data_path.join(format!("{name}.db"))
    }

    /// Default tracing filter for the configured run mode
    pub fn default_log_level(&self) -> &'static str {
        match self.app.mode {
            RunMode::Dev => "debug",
            RunMode::Release => "info",
        }
    }
}
