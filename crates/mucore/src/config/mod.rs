//! 設定模組
//!
//! 所有設定都是 JSON：
//! - `server_types`: 伺服器類型與登入字串
//! - `servers`: 主機、連接埠、TLS
//! - `worlds`: 角色與帳號
//! - `triggers`: 依序套用的觸發器
//! - `client`: 日誌與系統日誌偏好
//!
//! 可由多個檔案合併，載入後一次驗證並回報所有錯誤。

mod world;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::trigger::{CompiledTrigger, TriggerConfig, TriggerError};

pub use world::{Server, ServerType, World};

/// 設定錯誤
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("無法讀取設定檔 {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("無法解析設定檔 {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("沒有設定 version，可能未載入任何全域設定")]
    MissingVersion,

    #[error("world {world} 指向未知的 server {server}")]
    UnknownServer { world: String, server: String },

    #[error("server {server} 指向未知的 server type {server_type}")]
    UnknownServerType { server: String, server_type: String },

    #[error("server {server} 使用未知的編碼 {encoding}")]
    UnknownEncoding { server: String, encoding: String },

    #[error("無效的時間格式 {0}")]
    InvalidTimeFormat(String),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error("設定驗證失敗: {}", join_errors(.0))]
    Invalid(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// 目錄
// ============================================================================

/// 程式使用的目錄，啟動時決定一次後傳遞
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dirs {
    pub home: PathBuf,
    pub config: PathBuf,
    /// 每個連線的交接檔與暫存輸出
    pub working: PathBuf,
    /// 輪替後的日誌
    pub log: PathBuf,
}

impl Dirs {
    /// 依平台慣例決定目錄
    pub fn discover() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data = dirs::data_local_dir().unwrap_or_else(|| home.join(".local").join("share"));
        let config = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
        Self {
            working: data.join("mucli"),
            log: data.join("mucli").join("logs"),
            config: config.join("mucli"),
            home,
        }
    }

    /// 全部放在同一個根目錄下
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            home: root.to_path_buf(),
            config: root.join("config"),
            working: root.join("worlds"),
            log: root.join("logs"),
        }
    }
}

// ============================================================================
// 客戶端偏好
// ============================================================================

fn default_time_string() -> String {
    "%Y-%m-%dT%H-%M-%S".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// chrono strftime 格式，用於日誌檔名與斷線訊息
    pub time_string: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            time_string: default_time_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Syslog {
    pub show_syslog: bool,
    pub log_level: String,
}

impl Default for Syslog {
    fn default() -> Self {
        Self {
            show_syslog: false,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub logging: Logging,
    pub syslog: Syslog,
}

// ============================================================================
// 設定
// ============================================================================

/// 完整設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,
    pub server_types: HashMap<String, ServerType>,
    pub servers: HashMap<String, Server>,
    pub worlds: HashMap<String, World>,
    pub triggers: Vec<TriggerConfig>,
    pub client: ClientSettings,

    /// 驗證時編譯，順序與 `triggers` 相同
    #[serde(skip)]
    pub compiled_triggers: Vec<CompiledTrigger>,
    #[serde(skip)]
    pub dirs: Dirs,
}

/// 單一檔案的內容；未出現的 `client` 不覆蓋前面的設定
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    version: Option<u32>,
    server_types: HashMap<String, ServerType>,
    servers: HashMap<String, Server>,
    worlds: HashMap<String, World>,
    triggers: Vec<TriggerConfig>,
    client: Option<ClientSettings>,
}

impl Config {
    /// 依序讀取並合併設定檔，然後驗證
    ///
    /// 後面的檔案覆蓋同名的 world/server/server type，觸發器則累加
    pub fn load<P: AsRef<Path>>(paths: &[P], dirs: Dirs) -> Result<Self, ConfigError> {
        let mut config = Config {
            dirs,
            ..Default::default()
        };
        for path in paths {
            config.merge_file(path.as_ref())?;
        }
        config.finalize_and_validate()?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        trace!("載入設定檔 {:?}", path);
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if let Some(version) = file.version {
            self.version = version;
        }
        self.server_types.extend(file.server_types);
        self.servers.extend(file.servers);
        self.worlds.extend(file.worlds);
        self.triggers.extend(file.triggers);
        if let Some(client) = file.client {
            self.client = client;
        }
        Ok(())
    }

    /// 填入名稱、檢查參照並編譯觸發器；回傳全部錯誤
    pub fn finalize_and_validate(&mut self) -> Result<(), ConfigError> {
        debug!("驗證設定");
        let mut errors = Vec::new();

        if self.version == 0 {
            errors.push(ConfigError::MissingVersion);
        }

        for (name, world) in self.worlds.iter_mut() {
            world.name = name.clone();
            if world.display_name.is_empty() {
                world.display_name = name.clone();
            }
            if !self.servers.contains_key(&world.server) {
                errors.push(ConfigError::UnknownServer {
                    world: name.clone(),
                    server: world.server.clone(),
                });
            }
        }

        for (name, server) in self.servers.iter_mut() {
            server.name = name.clone();
            if !server.server_type.is_empty() && !self.server_types.contains_key(&server.server_type)
            {
                errors.push(ConfigError::UnknownServerType {
                    server: name.clone(),
                    server_type: server.server_type.clone(),
                });
            }
            if crate::encoding::resolve(&server.encoding).is_none() {
                errors.push(ConfigError::UnknownEncoding {
                    server: name.clone(),
                    encoding: server.encoding.clone(),
                });
            }
        }

        for (name, server_type) in self.server_types.iter_mut() {
            server_type.name = name.clone();
        }

        if StrftimeItems::new(&self.client.logging.time_string).any(|item| item == Item::Error) {
            errors.push(ConfigError::InvalidTimeFormat(
                self.client.logging.time_string.clone(),
            ));
        }

        self.compiled_triggers.clear();
        for trigger in &self.triggers {
            match trigger.compile() {
                Ok(compiled) => self.compiled_triggers.push(compiled),
                Err(e) => errors.push(e.into()),
            }
        }

        if errors.is_empty() {
            debug!(
                "設定有效: {} worlds, {} servers, {} triggers",
                self.worlds.len(),
                self.servers.len(),
                self.compiled_triggers.len()
            );
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// 伺服器所屬的類型
    pub fn server_type(&self, server: &Server) -> Option<&ServerType> {
        self.server_types.get(&server.server_type)
    }

    /// 依設定的格式產生目前時間字串
    pub fn timestamp(&self) -> String {
        format_timestamp(&self.client.logging.time_string)
    }
}

/// 以 strftime 格式產生目前時間；格式無效時改用 RFC 3339
pub fn format_timestamp(format: &str) -> String {
    use std::fmt::Write;

    let now = chrono::Local::now();
    let mut out = String::new();
    if write!(out, "{}", now.format(format)).is_err() {
        return now.to_rfc3339();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn stub_config() -> Config {
        serde_json::from_str(
            r#"{
                "version": 1,
                "server_types": {
                    "stubtype": {
                        "connect_string": "connect $username $password",
                        "disconnect_string": "QUIT"
                    }
                },
                "servers": {
                    "stubserver": {
                        "host": "example.com",
                        "port": 12345,
                        "server_type": "stubtype"
                    }
                },
                "worlds": {
                    "stubworld": {
                        "display_name": "TARDIS",
                        "server": "stubserver",
                        "username": "user",
                        "password": "pass"
                    }
                },
                "triggers": [
                    {"type": "hilite", "matches": ["(?i)(the )?doctor", "(?i)rose( tyler)?"], "attributes": "bold"},
                    {"type": "gag", "match": "bad-wolf"},
                    {"type": "macro", "match": "Mickey Smith"},
                    {"type": "script", "match": "Donna Noble"}
                ]
            }"#,
        )
        .unwrap()
    }

    fn invalid(config: &mut Config) -> Vec<String> {
        match config.finalize_and_validate() {
            Err(ConfigError::Invalid(errors)) => errors.iter().map(|e| e.to_string()).collect(),
            other => panic!("預期驗證失敗，得到 {:?}", other),
        }
    }

    #[test]
    fn test_valid_config_sets_names_and_compiles() {
        let mut config = stub_config();
        config.finalize_and_validate().unwrap();
        assert_eq!(config.worlds["stubworld"].name, "stubworld");
        assert_eq!(config.servers["stubserver"].name, "stubserver");
        assert_eq!(config.server_types["stubtype"].name, "stubtype");
        assert_eq!(config.compiled_triggers.len(), 4);
    }

    #[test]
    fn test_requires_version() {
        let mut config = stub_config();
        config.version = 0;
        let errors = invalid(&mut config);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            config.finalize_and_validate(),
            Err(ConfigError::Invalid(ref e)) if matches!(e[0], ConfigError::MissingVersion)
        ));
    }

    #[test]
    fn test_world_unknown_server() {
        let mut config = stub_config();
        config.worlds.get_mut("stubworld").unwrap().server = "bad-wolf".to_string();
        let errors = invalid(&mut config);
        assert_eq!(errors, vec!["world stubworld 指向未知的 server bad-wolf"]);
    }

    #[test]
    fn test_server_unknown_type() {
        let mut config = stub_config();
        config.servers.get_mut("stubserver").unwrap().server_type = "bad-wolf".to_string();
        let errors = invalid(&mut config);
        assert_eq!(errors, vec!["server stubserver 指向未知的 server type bad-wolf"]);
    }

    #[test]
    fn test_all_errors_reported_together() {
        let mut config = stub_config();
        config.version = 0;
        config.worlds.get_mut("stubworld").unwrap().server = "bad-wolf".to_string();
        config.triggers.push(TriggerConfig {
            kind: "bad-wolf".to_string(),
            pattern: "x".to_string(),
            ..Default::default()
        });
        let errors = invalid(&mut config);
        assert_eq!(errors.len(), 3);
        assert_eq!(config.compiled_triggers.len(), 4);
    }

    #[test]
    fn test_unknown_encoding() {
        let mut config = stub_config();
        config.servers.get_mut("stubserver").unwrap().encoding = "klingon".to_string();
        let errors = invalid(&mut config);
        assert_eq!(errors, vec!["server stubserver 使用未知的編碼 klingon"]);
    }

    #[test]
    fn test_invalid_time_format() {
        let mut config = stub_config();
        config.client.logging.time_string = "%Q".to_string();
        let errors = invalid(&mut config);
        assert_eq!(errors, vec!["無效的時間格式 %Q"]);
    }

    #[test]
    fn test_load_merges_files() {
        let mut base = NamedTempFile::new().unwrap();
        write!(
            base,
            r#"{{
                "version": 1,
                "servers": {{"gallifrey": {{"host": "localhost", "port": 4201}}}},
                "worlds": {{"tardis": {{"server": "gallifrey"}}}},
                "triggers": [{{"type": "gag", "match": "bad-wolf"}}],
                "client": {{"syslog": {{"log_level": "debug"}}}}
            }}"#
        )
        .unwrap();
        let mut local = NamedTempFile::new().unwrap();
        write!(
            local,
            r#"{{
                "worlds": {{"tardis": {{"server": "gallifrey", "display_name": "TARDIS", "log": true}}}},
                "triggers": [{{"type": "hilite", "match": "Doctor", "attributes": "bold"}}]
            }}"#
        )
        .unwrap();

        let dirs = Dirs::under("/tmp/mucli-test");
        let config = Config::load(&[base.path(), local.path()], dirs.clone()).unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.worlds["tardis"].display_name, "TARDIS");
        assert!(config.worlds["tardis"].log);
        assert_eq!(config.compiled_triggers.len(), 2);
        assert_eq!(config.client.syslog.log_level, "debug");
        assert_eq!(config.client.logging.time_string, "%Y-%m-%dT%H-%M-%S");
        assert_eq!(config.dirs, dirs);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(&["/nonexistent/mucli.json"], Dirs::default());
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp("%Y").len(), 4);
        assert!(format_timestamp("%Q").contains('T'));
    }

    #[test]
    fn test_dirs_under() {
        let dirs = Dirs::under("/home/rose");
        assert_eq!(dirs.working, PathBuf::from("/home/rose/worlds"));
        assert_eq!(dirs.log, PathBuf::from("/home/rose/logs"));
    }
}
