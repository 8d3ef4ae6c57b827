//! World、Server 與 ServerType 設定

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_buffer() -> usize {
    5000
}

/// 角色與伺服器的結合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct World {
    /// 設定檔中的鍵，載入後自動填入
    #[serde(skip)]
    pub name: String,
    pub display_name: String,
    pub server: String,
    pub username: String,
    pub password: String,
    /// 是否保留每次連線的輪替日誌
    pub log: bool,
}

impl World {
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            server: server.into(),
            ..Default::default()
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// 遠端伺服器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    #[serde(skip)]
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    /// 信任自簽憑證
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, alias = "type")]
    pub server_type: String,
    /// 伺服器字元編碼標籤
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// 連線後送出 `CHARSET unicode` 宣告
    #[serde(default = "default_true")]
    pub announce_charset: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// 前端回捲緩衝區行數
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
}

impl Server {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            ssl: false,
            insecure: false,
            server_type: String::new(),
            encoding: default_encoding(),
            announce_charset: true,
            connect_timeout_secs: default_connect_timeout(),
            max_buffer: default_max_buffer(),
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 伺服器類型（MUCK、MUSH...），決定登入與登出字串
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerType {
    #[serde(skip)]
    pub name: String,
    /// 可含 `$username`、`$password`
    pub connect_string: String,
    pub disconnect_string: Option<String>,
}

impl ServerType {
    /// 代入帳號密碼；不做任何跳脫
    pub fn connect_line(&self, world: &World) -> String {
        self.connect_string
            .replace("$username", &world.username)
            .replace("$password", &world.password)
    }
}
