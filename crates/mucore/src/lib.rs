//! MU* Core Library
//!
//! 提供 MU* 客戶端的核心功能：
//! - `connection`: 連線、交接檔與輸出
//! - `client`: 依名稱管理所有連線
//! - `signal`: 命令解析與 signal 廣播
//! - `trigger`: 觸發器（hilite / gag）
//! - `config`: 設定檔載入與驗證
//! - `encoding`: 伺服器編碼轉換
//! - `ansi`: ANSI 屬性與去除
//! - `buffer`: 顯示用的行緩衝區

pub mod ansi;
pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod encoding;
pub mod signal;
pub mod trigger;

pub use buffer::{Buffer, SharedBuffer};
pub use client::{Client, ClientError};
pub use config::{Config, ConfigError, Dirs, Server, ServerType, World};
pub use connection::{Connection, ConnectionError, Sink};
pub use signal::{Builtins, Dispatcher, Signal, SignalError};
pub use trigger::{CompiledTrigger, TriggerConfig, TriggerError, TriggerKind};
