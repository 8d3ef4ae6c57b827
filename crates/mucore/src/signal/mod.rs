//! Signal 分派模組
//!
//! 將使用者或外部工具輸入的自由文字命令轉為結構化的 `Signal`，
//! 並廣播給所有已註冊的監聽者（連線、Session 管理、UI）。

mod builtins;
mod dispatcher;

use thiserror::Error;

pub use builtins::{Builtin, Builtins, Rejected};
pub use dispatcher::{Dispatcher, DELIVERY_TIMEOUT, LISTENER_QUEUE};

/// Signal 錯誤
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("未知的命令 {0}")]
    UnknownCommand(String),

    #[error("參數數量錯誤: 需要 {expected} 個 ({usage})，實際 {actual} 個")]
    Arity {
        expected: usize,
        actual: usize,
        usage: &'static str,
    },

    /// 其他子系統處理後附上的錯誤（例如連線失敗）
    #[error("{0}")]
    Relayed(String),
}

/// 結構化事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// 命令名稱
    pub name: String,
    /// 有序的字串內容
    pub payload: Vec<String>,
    /// 解析或處理時的錯誤
    pub err: Option<SignalError>,
    /// 來源連線名稱；由連線的交接檔送出的命令會帶上
    pub origin: Option<String>,
}

impl Signal {
    pub fn new(name: impl Into<String>, payload: Vec<String>) -> Self {
        Self {
            name: name.into(),
            payload,
            err: None,
            origin: None,
        }
    }

    pub fn with_err(mut self, err: Option<SignalError>) -> Self {
        self.err = err;
        self
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    /// payload 第一個元素
    pub fn first(&self) -> Option<&str> {
        self.payload.first().map(String::as_str)
    }
}
