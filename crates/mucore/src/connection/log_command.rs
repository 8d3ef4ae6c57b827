//! `/log` 命令

use std::path::{Path, PathBuf};

/// 解析後的 `/log` 命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogCommand {
    /// `log <file>`
    Open(String),
    /// `log --off <file>`
    Off(String),
    /// `log --list`
    List,
    /// `log`、`log --help`
    Help,
    /// 未知的開關
    Unknown(String),
}

impl LogCommand {
    /// 由 `log` builtin 切好的 payload 解析
    pub fn parse(payload: &[String]) -> Self {
        let Some(first) = payload.first().filter(|s| !s.is_empty()) else {
            return Self::Help;
        };
        match first.as_str() {
            "--help" => Self::Help,
            "--list" => Self::List,
            "--off" => match payload.get(1) {
                Some(name) => Self::Off(name.clone()),
                None => Self::Help,
            },
            flag if flag.starts_with("--") => Self::Unknown(flag.to_string()),
            name => Self::Open(name.to_string()),
        }
    }
}

/// 相對路徑放在該連線的日誌目錄下
pub fn resolve_log_path(log_dir: &Path, name: &str) -> PathBuf {
    let path = Path::new(name);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        log_dir.join(path)
    }
}

/// `--list` 顯示的內容
pub fn list_text(display_name: &str, logs: &[String]) -> String {
    let body = if logs.is_empty() {
        "(none)".to_string()
    } else {
        logs.iter()
            .map(|name| format!("* {}", name))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!("Open logs for {}::\n{}", display_name, body)
}
