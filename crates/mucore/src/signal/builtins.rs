//! 內建命令表
//!
//! 每個內建命令有自己的小文法，把參數字串轉為 payload。

use std::collections::HashMap;

use tracing::{debug, error, info, trace, warn};

use super::SignalError;

/// 解析失敗時仍保留已切好的部分，監聽者收到的就是這份 payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub payload: Vec<String>,
    pub err: SignalError,
}

/// 內建命令解析器
pub type Builtin = fn(&str) -> Result<Vec<String>, Rejected>;

/// 命令名稱到解析器的對照表
///
/// 於程式啟動時建立一次，交給 `Dispatcher` 持有
#[derive(Clone)]
pub struct Builtins {
    table: HashMap<String, Builtin>,
}

impl std::fmt::Debug for Builtins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.table.keys().collect();
        names.sort();
        f.debug_struct("Builtins").field("names", &names).finish()
    }
}

impl Builtins {
    /// 空的命令表
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// 新增或取代一個命令
    pub fn insert(&mut self, name: impl Into<String>, builtin: Builtin) {
        self.table.insert(name.into(), builtin);
    }

    pub fn get(&self, name: &str) -> Option<Builtin> {
        self.table.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for Builtins {
    fn default() -> Self {
        let mut builtins = Self::empty();

        // 世界切換
        builtins.insert("fg", fg);
        builtins.insert(">", |_| fg(">"));
        builtins.insert("<", |_| fg("<"));

        // 連線
        for name in ["connect", "c", "disconnect", "dc", "quit"] {
            builtins.insert(name, passthrough);
        }

        // 日誌、說明、重新載入
        builtins.insert("log", parts_passthrough);
        builtins.insert("help", passthrough);
        builtins.insert("reload", passthrough);

        // 內部事件
        builtins.insert("syslog", syslog);
        builtins.insert("_", passthrough);
        builtins.insert("_util:split", split);
        for name in [
            "_client:connected",
            "_client:disconnected",
            "_client:allDisconnected",
            "_client:connect",
            "_client:disconnect",
            "_client:removeWorld",
            "_client:quitReady",
        ] {
            builtins.insert(name, passthrough);
        }
        builtins.insert("_client:showModal", title_split);

        builtins
    }
}

/// `fg`：`<` 往前輪替，`>` 或空白往後輪替，其他則切換到指定名稱
fn fg(args: &str) -> Result<Vec<String>, Rejected> {
    let target = args.split_whitespace().next().unwrap_or("");
    let payload = match target {
        "<" => vec!["rotate".to_string(), "-1".to_string()],
        ">" | "" => vec!["rotate".to_string(), "1".to_string()],
        name => vec!["switch".to_string(), name.to_string()],
    };
    Ok(payload)
}

/// `syslog <level> <message>`：以指定層級寫入系統日誌
fn syslog(args: &str) -> Result<Vec<String>, Rejected> {
    let parts: Vec<String> = match args.split_once(char::is_whitespace) {
        Some((level, message)) => vec![level.to_string(), message.trim_start().to_string()],
        None => vec![args.to_string()],
    };
    if parts.len() != 2 {
        return Err(Rejected {
            err: SignalError::Arity {
                expected: 2,
                actual: parts.len(),
                usage: "level, log string",
            },
            payload: parts,
        });
    }

    let message = &parts[1];
    match parts[0].to_ascii_lowercase().as_str() {
        "trace" => trace!("Syslog macro: {}", message),
        "debug" => debug!("Syslog macro: {}", message),
        "warn" | "warning" => warn!("Syslog macro: {}", message),
        "error" | "critical" => error!("Syslog macro: {}", message),
        _ => info!("Syslog macro: {}", message),
    }
    Ok(parts)
}

/// 以 `"::\n"` 分隔標題與內容
fn title_split(args: &str) -> Result<Vec<String>, Rejected> {
    Ok(args.split("::\n").map(str::to_string).collect())
}

/// 原樣傳遞；空字串得到空的 payload
fn passthrough(args: &str) -> Result<Vec<String>, Rejected> {
    if args.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![args.to_string()])
}

/// 以空白切開後傳遞
fn parts_passthrough(args: &str) -> Result<Vec<String>, Rejected> {
    Ok(args.split_whitespace().map(str::to_string).collect())
}

/// 以第一個字元作為分隔符切開其餘部分
fn split(args: &str) -> Result<Vec<String>, Rejected> {
    let mut chars = args.chars();
    let Some(sep) = chars.next() else {
        return Ok(Vec::new());
    };
    Ok(chars.as_str().split(sep).map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fg() {
        assert_eq!(fg("<").unwrap(), strings(&["rotate", "-1"]));
        assert_eq!(fg(">").unwrap(), strings(&["rotate", "1"]));
        assert_eq!(fg("").unwrap(), strings(&["rotate", "1"]));
        assert_eq!(fg("rose_tyler").unwrap(), strings(&["switch", "rose_tyler"]));
        assert_eq!(fg("rose tyler").unwrap(), strings(&["switch", "rose"]));
    }

    #[test]
    fn test_arrow_aliases() {
        let builtins = Builtins::default();
        assert_eq!(builtins.get("<").unwrap()("").unwrap(), strings(&["rotate", "-1"]));
        assert_eq!(builtins.get(">").unwrap()("x").unwrap(), strings(&["rotate", "1"]));
    }

    #[test]
    fn test_syslog() {
        assert_eq!(
            syslog("info hello there").unwrap(),
            strings(&["info", "hello there"])
        );
        assert_eq!(
            syslog("warning \t  two  spaces").unwrap(),
            strings(&["warning", "two  spaces"])
        );
        let rejected = syslog("info").unwrap_err();
        assert_eq!(rejected.payload, strings(&["info"]));
        assert_eq!(
            rejected.err,
            SignalError::Arity {
                expected: 2,
                actual: 1,
                usage: "level, log string"
            }
        );
        assert_eq!(syslog("").unwrap_err().payload, strings(&[""]));
    }

    #[test]
    fn test_passthrough() {
        assert_eq!(passthrough("rose tyler").unwrap(), strings(&["rose tyler"]));
        assert!(passthrough("").unwrap().is_empty());
    }

    #[test]
    fn test_parts_and_split() {
        assert_eq!(parts_passthrough("--off  foo.log").unwrap(), strings(&["--off", "foo.log"]));
        assert_eq!(split(",a,b,c").unwrap(), strings(&["a", "b", "c"]));
        assert!(split("").unwrap().is_empty());
    }

    #[test]
    fn test_title_split() {
        assert_eq!(
            title_split("Open logs::\n* a").unwrap(),
            strings(&["Open logs", "* a"])
        );
    }
}
