//! Trigger（觸發器）模組
//!
//! 以正則表達式比對伺服器送來的每一行，並依類型轉換：
//! - `hilite`: 以 ANSI 屬性包住匹配的片段
//! - `gag`: 回報匹配，由呼叫端決定抑制輸出
//! - `script` / `macro`: 保留介面，目前回傳 `NotImplemented`
//!
//! 觸發器依設定順序形成管線，每個觸發器看到的是前一個的輸出。

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

use crate::ansi::{active_codes_at, Attributes};

/// 觸發器錯誤
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("未知的觸發器類型 {0}")]
    UnknownType(String),

    #[error("觸發器 {0} 沒有任何匹配模式")]
    NoMatches(String),

    #[error("觸發器 {name} 的正則表達式無效: {message}")]
    InvalidPattern { name: String, message: String },

    #[error("觸發器 {name} 的屬性無效: {message}")]
    InvalidAttribute { name: String, message: String },

    #[error("尚未實作: {0} 觸發器")]
    NotImplemented(TriggerKind),
}

/// 觸發器類型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Hilite,
    Gag,
    Script,
    Macro,
}

impl FromStr for TriggerKind {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hilite" => Ok(Self::Hilite),
            "gag" => Ok(Self::Gag),
            "script" => Ok(Self::Script),
            "macro" => Ok(Self::Macro),
            other => Err(TriggerError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hilite => "hilite",
            Self::Gag => "gag",
            Self::Script => "script",
            Self::Macro => "macro",
        })
    }
}

/// 觸發器設定（可序列化版本）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub name: String,
    /// hilite、gag、script、macro；未知值在編譯時拒絕
    #[serde(rename = "type")]
    pub kind: String,
    /// 單一匹配模式
    #[serde(rename = "match")]
    pub pattern: String,
    /// 多個匹配模式，與 `match` 合併
    pub matches: Vec<String>,
    /// hilite 使用的屬性，如 `bold+cyan`
    pub attributes: String,
    /// gag 時仍寫入全域日誌
    pub log_anyway: bool,
    pub script: String,
    pub output_to_world: bool,
    #[serde(rename = "macro")]
    pub macro_name: String,
}

impl TriggerConfig {
    /// 編譯觸發器
    ///
    /// 類型未知、沒有任何模式、正則無效或 hilite 屬性無效時失敗
    pub fn compile(&self) -> Result<CompiledTrigger, TriggerError> {
        let kind: TriggerKind = self.kind.parse()?;

        let mut sources = self.matches.clone();
        if !self.pattern.is_empty() {
            sources.push(self.pattern.clone());
        }
        sources.retain(|s| !s.is_empty());

        let name = if self.name.is_empty() {
            format!("{}:{}", kind, sources.join("|"))
        } else {
            self.name.clone()
        };

        if sources.is_empty() {
            return Err(TriggerError::NoMatches(name));
        }

        let patterns = sources
            .iter()
            .map(|s| {
                Regex::new(s).map_err(|e| TriggerError::InvalidPattern {
                    name: name.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let attributes = match kind {
            TriggerKind::Hilite => Some(Attributes::parse(&self.attributes).map_err(|message| {
                TriggerError::InvalidAttribute {
                    name: name.clone(),
                    message,
                }
            })?),
            _ => None,
        };

        Ok(CompiledTrigger {
            name,
            kind,
            patterns,
            attributes,
            log_anyway: self.log_anyway,
            script: self.script.clone(),
            macro_name: self.macro_name.clone(),
        })
    }
}

/// 單一觸發器的執行結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRun {
    pub applied: bool,
    pub line: String,
    pub errors: Vec<TriggerError>,
}

/// 編譯後的觸發器，至少含有一個有效的正則
#[derive(Debug, Clone)]
pub struct CompiledTrigger {
    pub name: String,
    pub kind: TriggerKind,
    patterns: Vec<Regex>,
    attributes: Option<Attributes>,
    pub log_anyway: bool,
    pub script: String,
    pub macro_name: String,
}

impl CompiledTrigger {
    /// 對一行執行觸發器
    ///
    /// 每個模式依序作用在前一個模式的輸出上。gag 在第一次匹配時立即回傳原行。
    pub fn run(&self, input: &str) -> TriggerRun {
        trace!("執行觸發器 {}", self.name);
        let mut line = input.to_string();
        let mut applied = false;
        let mut errors = Vec::new();

        for re in &self.patterns {
            let spans: Vec<(usize, usize)> =
                re.find_iter(&line).map(|m| (m.start(), m.end())).collect();
            if spans.is_empty() {
                continue;
            }
            applied = true;

            match self.kind {
                TriggerKind::Hilite => {
                    if let Some(attrs) = &self.attributes {
                        line = hilite(&line, &spans, attrs);
                    }
                }
                TriggerKind::Gag => {
                    return TriggerRun {
                        applied: true,
                        line,
                        errors: Vec::new(),
                    };
                }
                TriggerKind::Script | TriggerKind::Macro => {
                    errors.push(TriggerError::NotImplemented(self.kind));
                }
            }
        }

        TriggerRun {
            applied,
            line,
            errors,
        }
    }
}

/// 以屬性包住每個匹配片段
///
/// 片段由左至右處理；每段結束後補回原字串在該處生效的 SGR，
/// 讓先前已套用的顏色在片段之後延續。插入的標記不影響後續片段的位置。
fn hilite(input: &str, spans: &[(usize, usize)], attrs: &Attributes) -> String {
    let mut out = String::with_capacity(input.len() + spans.len() * 16);
    let mut cursor = 0;

    for &(start, end) in spans {
        if start < cursor {
            warn!("略過重疊的 hilite 片段 {}..{}", start, end);
            continue;
        }
        out.push_str(&input[cursor..start]);
        out.push_str(attrs.start());
        out.push_str(&input[start..end]);
        out.push_str(attrs.end());
        out.push_str(&active_codes_at(input, start));
        cursor = end;
    }
    out.push_str(&input[cursor..]);
    out
}

/// 管線執行結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    /// 經過所有觸發器後的行（含 hilite）
    pub line: String,
    /// 是否有 gag 匹配
    pub gagged: bool,
    /// 最後一個匹配的 gag 是否要求仍寫入全域日誌
    pub log_anyway: bool,
    /// 各觸發器回報的錯誤
    pub errors: Vec<TriggerError>,
    /// 有匹配的觸發器 (名稱, 類型)
    pub applied: Vec<(String, TriggerKind)>,
}

/// 依序執行所有觸發器；單一觸發器的錯誤不會中斷管線
pub fn run_pipeline(triggers: &[CompiledTrigger], input: &str) -> PipelineRun {
    let mut result = PipelineRun {
        line: input.to_string(),
        gagged: false,
        log_anyway: false,
        errors: Vec::new(),
        applied: Vec::new(),
    };

    for trigger in triggers {
        let run = trigger.run(&result.line);
        result.line = run.line;
        result.errors.extend(run.errors);
        if !run.applied {
            continue;
        }
        if trigger.kind == TriggerKind::Gag {
            trace!("gag {} 匹配", trigger.name);
            result.gagged = true;
            result.log_anyway = trigger.log_anyway;
        }
        result.applied.push((trigger.name.clone(), trigger.kind));
    }

    result
}
