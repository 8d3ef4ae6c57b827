//! ANSI 轉義碼工具
//!
//! - 將 hilite 屬性描述（如 `bold+cyan`）轉為 SGR 開關碼
//! - 移除 ANSI 轉義碼（日誌輪替時使用）
//! - 查詢字串某位置上仍生效的 SGR 序列

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

const ESC: char = '\x1b';

/// 基本八色，索引即 SGR 色碼偏移
const COLORS: [&str; 8] = [
    "black", "red", "green", "yellow", "blue", "magenta", "cyan", "white",
];

/// 編譯後的視覺屬性：一組開啟碼與對應的關閉碼
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    on: String,
    off: String,
}

impl Attributes {
    /// 解析屬性描述
    ///
    /// 以 `+`、`,` 或空白分隔，每個項目可以是：
    /// - 樣式：`bold`、`faint`、`italic`、`underline`、`blink`、`reverse`、`hidden`、`strike`
    /// - 前景色：`red`、`bright_red`、`0`-`255`、`#rrggbb`
    /// - 背景色：以 `on_` 為前綴的前景色寫法，如 `on_blue`
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut on = Vec::new();
        let mut off: Vec<&'static str> = Vec::new();

        for token in text
            .split(|c: char| c == '+' || c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_ascii_lowercase();
            let (code, reset) = match token.strip_prefix("on_") {
                Some(color) => (color_code(color, true)?, "49"),
                None => match style_code(&token) {
                    Some(pair) => (pair.0.to_string(), pair.1),
                    None => (color_code(&token, false)?, "39"),
                },
            };
            on.push(code);
            if !off.contains(&reset) {
                off.push(reset);
            }
        }

        if on.is_empty() {
            return Err(format!("屬性描述為空: {:?}", text));
        }

        Ok(Self {
            on: on.iter().map(|c| sgr(c)).collect(),
            off: off.iter().rev().map(|c| sgr(c)).collect(),
        })
    }

    /// 開啟碼
    pub fn start(&self) -> &str {
        &self.on
    }

    /// 關閉碼
    pub fn end(&self) -> &str {
        &self.off
    }

    /// 以開關碼包住文字
    pub fn wrap(&self, text: &str) -> String {
        format!("{}{}{}", self.on, text, self.off)
    }
}

fn sgr(code: &str) -> String {
    format!("{}[{}m", ESC, code)
}

fn style_code(token: &str) -> Option<(&'static str, &'static str)> {
    let pair = match token {
        "bold" => ("1", "22"),
        "faint" | "dim" => ("2", "22"),
        "italic" => ("3", "23"),
        "underline" => ("4", "24"),
        "blink" => ("5", "25"),
        "reverse" | "inverse" => ("7", "27"),
        "hidden" | "conceal" => ("8", "28"),
        "strike" | "strikethrough" | "crossedout" => ("9", "29"),
        _ => return None,
    };
    Some(pair)
}

fn color_code(token: &str, background: bool) -> Result<String, String> {
    let (base, bright_base, extended) = if background {
        (40, 100, "48")
    } else {
        (30, 90, "38")
    };

    if let Some(name) = token.strip_prefix("bright_") {
        if let Some(i) = COLORS.iter().position(|c| *c == name) {
            return Ok((bright_base + i).to_string());
        }
    }
    if let Some(i) = COLORS.iter().position(|c| *c == token) {
        return Ok((base + i).to_string());
    }
    if let Ok(index) = token.parse::<u8>() {
        return Ok(format!("{};5;{}", extended, index));
    }
    if let Some(hex) = token.strip_prefix('#') {
        if hex.len() == 6 {
            let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16);
            if let (Ok(r), Ok(g), Ok(b)) = (channel(0), channel(2), channel(4)) {
                return Ok(format!("{};2;{};{};{}", extended, r, g, b));
            }
        }
    }
    Err(format!("未知的屬性: {}", token))
}

/// 回傳 `input[..index]` 中最後一次重置之後仍生效的 SGR 序列（原樣串接）
///
/// hilite 在一段匹配結束時用它恢復原本的顏色
pub fn active_codes_at(input: &str, index: usize) -> String {
    let mut active = String::new();
    let end = index.min(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < end {
        if bytes[i] != 0x1b || i + 1 >= end || bytes[i + 1] != b'[' {
            i += 1;
            continue;
        }
        let mut j = i + 2;
        while j < end && !(0x40..=0x7E).contains(&bytes[j]) {
            j += 1;
        }
        if j >= end {
            break;
        }
        if bytes[j] == b'm' {
            let params = &input[i + 2..j];
            if params.is_empty() || params.split(';').all(|p| p.trim_start_matches('0').is_empty()) {
                active.clear();
            } else {
                active.push_str(&input[i..=j]);
            }
        }
        i = j + 1;
    }

    active
}

/// 移除 ANSI 轉義碼
pub fn strip_ansi(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != ESC {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some(&'[') => {
                chars.next();
                // 跳過直至終止符 (0x40-0x7E)
                while let Some(ch) = chars.next() {
                    if ('\x40'..='\x7e').contains(&ch) {
                        break;
                    }
                }
            }
            Some(&'(') | Some(&')') => {
                chars.next();
                chars.next();
            }
            _ => {}
        }
    }

    result
}

/// 逐行讀取 `input`，移除 ANSI 轉義碼後寫入 `output`，回傳處理的行數
pub fn strip_ansi_file(input: &Path, output: &Path) -> io::Result<usize> {
    let reader = BufReader::new(File::open(input)?);
    let mut writer = BufWriter::new(File::create(output)?);
    let mut lines = 0;

    for line in reader.split(b'\n') {
        let line = line?;
        let text = String::from_utf8_lossy(&line);
        writeln!(writer, "{}", strip_ansi(text.trim_end_matches('\r')))?;
        lines += 1;
    }
    writer.flush()?;

    tracing::debug!("已清除 {} 行的 ANSI 碼: {:?} -> {:?}", lines, input, output);
    Ok(lines)
}
