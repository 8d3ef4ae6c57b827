//! 輸出端
//!
//! 每個連線有一個有序的輸出列表。第一個永遠是全域輸出（工作目錄下的 `out` 檔），
//! 關閉時依 world 設定輪替為去除 ANSI 的日誌或直接刪除。

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn};

use crate::ansi::strip_ansi_file;

/// 可寫入、可關閉的輸出目標
pub trait Sink: Write + Send {
    /// 關閉輸出；預設只做 flush
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl Sink for File {
    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl Sink for io::Stdout {}

impl Sink for Vec<u8> {}

/// 以附加模式開啟日誌檔；檔案已存在時發出警告
pub fn open_log_file(path: &Path) -> io::Result<File> {
    if path.exists() {
        warn!("{} 已存在，附加寫入", path.display());
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// 一個具名的輸出端
pub struct Output {
    pub name: String,
    /// 每個連線恰好一個，關閉時輪替
    pub global: bool,
    /// 寫入含 hilite 的版本；否則寫入原始行
    pub supports_ansi: bool,
    /// 由 `/log` 建立
    pub user_created: bool,
    path: Option<PathBuf>,
    sink: Box<dyn Sink>,
}

impl Output {
    pub fn new(name: impl Into<String>, sink: Box<dyn Sink>, supports_ansi: bool) -> Self {
        Self {
            name: name.into(),
            global: false,
            supports_ansi,
            user_created: false,
            path: None,
            sink,
        }
    }

    /// 全域輸出；保留 ANSI，輪替時才去除
    pub fn global(path: &Path) -> io::Result<Self> {
        let file = open_log_file(path)?;
        Ok(Self {
            name: path.display().to_string(),
            global: true,
            supports_ansi: true,
            user_created: false,
            path: Some(path.to_path_buf()),
            sink: Box::new(file),
        })
    }

    /// `/log <name>` 建立的純文字日誌
    pub fn user_log(name: impl Into<String>, path: &Path) -> io::Result<Self> {
        let file = open_log_file(path)?;
        Ok(Self {
            name: name.into(),
            global: false,
            supports_ansi: false,
            user_created: true,
            path: Some(path.to_path_buf()),
            sink: Box::new(file),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 寫入一行（自動加上換行）
    pub fn write_line(&mut self, text: &str) -> io::Result<()> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.sink.write_all(line.as_bytes())
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.sink.close()
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.name)
            .field("global", &self.global)
            .field("supports_ansi", &self.supports_ansi)
            .field("user_created", &self.user_created)
            .finish()
    }
}

/// 一個連線的所有輸出
#[derive(Debug)]
pub struct Outputs {
    connection: String,
    items: Vec<Output>,
}

impl Outputs {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, output: Output) {
        trace!("{} 新增輸出 {}", self.connection, output.name);
        self.items.push(output);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 關閉並移除指定名稱的使用者日誌；全域與其他輸出不受影響
    pub fn remove_user_log(&mut self, name: &str) -> bool {
        let Some(index) = self
            .items
            .iter()
            .position(|o| o.user_created && o.name == name)
        else {
            warn!("{} 沒有名為 {} 的日誌", self.connection, name);
            return false;
        };

        let mut output = self.items.remove(index);
        if let Err(e) = output.close() {
            warn!("關閉日誌 {} 失敗: {}", name, e);
        }
        info!("日誌 {} 已關閉", name);
        true
    }

    /// 使用者建立的日誌名稱
    pub fn user_logs(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|o| o.user_created)
            .map(|o| o.name.clone())
            .collect()
    }

    /// 將一行分送到各輸出
    ///
    /// 被 gag 時只有 `log_anyway` 且為全域的輸出會收到。
    /// 單一輸出寫入失敗只記錄警告，其他輸出照常寫入。
    pub fn fan_out(&mut self, original: &str, highlighted: &str, gagged: bool, log_anyway: bool) {
        for output in &mut self.items {
            if gagged && !(log_anyway && output.global) {
                continue;
            }
            let text = if output.supports_ansi {
                highlighted
            } else {
                original
            };
            if let Err(e) = output.write_line(text) {
                warn!("無法寫入 {} 的輸出 {}: {}", self.connection, output.name, e);
            }
        }
    }

    /// 寫入一則通知到所有輸出，不經過觸發器
    pub fn notify(&mut self, text: &str) {
        for output in &mut self.items {
            if let Err(e) = output.write_line(text) {
                warn!("無法寫入 {} 的輸出 {}: {}", self.connection, output.name, e);
            }
        }
    }

    /// 關閉所有輸出
    ///
    /// 全域輸出在 `rotate_to` 有值時先去除 ANSI 並寫到該路徑，再刪除原檔；
    /// 輪替失敗則保留原檔
    pub fn close_all(&mut self, rotate_to: Option<&Path>) {
        trace!("關閉 {} 的所有輸出", self.connection);
        for mut output in self.items.drain(..) {
            if let Err(e) = output.close() {
                warn!("關閉 {} 的輸出 {} 失敗: {}", self.connection, output.name, e);
            }
            debug!("{} 的輸出 {} 已關閉", self.connection, output.name);

            if !output.global {
                continue;
            }
            let Some(path) = output.path.take() else {
                continue;
            };
            if let Some(rotated) = rotate_to {
                if let Err(e) = strip_ansi_file(&path, rotated) {
                    warn!(
                        "無法輪替日誌 {}，請自行處理: {}",
                        path.display(),
                        e
                    );
                    continue;
                }
                info!("日誌已輪替至 {}", rotated.display());
            }
            if let Err(e) = fs::remove_file(&path) {
                warn!("無法刪除 {}: {}", path.display(), e);
            }
        }
    }
}
