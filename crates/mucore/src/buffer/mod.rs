//! 訊息緩衝區模組
//!
//! 固定容量的滾動緩衝區，保存帶時間戳的行，並提供游標瀏覽。
//! 可作為連線的輸出端（`Sink`），也可作為輸入歷史。

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};

use crate::connection::Sink;

/// 帶時間戳的一行文字
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLine {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

/// 寫入後執行的掛鉤
pub type PostWriteHook = Box<dyn FnMut(&BufferLine) -> io::Result<()> + Send>;

/// 滾動緩衝區
///
/// 寫入超過容量時，最舊的行會被移除
pub struct Buffer {
    lines: VecDeque<BufferLine>,
    capacity: usize,
    /// 目前游標；可能退到 -1（已越過最舊的一行）
    cursor: isize,
    hooks: Vec<PostWriteHook>,
}

impl Buffer {
    /// 創建新的緩衝區
    ///
    /// # Example
    /// ```
    /// use mucore::buffer::Buffer;
    ///
    /// let buffer = Buffer::new(100);
    /// assert_eq!(buffer.size(), 0);
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            cursor: 0,
            hooks: Vec::new(),
        }
    }

    /// 添加一行，必要時滾出最舊的行，游標移到最新一行
    pub fn push(&mut self, text: impl Into<String>) {
        self.lines.push_back(BufferLine {
            timestamp: Local::now(),
            text: text.into(),
        });
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
        self.cursor = self.lines.len() as isize - 1;
    }

    /// 游標所在的行
    pub fn current(&self) -> Option<&BufferLine> {
        if self.lines.is_empty() {
            return None;
        }
        self.lines.get(self.cursor.max(0) as usize)
    }

    /// 游標往新的方向移動一行
    pub fn forward(&mut self) -> Option<&BufferLine> {
        let last = self.lines.len() as isize - 1;
        self.cursor = (self.cursor + 1).min(last);
        self.current()
    }

    /// 回傳目前的行，然後游標往舊的方向移動一行
    ///
    /// 先回傳再移動，讓輸入歷史的行為比較自然
    pub fn back(&mut self) -> Option<&BufferLine> {
        if self.cursor < 0 {
            self.cursor = 0;
        }
        let at = self.cursor;
        self.cursor -= 1;
        if self.lines.is_empty() {
            return None;
        }
        self.lines.get(at as usize)
    }

    /// 游標移到最新一行
    pub fn last(&mut self) -> Option<&BufferLine> {
        self.cursor = self.lines.len() as isize - 1;
        self.current()
    }

    /// 游標是否位於最新一行
    pub fn on_last(&self) -> bool {
        self.cursor == self.lines.len() as isize - 1
    }

    /// 行數
    pub fn size(&self) -> usize {
        self.lines.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferLine> {
        self.lines.iter()
    }

    /// 註冊寫入後掛鉤；掛鉤依註冊順序同步執行
    pub fn add_post_write_hook(&mut self, hook: PostWriteHook) {
        self.hooks.push(hook);
    }
}

impl std::fmt::Display for Buffer {
    /// 整個緩衝區原樣串接
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in &self.lines {
            f.write_str(&line.text)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.lines.len())
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// 每次 `write` 呼叫即為一行
impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(String::from_utf8_lossy(buf).into_owned());

        if let Some(line) = self.lines.back().cloned() {
            for hook in &mut self.hooks {
                hook(&line)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Sink for Buffer {}

/// 可在 UI 與連線之間共用的緩衝區
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Buffer>>);

impl SharedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(Buffer::new(capacity))))
    }

    /// 在鎖內操作緩衝區
    pub fn with<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with(|b| b.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Sink for SharedBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(names: &[&str]) -> Buffer {
        let mut buffer = Buffer::new(100);
        for name in names {
            buffer.write_all(name.as_bytes()).unwrap();
        }
        buffer
    }

    #[test]
    fn test_new_buffer() {
        let buffer = Buffer::new(100);
        assert_eq!(buffer.size(), 0);
        assert!(buffer.current().is_none());
    }

    #[test]
    fn test_write_returns_len() {
        let mut buffer = Buffer::new(100);
        assert_eq!(buffer.write(b"rose").unwrap(), 4);
        assert_eq!(buffer.size(), 1);
    }

    #[test]
    fn test_capacity_overflow() {
        let mut buffer = Buffer::new(10);
        for i in 0..15 {
            buffer.write_all((i % 10).to_string().as_bytes()).unwrap();
        }
        assert_eq!(buffer.size(), 10);
        assert_eq!(buffer.to_string(), "5678901234");
    }

    #[test]
    fn test_cursor_back_and_forward() {
        let mut buffer = filled(&["Rose Tyler", "Mickey Smith", "Donna Noble"]);
        assert_eq!(buffer.current().unwrap().text, "Donna Noble");

        // 先回傳目前行再後退
        assert_eq!(buffer.back().unwrap().text, "Donna Noble");
        assert_eq!(buffer.current().unwrap().text, "Mickey Smith");
        assert!(!buffer.on_last());

        assert_eq!(buffer.forward().unwrap().text, "Donna Noble");
        assert_eq!(buffer.forward().unwrap().text, "Donna Noble");
        assert!(buffer.on_last());
    }

    #[test]
    fn test_back_past_oldest() {
        let mut buffer = filled(&["a", "b"]);
        buffer.back();
        buffer.back();
        assert_eq!(buffer.current().unwrap().text, "a");
        assert_eq!(buffer.back().unwrap().text, "a");
        assert_eq!(buffer.last().unwrap().text, "b");
    }

    #[test]
    fn test_timestamps_ordered() {
        let buffer = filled(&["Rose Tyler", "Mickey Smith", "Donna Noble"]);
        let stamps: Vec<_> = buffer.iter().map(|l| l.timestamp).collect();
        assert!(stamps[0] <= stamps[1]);
        assert!(stamps[1] <= stamps[2]);
    }

    #[test]
    fn test_post_write_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut buffer = Buffer::new(10);
        buffer.add_post_write_hook(Box::new(move |line| {
            sink.lock().unwrap().push(line.text.clone());
            Ok(())
        }));
        buffer.write_all(b"hello").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_shared_buffer() {
        let shared = SharedBuffer::new(5);
        let mut writer = shared.clone();
        writer.write_all(b"line\n").unwrap();
        assert_eq!(shared.with(|b| b.size()), 1);
    }
}
