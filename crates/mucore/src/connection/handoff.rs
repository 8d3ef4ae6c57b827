//! 交接檔
//!
//! 每個連線在工作目錄下有一個 `in` 檔。外部工具（或前端）寫入一行，
//! 就等同於在該連線輸入那一行。Unix 上是具名管道，其他平台退化為一般檔案。

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::ConnectionError;

/// 交接檔名稱
pub const HANDOFF_FILE: &str = "in";

/// 連線在工作目錄下的交接檔路徑
pub fn handoff_path(working_dir: &Path, connection: &str) -> PathBuf {
    working_dir.join(connection).join(HANDOFF_FILE)
}

/// 以附加模式寫入一行，寫完立即關閉
pub fn append_line(path: &Path, data: &[u8]) -> Result<usize, ConnectionError> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ConnectionError::NotConnected,
            _ => ConnectionError::Io(e),
        })?;

    let mut line = Vec::with_capacity(data.len() + 1);
    line.extend_from_slice(data);
    line.push(b'\n');
    file.write_all(&line)?;
    Ok(line.len())
}

/// 讀取端；只由交接迴圈持有
#[derive(Debug)]
pub struct HandoffFile {
    path: PathBuf,
    file: File,
    partial: Vec<u8>,
}

impl HandoffFile {
    /// 獨佔建立交接檔並以非阻塞模式開啟
    pub fn create(path: &Path) -> Result<Self, ConnectionError> {
        trace!("建立交接檔 {}", path.display());
        make_handoff(path).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => ConnectionError::HandoffExists(path.to_path_buf()),
            _ => ConnectionError::Io(e),
        })?;

        let file = match open_reader(path) {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_file(path);
                return Err(ConnectionError::Io(e));
            }
        };
        debug!("交接檔已開啟 {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file,
            partial: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 讀出目前所有完整的行；不完整的尾段留到下次
    ///
    /// 沒有資料時立即回傳空列表，不會阻塞
    pub fn read_lines(&mut self) -> io::Result<Vec<String>> {
        let mut buf = [0u8; 4096];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.partial.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let raw = &raw[..raw.len() - 1];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            lines.push(String::from_utf8_lossy(raw).into_owned());
        }
        Ok(lines)
    }

    /// 關閉並刪除交接檔
    pub fn remove(self) -> io::Result<()> {
        let Self { path, file, .. } = self;
        // 先刪除再關閉讀取端，寫入端才不會卡在沒有讀者的管道上
        fs::remove_file(&path)?;
        drop(file);
        debug!("交接檔已刪除 {}", path.display());
        Ok(())
    }
}

#[cfg(unix)]
fn make_handoff(path: &Path) -> io::Result<()> {
    use nix::sys::stat::Mode;

    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o644)).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn make_handoff(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(drop)
}

#[cfg(unix)]
fn open_reader(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_reader(path: &Path) -> io::Result<File> {
    File::open(path)
}
