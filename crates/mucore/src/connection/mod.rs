//! 連線引擎
//!
//! 每個開啟的連線有三個任務：
//! - 讀取迴圈：socket → 觸發器管線 → 各輸出端；同時擁有輸出列表
//! - 交接迴圈：每 100ms 讀一次交接檔，一般行寫到 socket，`/` 開頭的行交給分派器
//! - 監聽任務：處理分派器送來的 `log` 命令
//!
//! 關閉時讀取迴圈先要求交接迴圈停止並等它交回 socket 寫入端，
//! 之後才關閉 socket、刪除交接檔與工作目錄。遠端斷線與本地關閉走同一條路。

mod handoff;
mod log_command;
mod output;
mod socket;

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use encoding_rs::Encoding;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::{format_timestamp, Config, Server, ServerType, World};
use crate::encoding::{decode_line, encode_line};
use crate::signal::{Dispatcher, Signal};
use crate::trigger::{run_pipeline, CompiledTrigger};

pub use handoff::{append_line, handoff_path, HandoffFile, HANDOFF_FILE};
pub use log_command::{list_text, resolve_log_path, LogCommand};
pub use output::{open_log_file, Output, Outputs, Sink};
pub use socket::{dial, resolve, ServerReader, ServerWriter, KEEPALIVE};

/// 全域輸出檔名
pub const GLOBAL_OUTPUT_FILE: &str = "out";

/// 交接檔輪詢間隔
///
/// 不間斷地讀取非阻塞管道在部分系統上會吃滿 CPU，並產生大量 EAGAIN
pub const HANDOFF_POLL: Duration = Duration::from_millis(100);

/// 交接檔中以此開頭的行是本地命令
pub const COMMAND_PREFIX: char = '/';

/// 部分伺服器在換行處加上的 ZWNJ，方便觸發器比對折行文字
const SOFT_WRAP: char = '\u{200c}';

const CHARSET_ANNOUNCE: &[u8] = b"\xff\xfdCHARSET unicode\n";

/// 連線錯誤
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("交接檔 {0} 已存在，拒絕繼續")]
    HandoffExists(PathBuf),

    #[error("無法解析 {addr}: {message}")]
    Resolve { addr: String, message: String },

    #[error("無法連線到 {addr}: {source}")]
    Dial { addr: SocketAddr, source: io::Error },

    #[error("連線到 {addr} 逾時（{secs} 秒）")]
    Timeout { addr: SocketAddr, secs: u64 },

    #[error("TLS 錯誤: {0}")]
    Tls(String),

    #[error("未連線")]
    NotConnected,

    #[error("連線已開啟")]
    AlreadyOpen,

    #[error("無法建立目錄 {path}: {source}")]
    Dir { path: PathBuf, source: io::Error },

    #[error("無法開啟日誌 {path}: {source}")]
    LogFile { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 送給讀取迴圈的輸出列表操作
enum SinkCommand {
    Add(Output),
    RemoveUserLog(String),
    List(oneshot::Sender<Vec<String>>),
}

struct Running {
    sink_tx: mpsc::UnboundedSender<SinkCommand>,
    close_tx: Option<oneshot::Sender<()>>,
    socket_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
}

/// 一個 world 的連線
pub struct Connection {
    name: String,
    world: World,
    server: Server,
    server_type: Option<ServerType>,
    addr: SocketAddr,
    triggers: Arc<Vec<CompiledTrigger>>,
    encoding: &'static Encoding,
    time_string: String,
    working_dir: PathBuf,
    log_dir: PathBuf,
    dispatcher: Arc<Dispatcher>,
    connected: Arc<AtomicBool>,
    /// 開啟前加入的輸出
    pending: Vec<Output>,
    running: Option<Running>,
}

impl Connection {
    /// 建立連線物件
    ///
    /// 確保工作與日誌目錄存在、交接檔尚不存在，並先解析主機名稱。
    /// 任一步失敗都不會建立 socket 或交接檔。
    pub async fn new(
        name: impl Into<String>,
        world: World,
        server: Server,
        config: &Config,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, ConnectionError> {
        let name = name.into();
        trace!("建立連線 {}", name);

        let working_dir = config.dirs.working.join(&name);
        let log_dir = config.dirs.log.join(&name);
        ensure_dir(&working_dir)?;
        ensure_dir(&log_dir)?;

        let handoff = working_dir.join(HANDOFF_FILE);
        if handoff.exists() {
            error!("{} 的交接檔已存在", name);
            return Err(ConnectionError::HandoffExists(handoff));
        }

        let addr = resolve(&server).await?;

        let encoding = crate::encoding::resolve(&server.encoding).unwrap_or_else(|| {
            warn!("未知的編碼 {}，改用 UTF-8", server.encoding);
            encoding_rs::UTF_8
        });

        Ok(Self {
            server_type: config.server_type(&server).cloned(),
            triggers: Arc::new(config.compiled_triggers.clone()),
            time_string: config.client.logging.time_string.clone(),
            name,
            world,
            server,
            addr,
            encoding,
            working_dir,
            log_dir,
            dispatcher,
            connected: Arc::new(AtomicBool::new(false)),
            pending: Vec::new(),
            running: None,
        })
    }

    /// 開啟連線
    ///
    /// 依序建立交接檔、全域輸出、socket，然後啟動各迴圈。
    /// 失敗時清除已建立的檔案。
    pub async fn open(&mut self) -> Result<(), ConnectionError> {
        if self.running.is_some() {
            return Err(ConnectionError::AlreadyOpen);
        }
        info!("正在連線到 {} ({})", self.name, self.addr);

        ensure_dir(&self.working_dir)?;
        ensure_dir(&self.log_dir)?;

        let handoff = HandoffFile::create(&self.handoff_path())?;

        let out_path = self.working_dir.join(GLOBAL_OUTPUT_FILE);
        let global = match Output::global(&out_path) {
            Ok(output) => output,
            Err(source) => {
                error!("無法建立 {} 的全域輸出: {}", self.name, source);
                self.abandon(handoff, None);
                return Err(ConnectionError::LogFile {
                    path: out_path,
                    source,
                });
            }
        };

        let (reader, mut writer) = match dial(self.addr, &self.server).await {
            Ok(halves) => halves,
            Err(e) => {
                error!("無法連線到 {}: {}", self.name, e);
                self.abandon(handoff, Some(global));
                return Err(e);
            }
        };

        if self.server.announce_charset {
            if let Err(e) = writer.write_all(CHARSET_ANNOUNCE).await {
                warn!("無法送出字元集宣告: {}", e);
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        info!("已於 {} 連線到 {}", format_timestamp(&self.time_string), self.name);

        let mut outputs = Outputs::new(self.name.clone());
        outputs.push(global);
        for output in self.pending.drain(..) {
            outputs.push(output);
        }

        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();

        let listener_id = self.listener_id();
        let signals = self.dispatcher.listener(listener_id.clone());
        let control = LogControl {
            name: self.name.clone(),
            display_name: self.world.display_name.clone(),
            log_dir: self.log_dir.clone(),
            dispatcher: self.dispatcher.clone(),
            sink_tx: sink_tx.clone(),
        };
        let listener_task = tokio::spawn(control.listen(signals));

        let forwarder = HandoffLoop {
            name: self.name.clone(),
            handoff,
            writer,
            encoding: self.encoding,
            dispatcher: self.dispatcher.clone(),
        };
        tokio::spawn(forwarder.run(stop_rx, ack_tx));

        let inbound = SocketLoop {
            name: self.name.clone(),
            listener_id,
            triggers: self.triggers.clone(),
            encoding: self.encoding,
            outputs,
            time_string: self.time_string.clone(),
            dispatcher: self.dispatcher.clone(),
            connected: self.connected.clone(),
            working_dir: self.working_dir.clone(),
            log_dir: self.log_dir.clone(),
            rotate: self.world.log,
            disconnect_line: self
                .server_type
                .as_ref()
                .and_then(|st| st.disconnect_string.clone())
                .filter(|s| !s.is_empty()),
            handoff_path: self.handoff_path(),
        };
        let socket_task = tokio::spawn(inbound.run(reader, sink_rx, close_rx, stop_tx, ack_rx));

        self.running = Some(Running {
            sink_tx,
            close_tx: Some(close_tx),
            socket_task,
            listener_task,
        });

        if let Some(server_type) = &self.server_type {
            if self.world.has_credentials() && !server_type.connect_string.is_empty() {
                let line = server_type.connect_line(&self.world);
                if let Err(e) = self.write(line) {
                    warn!("無法送出 {} 的登入字串: {}", self.name, e);
                }
            }
        }

        Ok(())
    }

    /// 開啟失敗時清除已建立的檔案
    fn abandon(&self, handoff: HandoffFile, global: Option<Output>) {
        if let Err(e) = handoff.remove() {
            warn!("無法刪除交接檔: {}", e);
        }
        if let Some(mut global) = global {
            let _ = global.close();
            if let Some(path) = global.path() {
                if let Err(e) = fs::remove_file(path) {
                    warn!("無法刪除 {}: {}", path.display(), e);
                }
            }
        }
        if let Err(e) = fs::remove_dir(&self.working_dir) {
            warn!("無法刪除工作目錄 {}: {}", self.working_dir.display(), e);
        }
    }

    /// 寫入一行到交接檔，等同在此連線輸入該行
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<usize, ConnectionError> {
        append_line(&self.handoff_path(), data.as_ref())
    }

    /// 新增一個非全域輸出；開啟前後都可以呼叫
    pub fn add_output(&mut self, name: impl Into<String>, sink: Box<dyn Sink>, supports_ansi: bool) {
        let output = Output::new(name, sink, supports_ansi);
        trace!("{} 新增輸出 {}", self.name, output.name);
        match &self.running {
            Some(running) => {
                if running.sink_tx.send(SinkCommand::Add(output)).is_err() {
                    warn!("{} 已結束，無法新增輸出", self.name);
                }
            }
            None => self.pending.push(output),
        }
    }

    /// 關閉連線；已關閉時直接回傳成功
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        let Some(mut running) = self.running.take() else {
            debug!("{} 已關閉", self.name);
            return Ok(());
        };

        trace!("關閉 {}", self.name);
        if let Some(close_tx) = running.close_tx.take() {
            // 遠端已斷線時讀取迴圈已經結束，送不出去也沒關係
            let _ = close_tx.send(());
        }
        if let Err(e) = running.socket_task.await {
            error!("{} 的讀取迴圈異常結束: {}", self.name, e);
            self.dispatcher.unregister_listener(&self.listener_id());
            self.connected.store(false, Ordering::SeqCst);
        }
        running.listener_task.abort();
        Ok(())
    }

    pub fn connection_name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.world.display_name
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 前端回捲緩衝區大小
    pub fn max_buffer(&self) -> usize {
        self.server.max_buffer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn handoff_path(&self) -> PathBuf {
        self.working_dir.join(HANDOFF_FILE)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn listener_id(&self) -> String {
        format!("connection:{}", self.name)
    }
}

fn ensure_dir(path: &Path) -> Result<(), ConnectionError> {
    fs::create_dir_all(path).map_err(|source| ConnectionError::Dir {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// 交接迴圈：交接檔 → socket
// ============================================================================

struct HandoffLoop {
    name: String,
    handoff: HandoffFile,
    writer: ServerWriter,
    encoding: &'static Encoding,
    dispatcher: Arc<Dispatcher>,
}

impl HandoffLoop {
    async fn run(
        mut self,
        mut stop: oneshot::Receiver<()>,
        ack: oneshot::Sender<(ServerWriter, HandoffFile)>,
    ) {
        trace!("{} 的交接迴圈開始", self.name);
        let mut ticker = interval(HANDOFF_POLL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => self.poll().await,
            }
        }

        debug!("{} 的交接迴圈收到停止", self.name);
        let HandoffLoop {
            name,
            handoff,
            writer,
            ..
        } = self;
        if ack.send((writer, handoff)).is_err() {
            warn!("{} 的讀取迴圈已不在，無法交回 socket", name);
        }
    }

    async fn poll(&mut self) {
        let lines = match self.handoff.read_lines() {
            Ok(lines) => lines,
            Err(e) => {
                error!("{} 的交接檔讀取失敗: {}", self.name, e);
                return;
            }
        };
        for line in lines {
            self.forward(&line).await;
        }
    }

    async fn forward(&mut self, line: &str) {
        if line.is_empty() {
            debug!("{} 的交接檔收到空行，略過", self.name);
            return;
        }

        if let Some(command) = line.strip_prefix(COMMAND_PREFIX) {
            let (name, args) = command.split_once(' ').unwrap_or((command, ""));
            trace!("{} 的本地命令 {}", self.name, name);
            self.dispatcher.dispatch_from(&self.name, name, args);
            return;
        }

        let mut data = encode_line(line, self.encoding);
        data.extend_from_slice(b"\r\n");
        if let Err(e) = self.writer.write_all(&data).await {
            warn!("無法寫入 {}: {}", self.name, e);
            return;
        }
        if let Err(e) = self.writer.flush().await {
            warn!("無法寫入 {}: {}", self.name, e);
            return;
        }
        trace!("已送出 {} 位元組到 {}", data.len(), self.name);
    }
}

// ============================================================================
// 讀取迴圈：socket → 輸出
// ============================================================================

struct SocketLoop {
    name: String,
    listener_id: String,
    triggers: Arc<Vec<CompiledTrigger>>,
    encoding: &'static Encoding,
    outputs: Outputs,
    time_string: String,
    dispatcher: Arc<Dispatcher>,
    connected: Arc<AtomicBool>,
    working_dir: PathBuf,
    log_dir: PathBuf,
    rotate: bool,
    disconnect_line: Option<String>,
    handoff_path: PathBuf,
}

impl SocketLoop {
    async fn run(
        mut self,
        reader: ServerReader,
        mut sinks: mpsc::UnboundedReceiver<SinkCommand>,
        mut close: oneshot::Receiver<()>,
        stop: oneshot::Sender<()>,
        ack: oneshot::Receiver<(ServerWriter, HandoffFile)>,
    ) {
        trace!("{} 的讀取迴圈開始", self.name);
        let mut segments = BufReader::new(reader).split(b'\n');

        let local = loop {
            tokio::select! {
                _ = &mut close => {
                    debug!("{} 收到關閉要求", self.name);
                    break true;
                }
                Some(command) = sinks.recv() => self.apply(command),
                segment = segments.next_segment() => match segment {
                    Ok(Some(bytes)) => self.handle_line(&bytes),
                    Ok(None) => {
                        warn!("伺服器關閉了 {} 的連線", self.name);
                        self.connection_lost();
                        break false;
                    }
                    Err(e) => {
                        warn!("{} 讀取失敗: {}", self.name, e);
                        self.connection_lost();
                        break false;
                    }
                },
            }
        };

        self.teardown(local, stop, ack).await;
    }

    fn apply(&mut self, command: SinkCommand) {
        match command {
            SinkCommand::Add(output) => self.outputs.push(output),
            SinkCommand::RemoveUserLog(name) => {
                self.outputs.remove_user_log(&name);
            }
            SinkCommand::List(reply) => {
                let _ = reply.send(self.outputs.user_logs());
            }
        }
    }

    fn handle_line(&mut self, bytes: &[u8]) {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        let original = decode_line(bytes, self.encoding);
        trace!("{} 讀到 {} 個字元", self.name, original.len());

        let run = run_pipeline(&self.triggers, &original);
        if !run.errors.is_empty() {
            warn!("{} 執行觸發器時發生錯誤: {:?}", self.name, run.errors);
        }

        let original = original.strip_suffix(SOFT_WRAP).unwrap_or(&original);
        let line = run.line.strip_suffix(SOFT_WRAP).unwrap_or(&run.line);
        self.outputs
            .fan_out(original, line, run.gagged, run.log_anyway);
    }

    fn connection_lost(&mut self) {
        let notice = format!(
            "\n~Connection lost at {}\n",
            format_timestamp(&self.time_string)
        );
        self.outputs.notify(&notice);
    }

    /// 關閉流程，只在讀取迴圈結束時執行一次
    async fn teardown(
        mut self,
        local: bool,
        stop: oneshot::Sender<()>,
        ack: oneshot::Receiver<(ServerWriter, HandoffFile)>,
    ) {
        trace!("清除 {} 的連線環境", self.name);
        let _ = stop.send(());

        match ack.await {
            Ok((mut writer, handoff)) => {
                if local {
                    if let Some(line) = &self.disconnect_line {
                        let mut data = encode_line(line, self.encoding);
                        data.extend_from_slice(b"\r\n");
                        if let Err(e) = writer.write_all(&data).await {
                            warn!("無法送出 {} 的登出字串: {}", self.name, e);
                        }
                    }
                }
                if let Err(e) = writer.shutdown().await {
                    debug!("關閉 {} 的 socket: {}", self.name, e);
                }
                if let Err(e) = handoff.remove() {
                    warn!("無法刪除 {} 的交接檔: {}", self.name, e);
                }
            }
            Err(_) => {
                warn!("{} 的交接迴圈沒有回應", self.name);
                if let Err(e) = fs::remove_file(&self.handoff_path) {
                    warn!("無法刪除 {} 的交接檔: {}", self.name, e);
                }
            }
        }

        let rotate_to = self.rotate.then(|| {
            self.log_dir
                .join(format!("{}.log", format_timestamp(&self.time_string)))
        });
        self.outputs.close_all(rotate_to.as_deref());

        if let Err(e) = fs::remove_dir(&self.working_dir) {
            warn!("無法刪除工作目錄 {}: {}", self.working_dir.display(), e);
        }

        self.dispatcher.unregister_listener(&self.listener_id);
        self.connected.store(false, Ordering::SeqCst);
        self.dispatcher.dispatch("_client:disconnected", &self.name);
        info!("已於 {} 離開 {}", format_timestamp(&self.time_string), self.name);
    }
}

// ============================================================================
// 監聽任務：log 命令
// ============================================================================

struct LogControl {
    name: String,
    display_name: String,
    log_dir: PathBuf,
    dispatcher: Arc<Dispatcher>,
    sink_tx: mpsc::UnboundedSender<SinkCommand>,
}

impl LogControl {
    async fn listen(self, mut signals: mpsc::Receiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            if signal.name != "log" {
                continue;
            }
            if signal
                .origin
                .as_deref()
                .is_some_and(|origin| origin != self.name)
            {
                trace!("{} 略過來自 {:?} 的 log 命令", self.name, signal.origin);
                continue;
            }
            self.handle(LogCommand::parse(&signal.payload)).await;
        }
        trace!("{} 的監聽結束", self.name);
    }

    async fn handle(&self, command: LogCommand) {
        match command {
            LogCommand::Help => self.dispatcher.dispatch("help", "log"),
            LogCommand::List => {
                let (reply, logs) = oneshot::channel();
                if self.sink_tx.send(SinkCommand::List(reply)).is_err() {
                    return;
                }
                if let Ok(logs) = logs.await {
                    self.dispatcher
                        .dispatch("_client:showModal", &list_text(&self.display_name, &logs));
                }
            }
            LogCommand::Open(name) => {
                let path = resolve_log_path(&self.log_dir, &name);
                match Output::user_log(name, &path) {
                    Ok(output) => {
                        info!("{} 開始記錄到 {}", self.name, path.display());
                        let _ = self.sink_tx.send(SinkCommand::Add(output));
                    }
                    Err(e) => warn!("無法開始記錄 {}: {}", path.display(), e),
                }
            }
            LogCommand::Off(name) => {
                let _ = self.sink_tx.send(SinkCommand::RemoveUserLog(name));
            }
            LogCommand::Unknown(flag) => warn!("log 命令的未知開關 {}", flag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SharedBuffer;
    use crate::config::Dirs;
    use crate::signal::SignalError;
    use crate::trigger::TriggerConfig;
    use tempfile::{tempdir, TempDir};
    use tokio::io::Lines;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        dir: TempDir,
        config: Config,
        dispatcher: Arc<Dispatcher>,
        listener: TcpListener,
    }

    impl Fixture {
        async fn new(triggers: Vec<TriggerConfig>, credentials: bool, log: bool) -> Self {
            let dir = tempdir().unwrap();
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();

            let mut config = Config {
                version: 1,
                dirs: Dirs::under(dir.path()),
                triggers,
                ..Default::default()
            };
            config.server_types.insert(
                "muck".to_string(),
                ServerType {
                    connect_string: "connect $username $password".to_string(),
                    disconnect_string: Some("QUIT".to_string()),
                    ..Default::default()
                },
            );
            let mut server = Server::new("gallifrey", "127.0.0.1", port);
            server.server_type = "muck".to_string();
            server.announce_charset = false;
            config.servers.insert("gallifrey".to_string(), server);

            let mut world = World::new("tardis", "gallifrey");
            world.display_name = "TARDIS".to_string();
            world.log = log;
            if credentials {
                world.username = "rose".to_string();
                world.password = "tyler".to_string();
            }
            config.worlds.insert("tardis".to_string(), world);
            config.finalize_and_validate().unwrap();

            Self {
                dir,
                config,
                dispatcher: Arc::new(Dispatcher::default()),
                listener,
            }
        }

        async fn connection(&self) -> Result<Connection, ConnectionError> {
            let world = self.config.worlds["tardis"].clone();
            let server = self.config.servers[&world.server].clone();
            Connection::new("tardis", world, server, &self.config, self.dispatcher.clone()).await
        }

        async fn accept(&self) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
            let (stream, _) = timeout(WAIT, self.listener.accept()).await.unwrap().unwrap();
            let (reader, writer) = stream.into_split();
            (BufReader::new(reader).lines(), writer)
        }

        fn working(&self) -> PathBuf {
            self.dir.path().join("worlds").join("tardis")
        }

        fn logs(&self) -> PathBuf {
            self.dir.path().join("logs").join("tardis")
        }
    }

    async fn next_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Option<String> {
        timeout(WAIT, lines.next_line()).await.unwrap().unwrap()
    }

    async fn next_signal(rx: &mut mpsc::Receiver<Signal>, name: &str) -> Signal {
        timeout(WAIT, async {
            loop {
                let signal = rx.recv().await.unwrap();
                if signal.name == name {
                    return signal;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..250 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("條件未在時限內成立");
    }

    fn texts(buffer: &SharedBuffer) -> Vec<String> {
        buffer.with(|b| b.iter().map(|l| l.text.clone()).collect())
    }

    fn gag(log_anyway: bool) -> Vec<TriggerConfig> {
        vec![TriggerConfig {
            kind: "gag".to_string(),
            pattern: "bad-wolf".to_string(),
            log_anyway,
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn test_gag_suppresses_every_output() {
        let fixture = Fixture::new(gag(false), false, false).await;
        let ui = SharedBuffer::new(100);
        let mut conn = fixture.connection().await.unwrap();
        conn.add_output("ui", Box::new(ui.clone()), true);
        conn.open().await.unwrap();
        let (_lines, mut server) = fixture.accept().await;

        server.write_all(b"bad-wolf\r\nhello\r\n").await.unwrap();
        wait_until(|| texts(&ui).len() == 1).await;
        assert_eq!(texts(&ui), vec!["hello\n"]);
        let out = fs::read_to_string(fixture.working().join(GLOBAL_OUTPUT_FILE)).unwrap();
        assert_eq!(out, "hello\n");

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_gag_log_anyway_reaches_global_only() {
        let fixture = Fixture::new(gag(true), false, true).await;
        let ui = SharedBuffer::new(100);
        let mut conn = fixture.connection().await.unwrap();
        conn.add_output("ui", Box::new(ui.clone()), true);
        conn.open().await.unwrap();
        let (_lines, mut server) = fixture.accept().await;

        server.write_all(b"bad-wolf\r\nhello\r\n").await.unwrap();
        wait_until(|| texts(&ui).len() == 1).await;
        assert_eq!(texts(&ui), vec!["hello\n"]);

        conn.close().await.unwrap();

        // world.log 開啟時，全域輸出被輪替到日誌目錄
        let rotated: Vec<_> = fs::read_dir(fixture.logs())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(rotated.len(), 1);
        assert_eq!(fs::read_to_string(&rotated[0]).unwrap(), "bad-wolf\nhello\n");
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_strings() {
        let fixture = Fixture::new(Vec::new(), true, false).await;
        let mut conn = fixture.connection().await.unwrap();
        conn.open().await.unwrap();
        let (mut lines, _server) = fixture.accept().await;

        assert_eq!(next_line(&mut lines).await.unwrap(), "connect rose tyler");
        conn.write("look").unwrap();
        assert_eq!(next_line(&mut lines).await.unwrap(), "look");

        conn.close().await.unwrap();
        assert_eq!(next_line(&mut lines).await.unwrap(), "QUIT");
        assert_eq!(next_line(&mut lines).await, None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fixture = Fixture::new(Vec::new(), false, false).await;
        let mut watch = fixture.dispatcher.listener("watch");
        let mut conn = fixture.connection().await.unwrap();
        conn.open().await.unwrap();
        let _server = fixture.accept().await;
        assert!(conn.is_connected());

        conn.close().await.unwrap();
        conn.close().await.unwrap();

        assert!(!conn.is_connected());
        assert!(!conn.handoff_path().exists());
        assert!(!fixture.working().exists());
        assert!(matches!(conn.write("look"), Err(ConnectionError::NotConnected)));

        let signal = next_signal(&mut watch, "_client:disconnected").await;
        assert_eq!(signal.payload, vec!["tardis".to_string()]);
        sleep(Duration::from_millis(200)).await;
        while let Ok(signal) = watch.try_recv() {
            assert_ne!(signal.name, "_client:disconnected");
        }
        assert_eq!(fixture.dispatcher.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_handoff_is_exclusive() {
        let fixture = Fixture::new(Vec::new(), false, false).await;
        let mut first = fixture.connection().await.unwrap();
        first.open().await.unwrap();
        let _server = fixture.accept().await;

        assert!(matches!(
            fixture.connection().await,
            Err(ConnectionError::HandoffExists(_))
        ));

        first.close().await.unwrap();
        assert!(fixture.connection().await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_disconnect() {
        let fixture = Fixture::new(Vec::new(), false, false).await;
        let mut watch = fixture.dispatcher.listener("watch");
        let ui = SharedBuffer::new(100);
        let mut conn = fixture.connection().await.unwrap();
        conn.add_output("ui", Box::new(ui.clone()), true);
        conn.open().await.unwrap();

        let (lines, mut server) = fixture.accept().await;
        server.write_all(b"bye\r\n").await.unwrap();
        drop(server);
        drop(lines);

        next_signal(&mut watch, "_client:disconnected").await;
        assert!(!conn.is_connected());
        assert!(!conn.handoff_path().exists());

        let received = texts(&ui);
        assert_eq!(received[0], "bye\n");
        assert!(received[1].starts_with("\n~Connection lost at "));

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handoff_commands_go_to_dispatcher() {
        let fixture = Fixture::new(Vec::new(), false, false).await;
        let mut watch = fixture.dispatcher.listener("watch");
        let mut conn = fixture.connection().await.unwrap();
        conn.open().await.unwrap();
        let (mut lines, _server) = fixture.accept().await;

        conn.write("/bad-wolf nonesuch").unwrap();
        conn.write("").unwrap();
        conn.write("say hi").unwrap();

        let signal = next_signal(&mut watch, "bad-wolf").await;
        assert_eq!(signal.payload, vec!["nonesuch".to_string()]);
        assert_eq!(signal.origin.as_deref(), Some("tardis"));
        assert_eq!(
            signal.err,
            Some(SignalError::UnknownCommand("bad-wolf".to_string()))
        );
        assert_eq!(next_line(&mut lines).await.unwrap(), "say hi");

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_log_command() {
        let fixture = Fixture::new(Vec::new(), false, false).await;
        let mut watch = fixture.dispatcher.listener("watch");
        let mut conn = fixture.connection().await.unwrap();
        conn.open().await.unwrap();
        let (_lines, mut server) = fixture.accept().await;

        fixture.dispatcher.dispatch_from("tardis", "log", "a.log");
        fixture.dispatcher.dispatch_from("elsewhere", "log", "b.log");
        fixture.dispatcher.dispatch("log", "--list");
        let listed = next_signal(&mut watch, "_client:showModal").await;
        assert_eq!(
            listed.payload,
            vec!["Open logs for TARDIS".to_string(), "* a.log".to_string()]
        );

        server.write_all(b"hello\r\n").await.unwrap();
        let path = fixture.logs().join("a.log");
        wait_until(|| fs::read_to_string(&path).is_ok_and(|s| s == "hello\n")).await;

        fixture.dispatcher.dispatch("log", "--off a.log");
        fixture.dispatcher.dispatch("log", "--list");
        let listed = next_signal(&mut watch, "_client:showModal").await;
        assert_eq!(listed.payload[1], "(none)");

        fixture.dispatcher.dispatch("log", "");
        let help = next_signal(&mut watch, "help").await;
        assert_eq!(help.payload, vec!["log".to_string()]);

        conn.close().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_resolve_failure_creates_nothing() {
        let fixture = Fixture::new(Vec::new(), false, false).await;
        let world = World::new("nowhere", "nowhere");
        let server = Server::new("nowhere", "no such host.invalid", 4201);
        let result =
            Connection::new("nowhere", world, server, &fixture.config, fixture.dispatcher.clone())
                .await;
        assert!(matches!(result, Err(ConnectionError::Resolve { .. })));
        assert!(!handoff_path(&fixture.config.dirs.working, "nowhere").exists());
    }

    #[tokio::test]
    async fn test_dial_failure_cleans_up() {
        let fixture = Fixture::new(Vec::new(), false, false).await;
        let mut conn = fixture.connection().await.unwrap();
        let working = fixture.working();
        drop(fixture.listener);

        assert!(matches!(
            conn.open().await,
            Err(ConnectionError::Dial { .. })
        ));
        assert!(!conn.is_connected());
        assert!(!conn.handoff_path().exists());
        assert!(!working.exists());
    }

    /// 讀取迴圈以模擬的 socket 驗證觸發器、ZWNJ 與斷線通知
    #[tokio::test]
    async fn test_socket_loop_with_mock_reader() {
        let dir = tempdir().unwrap();
        let working = dir.path().join("tardis");
        fs::create_dir_all(&working).unwrap();
        let handoff = HandoffFile::create(&working.join(HANDOFF_FILE)).unwrap();

        let hilite = TriggerConfig {
            kind: "hilite".to_string(),
            pattern: "(?i)(the )?doctor".to_string(),
            attributes: "bold".to_string(),
            ..Default::default()
        };
        let triggers = vec![hilite.compile().unwrap()];

        let ansi = SharedBuffer::new(10);
        let plain = SharedBuffer::new(10);
        let mut outputs = Outputs::new("tardis");
        outputs.push(Output::new("ansi", Box::new(ansi.clone()), true));
        outputs.push(Output::new("plain", Box::new(plain.clone()), false));

        let dispatcher = Arc::new(Dispatcher::default());
        let mut watch = dispatcher.listener("watch");
        let inbound = SocketLoop {
            name: "tardis".to_string(),
            listener_id: "connection:tardis".to_string(),
            triggers: Arc::new(triggers),
            encoding: encoding_rs::UTF_8,
            outputs,
            time_string: "%H:%M".to_string(),
            dispatcher,
            connected: Arc::new(AtomicBool::new(true)),
            working_dir: working.clone(),
            log_dir: dir.path().join("logs"),
            rotate: false,
            disconnect_line: Some("QUIT".to_string()),
            handoff_path: working.join(HANDOFF_FILE),
        };

        let reader = tokio_test::io::Builder::new()
            .read(b"I'm the Doctor\r\n")
            .read("wrapped\u{200c}\n".as_bytes())
            .build();
        let writer = tokio_test::io::Builder::new().build();

        let (_sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (_close_tx, close_rx) = oneshot::channel();
        let (stop_tx, _stop_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let writer: ServerWriter = Box::new(writer);
        let _ = ack_tx.send((writer, handoff));

        inbound
            .run(Box::new(reader), sink_rx, close_rx, stop_tx, ack_rx)
            .await;

        let ansi = texts(&ansi);
        assert_eq!(ansi[0], "I'm \x1b[1mthe Doctor\x1b[22m\n");
        assert_eq!(ansi[1], "wrapped\n");
        assert!(ansi[2].starts_with("\n~Connection lost at "));
        assert_eq!(texts(&plain)[0], "I'm the Doctor\n");
        assert!(!working.exists());
        next_signal(&mut watch, "_client:disconnected").await;
    }
}
