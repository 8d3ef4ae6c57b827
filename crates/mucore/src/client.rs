//! Session 管理
//!
//! 以連線名稱（通常是 world 名稱）管理所有開啟的連線，
//! 並處理 `connect`、`disconnect`、`reload`、`quit` 等 signal。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, ConfigError, Server, World};
use crate::connection::{Connection, ConnectionError, Sink};
use crate::signal::{Dispatcher, Signal, SignalError};

/// Session 錯誤
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} 已經連線")]
    AlreadyConnected(String),

    #[error("找不到 world、server 或位址 {0}")]
    UnknownTarget(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

type SinkFactory = Box<dyn Fn(&str) -> Box<dyn Sink> + Send + Sync>;

/// 每個新連線都會附加的輸出
struct DefaultOutput {
    name: String,
    supports_ansi: bool,
    factory: SinkFactory,
}

/// 所有連線
pub struct Client {
    config: Config,
    config_paths: Vec<PathBuf>,
    dispatcher: Arc<Dispatcher>,
    connections: HashMap<String, Connection>,
    default_outputs: Vec<DefaultOutput>,
}

impl Client {
    /// `config_paths` 用於 `reload`
    pub fn new(config: Config, config_paths: Vec<PathBuf>, dispatcher: Arc<Dispatcher>) -> Self {
        trace!("建立 client");
        Self {
            config,
            config_paths,
            dispatcher,
            connections: HashMap::new(),
            default_outputs: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// 登記一個每個新連線都會附加的輸出；`factory` 收到連線名稱
    pub fn add_default_output<F>(&mut self, name: impl Into<String>, supports_ansi: bool, factory: F)
    where
        F: Fn(&str) -> Box<dyn Sink> + Send + Sync + 'static,
    {
        self.default_outputs.push(DefaultOutput {
            name: name.into(),
            supports_ansi,
            factory: Box::new(factory),
        });
    }

    /// 連線到 world、server 或 `host:port`
    pub async fn connect(&mut self, target: &str) -> Result<&Connection, ClientError> {
        trace!("嘗試連線到 {}", target);
        if let Some(existing) = self.connections.get(target) {
            if existing.is_connected() {
                warn!("{} 已經連線", target);
                return Err(ClientError::AlreadyConnected(target.to_string()));
            }
        }
        if let Some(mut stale) = self.connections.remove(target) {
            stale.close().await?;
        }

        let (world, server) = self.resolve_target(target)?;
        let mut conn = Connection::new(
            target,
            world,
            server,
            &self.config,
            self.dispatcher.clone(),
        )
        .await?;

        for output in &self.default_outputs {
            conn.add_output(
                output.name.clone(),
                (output.factory)(target),
                output.supports_ansi,
            );
        }
        conn.open().await?;

        info!("已連線到 {}", target);
        Ok(self.connections.entry(target.to_string()).or_insert(conn))
    }

    /// world 優先，其次是 server，最後當成 `host:port`
    fn resolve_target(&self, target: &str) -> Result<(World, Server), ClientError> {
        if let Some(world) = self.config.worlds.get(target) {
            trace!("{} 是 world", target);
            let server = self
                .config
                .servers
                .get(&world.server)
                .ok_or_else(|| ClientError::UnknownTarget(world.server.clone()))?;
            return Ok((world.clone(), server.clone()));
        }

        if let Some(server) = self.config.servers.get(target) {
            trace!("{} 是 server", target);
            return Ok((World::new(target, &server.name), server.clone()));
        }

        trace!("把 {} 當成位址", target);
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| ClientError::UnknownTarget(target.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ClientError::UnknownTarget(target.to_string()))?;
        if host.is_empty() {
            return Err(ClientError::UnknownTarget(target.to_string()));
        }
        Ok((World::new(target, target), Server::new(target, host, port)))
    }

    pub fn conn(&self, name: &str) -> Option<&Connection> {
        self.connections.get(name)
    }

    pub fn conn_mut(&mut self, name: &str) -> Option<&mut Connection> {
        self.connections.get_mut(name)
    }

    /// 目前的連線名稱（已排序）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// 關閉並移除指定連線；不存在時回傳 false
    pub async fn close(&mut self, name: &str) -> bool {
        trace!("關閉連線 {}", name);
        let Some(mut conn) = self.connections.remove(name) else {
            warn!("要求關閉 {}，但找不到這個連線", name);
            return false;
        };
        if let Err(e) = conn.close().await {
            error!("關閉 {} 失敗: {}", name, e);
        }
        true
    }

    pub async fn close_all(&mut self) {
        trace!("關閉所有連線");
        for (name, mut conn) in self.connections.drain() {
            if let Err(e) = conn.close().await {
                error!("關閉 {} 失敗: {}", name, e);
            }
        }
    }

    /// 從原本的路徑重新載入設定；失敗時保留目前設定
    ///
    /// 已開啟的連線保留開啟時的觸發器，只有新連線會用到新設定
    pub fn reload(&mut self) -> Result<(), ClientError> {
        debug!("重新載入設定");
        let config = Config::load(&self.config_paths, self.config.dirs.clone())?;
        self.config = config;
        info!("設定已重新載入");
        Ok(())
    }

    /// 處理 signal 直到收到 `quit` 或佇列關閉
    pub async fn run(mut self, mut signals: mpsc::Receiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            if !self.handle(signal).await {
                break;
            }
        }
        debug!("client 結束");
    }

    /// 處理一個 signal；回傳 false 表示應該結束
    pub async fn handle(&mut self, signal: Signal) -> bool {
        match signal.name.as_str() {
            "connect" | "c" => self.on_connect(signal).await,
            "disconnect" | "dc" => self.on_disconnect(signal).await,
            "reload" => {
                if let Err(e) = self.reload() {
                    error!("無法重新載入設定: {}，沿用目前設定", e);
                }
            }
            "quit" => {
                self.close_all().await;
                self.dispatcher.dispatch("_client:quitReady", "");
                return false;
            }
            "_client:disconnected" => self.reap(signal).await,
            _ => {}
        }
        true
    }

    async fn on_connect(&mut self, signal: Signal) {
        let Some(target) = signal.first().map(str::to_string) else {
            error!("沒有指定 world 或 server");
            return;
        };
        let err = self
            .connect(&target)
            .await
            .err()
            .map(|e| SignalError::Relayed(e.to_string()));
        if let Some(e) = &err {
            error!("無法連線到 {}: {}", target, e);
        }
        let relayed = Signal {
            name: "_client:connect".to_string(),
            err,
            ..signal
        };
        self.dispatcher.direct_dispatch(relayed);
    }

    async fn on_disconnect(&mut self, signal: Signal) {
        let Some(args) = signal.first() else {
            return;
        };
        let parts: Vec<&str> = args.split_whitespace().collect();
        let (remove, target) = match parts.as_slice() {
            ["-r", target] => (true, target.to_string()),
            ["-r", ..] => {
                error!("disconnect 缺少 world: {:?}", signal.payload);
                return;
            }
            [target, ..] => (false, target.to_string()),
            [] => return,
        };

        self.close(&target).await;
        let relayed = Signal {
            name: "_client:disconnect".to_string(),
            ..signal
        };
        self.dispatcher.direct_dispatch(relayed);
        if remove {
            self.dispatcher.dispatch("_client:removeWorld", &target);
        }
    }

    /// 遠端斷線的連線已自行清除，這裡只把它移出列表
    async fn reap(&mut self, signal: Signal) {
        let Some(name) = signal.first() else {
            return;
        };
        let stale = self
            .connections
            .get(name)
            .is_some_and(|conn| !conn.is_connected());
        if !stale {
            return;
        }
        if let Some(mut conn) = self.connections.remove(name) {
            let _ = conn.close().await;
            debug!("已移除 {}", name);
        }
        if self.connections.is_empty() {
            self.dispatcher.dispatch("_client:allDisconnected", "");
        }
    }
}
