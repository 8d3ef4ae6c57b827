//! 事件分派器
//!
//! 每個監聽者擁有一個有界佇列。廣播時先嘗試直接放入佇列；
//! 佇列滿了就把 signal 放進該監聽者的積壓，由一個投遞任務依序送出，
//! 每筆最多等待 `DELIVERY_TIMEOUT`，逾時則丟棄並記錄警告。
//! 積壓未清空前，後來的 signal 一律排在積壓後面，同一監聽者收到的順序與分派順序相同。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use tracing::{debug, trace, warn};

use super::{Builtins, Signal, SignalError};

/// 每個監聽者佇列的容量，也是積壓的上限
pub const LISTENER_QUEUE: usize = 64;

/// 佇列已滿時，投遞任務每筆最多等待的時間
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// 事件分派器
#[derive(Debug)]
pub struct Dispatcher {
    builtins: Builtins,
    listeners: RwLock<HashMap<String, Listener>>,
    delivery_timeout: Duration,
}

#[derive(Debug, Clone)]
struct Listener {
    tx: mpsc::Sender<Signal>,
    backlog: Arc<Mutex<Backlog>>,
}

#[derive(Debug, Default)]
struct Backlog {
    pending: VecDeque<Signal>,
    /// 有投遞任務正在清空積壓
    draining: bool,
}

impl Listener {
    fn new(tx: mpsc::Sender<Signal>) -> Self {
        Self {
            tx,
            backlog: Arc::new(Mutex::new(Backlog::default())),
        }
    }

    fn backlog(&self) -> MutexGuard<'_, Backlog> {
        self.backlog.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Dispatcher {
    /// 以指定的內建命令表創建分派器
    pub fn new(builtins: Builtins) -> Self {
        Self {
            builtins,
            listeners: RwLock::new(HashMap::new()),
            delivery_timeout: DELIVERY_TIMEOUT,
        }
    }

    /// 設定佇列已滿時的等待上限
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// 註冊監聽者；同一 id 重複註冊會取代舊的佇列
    pub fn register_listener(&self, id: impl Into<String>, queue: mpsc::Sender<Signal>) {
        let id = id.into();
        debug!("註冊監聽者 {}", id);
        self.write_listeners().insert(id, Listener::new(queue));
    }

    /// 建立預設容量的佇列並註冊，回傳接收端
    pub fn listener(&self, id: impl Into<String>) -> mpsc::Receiver<Signal> {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE);
        self.register_listener(id, tx);
        rx
    }

    /// 移除監聽者，回傳是否存在
    pub fn unregister_listener(&self, id: &str) -> bool {
        debug!("移除監聽者 {}", id);
        self.write_listeners().remove(id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.read_listeners().len()
    }

    /// 解析命令但不廣播
    ///
    /// 名稱與參數的前後空白會被去除。內建命令拒絕時保留它切出的 payload；
    /// 找不到內建命令時，原始參數成為唯一的 payload，並附上 `UnknownCommand` 錯誤。
    pub fn parse(&self, name: &str, args: &str) -> Signal {
        let name = name.trim();
        let args = args.trim();

        match self.builtins.get(name) {
            Some(builtin) => match builtin(args) {
                Ok(payload) => Signal::new(name, payload),
                Err(rejected) => Signal::new(name, rejected.payload).with_err(Some(rejected.err)),
            },
            None => Signal::new(name, vec![args.to_string()])
                .with_err(Some(SignalError::UnknownCommand(name.to_string()))),
        }
    }

    /// 解析並廣播
    pub fn dispatch(&self, name: &str, args: &str) {
        self.direct_dispatch(self.parse(name, args));
    }

    /// 解析並廣播，標記來源連線
    pub fn dispatch_from(&self, origin: &str, name: &str, args: &str) {
        let signal = self.parse(name, args).with_origin(Some(origin.to_string()));
        self.direct_dispatch(signal);
    }

    /// 不重新解析，直接把完整的 Signal 送給所有監聽者
    pub fn direct_dispatch(&self, signal: Signal) {
        let listeners: Vec<(String, Listener)> = self
            .read_listeners()
            .iter()
            .map(|(id, listener)| (id.clone(), listener.clone()))
            .collect();
        trace!("分派 {:?} 給 {} 個監聽者", signal, listeners.len());

        let mut closed = Vec::new();
        for (id, listener) in listeners {
            if !self.deliver(&id, &listener, signal.clone()) {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            let mut listeners = self.write_listeners();
            for id in closed {
                debug!("監聽者 {} 已關閉，移除", id);
                // 只移除仍然關閉的佇列，避免誤刪剛以同 id 重新註冊的監聽者
                if listeners.get(&id).is_some_and(|l| l.tx.is_closed()) {
                    listeners.remove(&id);
                }
            }
        }
    }

    /// 送給單一監聽者；佇列已關閉時回傳 false
    fn deliver(&self, id: &str, listener: &Listener, signal: Signal) -> bool {
        let mut backlog = listener.backlog();
        if backlog.draining {
            if backlog.pending.len() >= LISTENER_QUEUE {
                warn!("監聽者 {} 的積壓已滿，丟棄 {}", id, signal.name);
            } else {
                trace!("監聽者 {} 仍有積壓，{} 排在後面", id, signal.name);
                backlog.pending.push_back(signal);
            }
            return true;
        }

        match listener.tx.try_send(signal) {
            Ok(()) => {
                trace!("已分派給 {}", id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(signal)) => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    warn!("監聽者 {} 的佇列已滿且沒有執行環境，丟棄 {}", id, signal.name);
                    return true;
                };
                backlog.pending.push_back(signal);
                backlog.draining = true;
                handle.spawn(drain(id.to_string(), listener.clone(), self.delivery_timeout));
                true
            }
        }
    }

    fn read_listeners(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Listener>> {
        self.listeners.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_listeners(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Listener>> {
        self.listeners.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 依序送出積壓，清空後解除 `draining`
async fn drain(id: String, listener: Listener, timeout: Duration) {
    loop {
        let signal = {
            let mut backlog = listener.backlog();
            match backlog.pending.pop_front() {
                Some(signal) => signal,
                None => {
                    backlog.draining = false;
                    return;
                }
            }
        };

        let name = signal.name.clone();
        match listener.tx.send_timeout(signal, timeout).await {
            Ok(()) => trace!("已補送 {} 給 {}", name, id),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!("監聽者 {} 未在時限內取走 {}，丟棄", id, name);
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!("監聽者 {} 已關閉，放棄積壓", id);
                let mut backlog = listener.backlog();
                backlog.pending.clear();
                backlog.draining = false;
                return;
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Builtins::default())
    }
}
