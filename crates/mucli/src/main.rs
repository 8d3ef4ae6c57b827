//! MU* Client 終端機程式
//!
//! 開啟命令列指定的 world，把輸出印到 stdout，
//! 並把 stdin 的每一行寫進目前連線的交接檔。

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mucore::connection::{append_line, handoff_path};
use mucore::{Client, Config, Dirs, Dispatcher, Signal, SignalError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONFIG_FILE: &str = "mucli.json";

#[derive(Debug, Parser)]
#[command(version, about = "Headless MU* client")]
struct Args {
    /// 設定檔；可指定多次，後者覆蓋前者
    #[arg(short, long = "config", value_name = "FILE")]
    configs: Vec<PathBuf>,

    /// 覆蓋設定中的日誌層級
    #[arg(long)]
    log_level: Option<String>,

    /// 啟動時連線的 world、server 或 host:port
    worlds: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 載入設定
    let dirs = Dirs::discover();
    let paths = if args.configs.is_empty() {
        vec![dirs.config.join(CONFIG_FILE)]
    } else {
        args.configs.clone()
    };
    let config = Config::load(&paths, dirs)
        .with_context(|| format!("無法載入設定 {:?}", paths))?;

    // 初始化日誌；stdout 留給伺服器輸出
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.client.syslog.log_level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
    info!("設定已載入: {:?}", paths);

    let working_dir = config.dirs.working.clone();
    let dispatcher = Arc::new(Dispatcher::default());
    let client_rx = dispatcher.listener("client");
    let headless_rx = dispatcher.listener("headless");

    let mut client = Client::new(config, paths, dispatcher.clone());
    client.add_default_output("stdout", true, |_| Box::new(io::stdout()));

    let (current_tx, current_rx) = watch::channel(None::<String>);
    let headless = tokio::spawn(follow_signals(headless_rx, current_tx));
    let input = tokio::spawn(forward_stdin(
        dispatcher.clone(),
        current_rx,
        working_dir,
    ));
    let interrupt = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("收到中斷，準備結束");
                dispatcher.dispatch("quit", "");
            }
        })
    };

    for world in &args.worlds {
        dispatcher.dispatch("connect", world);
    }

    client.run(client_rx).await;

    input.abort();
    interrupt.abort();
    let _ = headless.await;
    Ok(())
}

// ============================================================================
// Signal 顯示
// ============================================================================

/// 追蹤目前連線並顯示需要給使用者看的 signal
async fn follow_signals(mut rx: mpsc::Receiver<Signal>, current: watch::Sender<Option<String>>) {
    let mut open: Vec<String> = Vec::new();

    while let Some(signal) = rx.recv().await {
        if let Some(notice) = unknown_command_notice(&signal) {
            eprintln!("{}", notice);
            continue;
        }

        match signal.name.as_str() {
            "_client:connect" => match (&signal.err, signal.first()) {
                (None, Some(name)) => {
                    if !open.iter().any(|n| n == name) {
                        open.push(name.to_string());
                    }
                    current.send_replace(Some(name.to_string()));
                    eprintln!("已連線到 {}", name);
                }
                (Some(e), name) => eprintln!("無法連線到 {}: {}", name.unwrap_or(""), e),
                _ => {}
            },
            "_client:disconnected" => {
                if let Some(name) = signal.first() {
                    open.retain(|n| n != name);
                    eprintln!("{} 已斷線", name);
                    let next = open.first().cloned();
                    current.send_if_modified(|cur| {
                        if cur.as_deref() == Some(name) {
                            *cur = next;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
            "fg" => {
                let now = current.borrow().clone();
                if let Some(name) = switch_target(&open, now.as_deref(), &signal.payload) {
                    eprintln!("切換到 {}", name);
                    current.send_replace(Some(name));
                }
            }
            "_client:showModal" => {
                let title = signal.payload.first().map(String::as_str).unwrap_or("");
                println!("== {} ==", title);
                for body in signal.payload.iter().skip(1) {
                    println!("{}", body);
                }
            }
            "help" => println!("{}", help_text(signal.first().unwrap_or(""))),
            "_client:quitReady" => break,
            _ => {}
        }
    }
    debug!("signal 顯示結束");
}

fn unknown_command_notice(signal: &Signal) -> Option<String> {
    match &signal.err {
        Some(SignalError::UnknownCommand(name)) => Some(format!("未知的命令: /{}", name)),
        _ => None,
    }
}

/// `fg` 的 payload 是 `["rotate", n]` 或 `["switch", name]`
fn switch_target(open: &[String], current: Option<&str>, payload: &[String]) -> Option<String> {
    if open.is_empty() {
        return None;
    }
    match payload {
        [kind, name] if kind == "switch" => open.iter().find(|n| *n == name).cloned(),
        [kind, step] if kind == "rotate" => {
            let step: isize = step.parse().ok()?;
            let len = open.len() as isize;
            let at = current
                .and_then(|cur| open.iter().position(|n| n == cur))
                .unwrap_or(0) as isize;
            let next = (at + step).rem_euclid(len) as usize;
            Some(open[next].clone())
        }
        _ => None,
    }
}

fn help_text(topic: &str) -> &'static str {
    match topic {
        "log" => {
            "/log <file>        開始記錄到檔案\n\
             /log --off <file>  停止記錄\n\
             /log --list        列出目前的記錄檔"
        }
        "fg" => "/fg <world>  切換目前連線；/fg < 與 /fg > 輪替",
        _ => {
            "/connect <world>  連線\n\
             /disconnect [-r] <world>  斷線\n\
             /fg <world>  切換目前連線\n\
             /log  記錄（/help log）\n\
             /reload  重新載入設定\n\
             /quit  結束"
        }
    }
}

// ============================================================================
// 輸入
// ============================================================================

/// 有連線時寫入交接檔，否則 `/` 開頭的命令直接送給 dispatcher
async fn forward_stdin(
    dispatcher: Arc<Dispatcher>,
    current: watch::Receiver<Option<String>>,
    working_dir: PathBuf,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("讀取 stdin 失敗: {}", e);
                break;
            }
        };

        let target = current.borrow().clone();
        match target {
            Some(name) => {
                let path = handoff_path(&working_dir, &name);
                if let Err(e) = append_line(&path, line.as_bytes()) {
                    warn!("無法寫入 {}: {}", name, e);
                    dispatch_local(&dispatcher, &line);
                }
            }
            None => {
                if !dispatch_local(&dispatcher, &line) {
                    eprintln!("尚未連線；用 /connect <world> 開始");
                }
            }
        }
    }

    debug!("stdin 結束");
    dispatcher.dispatch("quit", "");
}

/// 處理 `/` 開頭的行；不是命令時回傳 false
fn dispatch_local(dispatcher: &Dispatcher, line: &str) -> bool {
    let Some(command) = line.strip_prefix('/') else {
        return false;
    };
    let (name, args) = command.split_once(' ').unwrap_or((command, ""));
    dispatcher.dispatch(name, args);
    true
}
