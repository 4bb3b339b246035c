//! duet-hub: WebSocket front end for the duet connection broker.
//!
//! Accepts full-duplex connections on `/ws`, parses each text frame into a
//! typed command and forwards it to the single broker task; see
//! [`broker_task`] for the serialization guarantee.

mod broker_task;

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use broker_task::{Command, ConnHandle};
use clap::Parser;
use duet_core::{
    wire::MAX_FRAME_BYTES, Broker, BrokerConfig, ClientMsg, ConnId, ErrorCode, ServerMsg,
};
use futures_util::{SinkExt, StreamExt};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    request_ttl_ms: u64,
    session_timeout_ms: u64,
    sweep_interval_ms: u64,
    ping_interval: Duration,
    write_timeout: Duration,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "duet-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long)]
    request_ttl_ms: Option<u64>,
    #[arg(long)]
    session_timeout_ms: Option<u64>,
    #[arg(long)]
    sweep_interval_ms: Option<u64>,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

struct AppState {
    config: Config,
    conn_counter: AtomicU64,
    commands: mpsc::Sender<Command>,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let broker = Broker::new(BrokerConfig {
        request_ttl: chrono::Duration::milliseconds(config.request_ttl_ms as i64),
        session_idle: chrono::Duration::milliseconds(config.session_timeout_ms as i64),
    });
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_interval = Duration::from_millis(config.sweep_interval_ms);
    let broker_task = tokio::spawn(broker_task::run(
        broker,
        cmd_rx,
        sweep_interval,
        shutdown_rx,
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        conn_counter: AtomicU64::new(0),
        commands: cmd_tx,
    });
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        request_ttl_ms = config.request_ttl_ms,
        session_timeout_ms = config.session_timeout_ms,
        sweep_interval_ms = config.sweep_interval_ms
    );

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }

    let _ = broker_task.await;
    info!(event = "hub_stop");
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_socket(state, socket, addr).await;
    })
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket, remote: SocketAddr) {
    let conn = ConnId(state.conn_counter.fetch_add(1, Ordering::SeqCst) + 1);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let write_timeout = state.config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return,
            }
        }
    });

    info!(event = "conn_open", conn_id = conn.0, remote = %remote);
    let handle = ConnHandle::new(tx.clone());
    spawn_ping(&state, tx.clone(), conn);

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", conn_id = conn.0, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "conn_close", conn_id = conn.0);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if data.len() > MAX_FRAME_BYTES {
            warn!(event = "frame_too_large", conn_id = conn.0, size = data.len());
            send_parse_error(&tx, "Frame too large").await;
            continue;
        }
        if state.config.debug {
            debug!(event = "frame_received", conn_id = conn.0, raw = %String::from_utf8_lossy(&data));
        }
        let msg: ClientMsg = match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "frame_invalid", conn_id = conn.0, error = %err);
                send_parse_error(&tx, "Bad JSON").await;
                continue;
            }
        };
        let command = Command::Frame {
            conn,
            handle: handle.clone(),
            msg,
        };
        if state.commands.send(command).await.is_err() {
            break;
        }
    }

    let _ = state.commands.send(Command::Disconnect { conn }).await;
    drop(tx);
    let _ = write_task.await;
}

/// Frame-level failures are answered from the read loop; the broker never
/// sees an unparseable command.
async fn send_parse_error(tx: &mpsc::Sender<Message>, message: &str) {
    let frame = ServerMsg::Error {
        code: ErrorCode::ParseError,
        message: message.to_string(),
    };
    if let Ok(raw) = serde_json::to_string(&frame) {
        let _ = tx.send(Message::Text(raw)).await;
    }
}

fn spawn_ping(state: &Arc<AppState>, tx: mpsc::Sender<Message>, conn: ConnId) {
    if state.config.ping_interval.is_zero() {
        return;
    }
    let interval = state.config.ping_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if tx.send(Message::Ping(Vec::new())).await.is_err() {
                debug!(event = "ping_stop", conn_id = conn.0);
                return;
            }
        }
    });
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        request_ttl_ms: resolve_ms(args.request_ttl_ms, "DUET_REQUEST_TTL_MS", 60_000),
        session_timeout_ms: resolve_ms(args.session_timeout_ms, "DUET_SESSION_TIMEOUT_MS", 600_000),
        sweep_interval_ms: resolve_ms(args.sweep_interval_ms, "DUET_SWEEP_INTERVAL_MS", 30_000),
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        debug: args.debug || env_true("DUET_DEBUG"),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("DUET_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "127.0.0.1:8080".to_string()
}

fn resolve_ms(flag: Option<u64>, env_key: &str, default: u64) -> u64 {
    if let Some(value) = flag {
        return value;
    }
    if let Ok(value) = std::env::var(env_key) {
        if let Ok(parsed) = value.trim().parse() {
            return parsed;
        }
    }
    default
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    std::env::var("DUET_LOG_DIR").unwrap_or_default()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("DUET_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join("duet-hub.log");
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
