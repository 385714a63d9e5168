mod dispatch;
mod sessions;
mod store;
mod stream_uds;

use anyhow::{bail, Context};
use clap::Parser;
use dispatch::Dispatcher;
use sessions::{SessionHost, SessionHostConfig};
use sha2::{Digest, Sha256};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use store::TaskStore;
use stream_uds::StreamUdsConfig;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_BRIDGE: &str = "hcp-pty-bridge";

#[derive(Clone, Debug)]
struct Config {
    socket_path: PathBuf,
    auth_token: Option<String>,
    bridge: PathBuf,
    repositories: Vec<PathBuf>,
    debug: bool,
    log_dir: String,
    write_timeout: Duration,
    queue_capacity: usize,
}

#[derive(Parser, Debug)]
#[command(name = "hcp-hub")]
struct Args {
    #[arg(long, default_value = "")]
    socket: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value = "")]
    token_file: String,
    #[arg(long, default_value = "")]
    bridge: String,
    /// Local checkout to register at startup; repeatable.
    #[arg(long = "repository")]
    repositories: Vec<PathBuf>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(Args::parse())?;
    let log_tee = init_logging(&config);

    let store = Arc::new(TaskStore::default());
    for path in &config.repositories {
        store.register_repository(path).await;
    }
    let sessions = Arc::new(SessionHost::new(SessionHostConfig::new(
        config.bridge.clone(),
    )));
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), sessions.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    info!(
        event = "hub_start",
        socket = %config.socket_path.display(),
        bridge = %config.bridge.display(),
        repositories = config.repositories.len(),
        log_file = ?log_tee.path,
        observed_cursor = store.last_cursor().await
    );

    let mut uds_config = StreamUdsConfig::new(config.socket_path.clone());
    uds_config.auth_token = config.auth_token.clone();
    uds_config.write_timeout = config.write_timeout;
    uds_config.queue_capacity = config.queue_capacity;
    let result = stream_uds::run(uds_config, dispatcher, shutdown_rx).await;
    sessions.shutdown().await;
    if let Err(err) = &result {
        error!(event = "hub_error", error = %err);
    }
    result.context("stream socket failed")
}

fn load_config(args: Args) -> anyhow::Result<Config> {
    let auth_token = resolve_token(&args.token, &args.token_file)?;
    let bridge = non_empty_or_env(&args.bridge, "HCP_BRIDGE")
        .unwrap_or_else(|| DEFAULT_BRIDGE.to_string());
    let repositories = args
        .repositories
        .into_iter()
        .map(|path| std::fs::canonicalize(&path).unwrap_or(path))
        .collect();
    Ok(Config {
        socket_path: resolve_socket(&args.socket),
        auth_token,
        bridge: PathBuf::from(bridge),
        repositories,
        debug: args.debug || env_true("HCP_DEBUG"),
        log_dir: non_empty_or_env(&args.log_dir, "HCP_LOG_DIR").unwrap_or_default(),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        queue_capacity: args.queue_capacity.max(1),
    })
}

fn resolve_token(token_flag: &str, token_file: &str) -> anyhow::Result<Option<String>> {
    if !token_flag.trim().is_empty() {
        return Ok(Some(token_flag.trim().to_string()));
    }
    if !token_file.trim().is_empty() {
        let raw = std::fs::read_to_string(token_file)
            .with_context(|| format!("failed to read token file {token_file}"))?;
        let token = raw.trim();
        if token.is_empty() {
            bail!("token file {token_file} is empty");
        }
        return Ok(Some(token.to_string()));
    }
    Ok(non_empty_or_env("", "HCP_AUTH_TOKEN"))
}

fn resolve_socket(socket_flag: &str) -> PathBuf {
    if let Some(value) = non_empty_or_env(socket_flag, "HCP_SOCKET") {
        return PathBuf::from(value);
    }
    let base = std::env::var("XDG_RUNTIME_DIR")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    base.join("hcp").join("hub.sock")
}

fn non_empty_or_env(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_true(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn init_logging(config: &Config) -> LogTee {
    let level = if config.debug {
        "debug".to_string()
    } else {
        std::env::var("HCP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let tee = LogTee::open(&config.log_dir, &config.socket_path).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        LogTee::default()
    });
    let writer = tee.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(move || writer.clone()))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("log_subscriber_already_set");
    }
    tee
}

/// Log file named after the socket it serves, so hubs sharing a log
/// directory keep separate files.
fn log_file_name(socket_path: &Path) -> String {
    let stem = socket_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "hub".to_string());
    let digest = Sha256::digest(socket_path.to_string_lossy().as_bytes());
    let tag = digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("hcp-hub-{stem}-{tag}.log")
}

/// Copies every formatted line to stdout and, when a log directory is set,
/// to the socket's log file.
#[derive(Clone, Default)]
struct LogTee {
    file: Option<Arc<Mutex<File>>>,
    path: Option<PathBuf>,
}

impl LogTee {
    fn open(log_dir: &str, socket_path: &Path) -> io::Result<Self> {
        if log_dir.trim().is_empty() {
            return Ok(Self::default());
        }
        let dir = PathBuf::from(log_dir);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(log_file_name(socket_path));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
            path: Some(path),
        })
    }

    fn with_file(&self, op: impl FnOnce(&mut File) -> io::Result<()>) {
        let Some(file) = &self.file else {
            return;
        };
        if let Ok(mut file) = file.lock() {
            let _ = op(&mut file);
        }
    }
}

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().write_all(buf);
        self.with_file(|file| file.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        self.with_file(|file| file.flush());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("hcp-hub-main-test-{name}-{nanos}"))
    }

    #[test]
    fn flags_parse_with_defaults() {
        let args = Args::parse_from([
            "hcp-hub",
            "--socket",
            "/tmp/hcp-test/hub.sock",
            "--token",
            " secret ",
            "--bridge",
            "/usr/local/bin/bridge",
            "--repository",
            "/nonexistent/a",
            "--repository",
            "/nonexistent/b",
        ]);
        let config = load_config(args).expect("config");
        assert_eq!(config.socket_path, PathBuf::from("/tmp/hcp-test/hub.sock"));
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.bridge, PathBuf::from("/usr/local/bin/bridge"));
        assert_eq!(
            config.repositories,
            vec![PathBuf::from("/nonexistent/a"), PathBuf::from("/nonexistent/b")]
        );
        assert_eq!(config.write_timeout, Duration::from_secs(2));
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn token_file_is_trimmed_and_must_not_be_empty() {
        let dir = scratch_dir("token");
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("token");

        std::fs::write(&path, "from-file\n").expect("write");
        let token = resolve_token("", path.to_str().expect("utf8 path")).expect("token");
        assert_eq!(token.as_deref(), Some("from-file"));

        std::fs::write(&path, "  \n").expect("write");
        assert!(resolve_token("", path.to_str().expect("utf8 path")).is_err());
        assert!(resolve_token("", "/nonexistent/hcp-token").is_err());
        assert_eq!(
            resolve_token("flag", "/nonexistent/hcp-token").expect("flag wins"),
            Some("flag".to_string())
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn log_file_is_created_only_with_a_directory() {
        let socket = Path::new("/run/hcp/hub.sock");
        let tee = LogTee::open("  ", socket).expect("no dir");
        assert!(tee.file.is_none() && tee.path.is_none());

        let dir = scratch_dir("logs");
        let mut tee = LogTee::open(dir.to_str().expect("utf8 path"), socket).expect("log file");
        let path = tee.path.clone().expect("path");
        assert_eq!(path, dir.join(log_file_name(socket)));
        tee.write_all(b"hub_start\n").expect("write");
        tee.flush().expect("flush");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "hub_start\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn log_files_are_keyed_by_socket() {
        let default = log_file_name(Path::new("/run/hcp/hub.sock"));
        assert!(default.starts_with("hcp-hub-hub-") && default.ends_with(".log"));
        assert_eq!(default, log_file_name(Path::new("/run/hcp/hub.sock")));
        assert_ne!(default, log_file_name(Path::new("/tmp/hcp/hub.sock")));
        assert!(log_file_name(Path::new("/tmp/staging.sock")).starts_with("hcp-hub-staging-"));
        assert!(log_file_name(Path::new("/")).starts_with("hcp-hub-hub-"));
    }
}
