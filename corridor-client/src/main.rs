use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    sync::{Arc, Mutex},
};

use clap::Parser;
use corridor_client::{
    ClientConfig, ClientEvent, ConnectionManager, SystemClipboard,
    config::{config_path, load_config_from_path, log_path, save_config_with_retry},
};
use corridor_core::preview_text;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Parser, Debug, Clone)]
#[command(name = "corridor")]
struct ClientArgs {
    /// Room token shared by all of this user's devices.
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    websocket_url: Option<String>,
    #[arg(long)]
    http_url: Option<String>,

    /// Write the effective config back to disk before starting.
    #[arg(long, default_value_t = false)]
    save: bool,

    /// Log to stderr instead of the log file.
    #[arg(long, default_value_t = false)]
    foreground: bool,
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging(foreground: bool) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    if foreground {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return;
    }

    let log_path = log_path();
    let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .init();
}

fn resolve_config(args: &ClientArgs) -> Result<ClientConfig, String> {
    let path = config_path();
    let mut config = load_config_from_path(&path)
        .map_err(|err| format!("failed to load config {}: {err}", path.display()))?
        .unwrap_or_default();

    if let Some(token) = &args.token {
        config.token = token.trim().to_owned();
    }
    if let Some(url) = &args.websocket_url {
        config.websocket_url = url.trim().to_owned();
    }
    if let Some(url) = &args.http_url {
        config.http_url = url.trim().to_owned();
    }

    config.validate().map_err(|err| err.to_string())?;

    if args.save {
        save_config_with_retry(&path, &config)
            .map_err(|err| format!("failed to save config {}: {err}", path.display()))?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    init_logging(args.foreground);

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let (manager, mut events) = match ConnectionManager::start(config, Arc::new(SystemClipboard)) {
        Ok(started) => started,
        Err(err) => {
            error!("failed to start: {err}");
            eprintln!("failed to start: {err}");
            std::process::exit(1);
        }
    };

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::StateChanged(state) => info!(%state, "status"),
                ClientEvent::ClipboardReceived { content } => {
                    info!(preview = %preview_text(&content, 48), "clipboard updated from another device");
                }
                ClientEvent::ContentRejected { length, max } => {
                    warn!(length, max, "clipboard content not synced: over size limit");
                }
            }
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
    }

    info!("shutting down");
    manager.stop().await;
    let _ = event_task.await;
}
