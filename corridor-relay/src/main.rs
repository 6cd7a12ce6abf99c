use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use corridor_core::{STALE_CONNECTION_MS, STALE_SWEEP_INTERVAL_MS};
use corridor_relay::{
    AppState, FileRoomStore, MemoryRoomStore, RelaySettings, RoomStore, serve,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "corridor-relay")]
struct RelayArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: String,

    /// Directory for room history files. Rooms live in memory only when unset.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = STALE_CONNECTION_MS)]
    stale_after_ms: u64,

    #[arg(long, default_value_t = STALE_SWEEP_INTERVAL_MS)]
    sweep_interval_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = RelayArgs::parse();

    let store: Arc<dyn RoomStore> = match &args.data_dir {
        Some(dir) => match FileRoomStore::new(dir) {
            Ok(store) => {
                info!("persisting rooms under {}", dir.display());
                Arc::new(store)
            }
            Err(err) => {
                error!("failed to open data dir {}: {}", dir.display(), err);
                std::process::exit(1);
            }
        },
        None => {
            warn!("no --data-dir given; room history is kept in memory only");
            Arc::new(MemoryRoomStore::new())
        }
    };

    let settings = RelaySettings {
        stale_after: Duration::from_millis(args.stale_after_ms.max(1)),
        sweep_interval: Duration::from_millis(args.sweep_interval_ms.max(1)),
    };

    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!("relay starting on {}", args.bind_address);
    if let Err(err) = serve(listener, AppState::with_store(store, settings)).await {
        warn!("relay server exited: {}", err);
    }
}
