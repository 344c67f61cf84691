// dash_share - Shareable view-state links for weather dashboards
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::Parser;
use dash_share::backend::{Backend, FileBackend, MemoryBackend};
use dash_share::http::{RequestContext, DEFAULT_MAX_BODY_BYTES};
use dash_share::snapshot::StateSnapshot;
use dash_share::store::{ShareStateStore, DEFAULT_MAX_ATTEMPTS};
use std::error::Error;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9783);
const DEFAULT_PUBLIC_URL: &str = "http://localhost:8050/";

#[derive(Debug, Parser)]
#[clap(name = "dash_share", version = clap::crate_version!())]
struct DashShareApplication {
    /// Directory to store shared views in. Created if it doesn't exist.
    #[clap(long, required_unless_present = "memory", conflicts_with = "memory")]
    storage_dir: Option<PathBuf>,

    /// Keep shared views in memory instead of on disk. All shared views are lost when
    /// dash_share exits.
    #[clap(long)]
    memory: bool,

    /// Dashboard URL that share links point at. The share token is appended as the
    /// 'state' query parameter.
    #[clap(long, default_value_t = DEFAULT_PUBLIC_URL.into())]
    public_url: String,

    /// Path to a JSON object used as the view when no shared view is requested or the
    /// requested one can't be restored. An empty object is used if not set.
    #[clap(long)]
    default_state: Option<PathBuf>,

    /// Number of share tokens to try before giving up when a generated token is already taken.
    #[clap(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Largest accepted view, in bytes.
    #[clap(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to. By default, dash_share will bind to public address since
    /// dashboards typically run on another host.
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = DashShareApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let memory = if opts.memory { Some(Arc::new(MemoryBackend::new())) } else { None };
    let backend: Arc<dyn Backend> = match (&opts.storage_dir, &memory) {
        (Some(dir), _) => {
            let backend = FileBackend::new(dir).unwrap_or_else(|e| {
                tracing::error!(message = "unable to initialize storage directory", path = %dir.display(), error = %e);
                process::exit(1)
            });
            tracing::info!(message = "storing shared views on disk", path = %backend.root().display());
            Arc::new(backend)
        }
        (None, Some(m)) => {
            tracing::warn!("storing shared views in memory, they will be lost on exit");
            m.clone()
        }
        (None, None) => {
            tracing::error!("one of --storage-dir or --memory is required");
            process::exit(1)
        }
    };

    let default_state = match &opts.default_state {
        Some(path) => read_default_state(path).unwrap_or_else(|e| {
            tracing::error!(message = "unable to read default state", path = %path.display(), error = %e);
            process::exit(1)
        }),
        None => StateSnapshot::default(),
    };

    let store = ShareStateStore::new(backend).with_max_attempts(opts.max_attempts);
    let context = Arc::new(RequestContext::new(store, default_state, &opts.public_url));
    let app = dash_share::http::router(context, opts.max_body_bytes);

    let server = axum::Server::try_bind(&opts.bind)
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
            process::exit(1)
        })
        .serve(app.into_make_service());

    tracing::info!(message = "server started", address = %server.local_addr(), public_url = %opts.public_url);
    server
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    if let Some(m) = memory {
        tracing::info!(message = "discarding in-memory shared views", num_views = m.len());
    }

    tracing::info!("server shutdown");
    Ok(())
}

fn read_default_state(path: &Path) -> Result<StateSnapshot, Box<dyn Error + Send + Sync>> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
