//! Service wiring: runtime preparation, accept loop, signals, shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use pool::{monitor_loop, Catalog, HostPaths, Pool, PoolConfig};
use runtime::docker::DockerRuntime;
use runtime::{ContainerRuntime, MountKind};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ServerError;
use crate::session::{SessionConfig, SessionDriver};
use crate::status::{ServerMode, StatusTracker};
use crate::transport::{self, INBOUND_CAPACITY, OUTBOUND_CAPACITY};

#[derive(Args)]
pub struct ServeArgs {
    /// Address to accept WebSocket sessions on
    #[arg(long, env = "CODESERVER_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,
    /// Base directory for sources, build outputs, and the status file
    #[arg(long, env = "CODESERVER_BASE_DIR", default_value = pool::DEFAULT_BASE_DIR)]
    base_dir: PathBuf,
    /// Language assumed when a session's URL does not name one
    #[arg(long, env = "CODESERVER_DEFAULT_LANG", default_value = "cpp")]
    default_lang: String,
    /// Seats per sandbox before a new one is provisioned
    #[arg(long, default_value_t = 2)]
    max_users: usize,
    /// Seconds between resource controller ticks
    #[arg(long, default_value_t = 300)]
    monitoring_interval_secs: u64,
    /// Hard cap on a single execution, in seconds
    #[arg(long, default_value_t = 300)]
    exec_timeout_secs: u64,
}

/// Build the service from CLI args and run it until a signal stops it.
pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    let paths = HostPaths::new(args.base_dir.clone());
    paths.ensure().await?;

    let runtime = Arc::new(DockerRuntime::new()?);
    let catalog = Arc::new(Catalog::builtin(&paths));
    catalog
        .get(&args.default_lang)
        .map_err(|e| ServerError::Config(e.to_string()))?;

    info!("preparing images and volumes");
    prepare(runtime.as_ref(), &catalog).await?;

    let pool_config = PoolConfig {
        max_users: args.max_users,
        monitoring_interval: Duration::from_secs(args.monitoring_interval_secs),
        ..Default::default()
    };
    let pool = Arc::new(Pool::new(
        Arc::clone(&runtime),
        Arc::clone(&catalog),
        pool_config,
    ));

    let session_config = SessionConfig {
        exec_timeout: Duration::from_secs(args.exec_timeout_secs),
        ..Default::default()
    };

    let shutdown = CancellationToken::new();
    spawn_signal_task(shutdown.clone());

    let monitor = tokio::spawn(monitor_loop(Arc::clone(&pool), shutdown.clone()));

    let status = Arc::new(StatusTracker::new(args.base_dir.join("status.json")));
    status.write_initial().await;

    let listener = TcpListener::bind(args.listen).await?;
    info!(listen = %args.listen, default_lang = %args.default_lang, "accepting sessions");

    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    error!(error = %e, "session task panicked");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    sessions.spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&pool),
                        Arc::clone(&runtime),
                        paths.clone(),
                        args.default_lang.clone(),
                        session_config.clone(),
                        Arc::clone(&status),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Graceful shutdown: drain sessions, stop the controller, destroy
    // sandboxes, clear working files.
    // -----------------------------------------------------------------------
    status.set_mode(ServerMode::Stopping).await;
    drop(listener);

    let remaining = sessions.len();
    if remaining > 0 {
        info!(remaining, "waiting for sessions to wind down");
    }
    while let Some(finished) = sessions.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "session task panicked during drain");
        }
    }

    let _ = monitor.await;
    pool.shutdown().await;
    paths.clear().await;

    status.set_mode(ServerMode::Stopped).await;
    info!("server stopped");
    Ok(())
}

/// Pull every catalog image and create every named volume up front, so the
/// first session of each language doesn't pay for it.
async fn prepare<R: ContainerRuntime>(runtime: &R, catalog: &Catalog) -> Result<(), ServerError> {
    for spec in catalog.specs() {
        runtime.ensure_image(&spec.image).await?;
        for mount in &spec.mounts {
            if mount.kind == MountKind::Volume {
                runtime.ensure_volume(&mount.source).await?;
            }
        }
    }
    Ok(())
}

fn spawn_signal_task(shutdown: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = recv_signal(&mut sigterm) => info!("received SIGTERM, stopping"),
            _ = recv_signal(&mut sigint) => info!("received SIGINT, stopping"),
        }
        shutdown.cancel();
    });
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pool: Arc<Pool<DockerRuntime>>,
    runtime: Arc<DockerRuntime>,
    paths: HostPaths,
    default_lang: String,
    session_config: SessionConfig,
    status: Arc<StatusTracker>,
    shutdown: CancellationToken,
) {
    let mut lang: Option<String> = None;
    let ws = match tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        lang = req
            .uri()
            .query()
            .and_then(transport::lang_from_query);
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };

    let lang = lang.unwrap_or(default_lang);
    info!(%peer, %lang, "session connected");
    status.session_started().await;

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let bridge = tokio::spawn(transport::drive_websocket(ws, outbound_rx, inbound_tx));

    let driver = SessionDriver::new(
        pool,
        runtime,
        paths,
        lang,
        session_config,
        outbound_tx,
        inbound_rx,
    );
    match driver.run(shutdown.child_token()).await {
        Ok(()) => info!(%peer, "session closed"),
        Err(e) => warn!(%peer, error = %e, "session failed"),
    }

    // The driver dropped its outbound sender; the bridge drains and closes
    // the socket.
    let _ = bridge.await;
    status.session_ended().await;
}
