mod bogus;
mod cache;
mod config;
mod doh;
mod edns;
mod engine;
mod forwarder;
mod local;
mod tcp;
mod udp;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::engine::{Engine, Snapshot};

#[derive(Parser, Debug)]
#[command(author, version, about = "Caching DNS proxy with local overrides, domain forwarding and UDP/TCP/DoT/DoH upstreams", long_about = None)]
struct Args {
    /// 配置文件路径（YAML）
    #[arg(short = 'c', long = "config", default_value = "./dns-proxy.yaml")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = config::load_config(&args.config).context("load initial config")?;
    let snapshot = Snapshot::from_config(&cfg).context("build runtime state")?;
    snapshot.cache.spawn_sweeper();

    info!(
        target = "init",
        mode = ?cfg.upstream.mode,
        upstreams = ?cfg.upstream.addresses,
        "dns proxy starting"
    );
    if cfg.local.enable {
        info!(
            target = "init",
            hosts_file = cfg.local.use_hosts_file,
            records = snapshot.local.record_count(),
            "local resolver enabled"
        );
    }
    if cfg.forwarder.enable {
        info!(
            target = "init",
            rules = snapshot.forwarder.rule_count(),
            "forwarder enabled"
        );
    }
    if cfg.cache.size > 0 {
        info!(
            target = "init",
            size = cfg.cache.size,
            shards = cfg.cache.shards,
            min_ttl = cfg.cache.min_ttl,
            neg_ttl = cfg.cache.neg_ttl,
            "cache enabled"
        );
    }

    let snapshot = Arc::new(ArcSwap::from_pointee(snapshot));
    let engine = Engine::new(Arc::clone(&snapshot));

    for listen in &cfg.server.listen {
        let addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("parse listen address: {listen}"))?;

        let udp_socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("bind udp listener: {addr}"))?;
        let tcp_listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind tcp listener: {addr}"))?;

        info!(target = "init", listen = %addr, "listening on udp and tcp");

        let udp_engine = engine.clone();
        tokio::spawn(async move {
            serve_udp(Arc::new(udp_socket), udp_engine).await;
        });

        let tcp_engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_tcp(tcp_listener, tcp_engine).await {
                error!(error = %err, "tcp listener exited");
            }
        });
    }

    run_signals(&args.config, &snapshot).await?;

    snapshot.load().cache.stop();
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Receive loop for one UDP listener; every packet is handled on its
/// own task and the reply send is best effort.
async fn serve_udp(socket: Arc<UdpSocket>, engine: Engine) {
    let mut buf = vec![0u8; 65535];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let packet = Bytes::copy_from_slice(&buf[..len]);
                let engine = engine.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Ok(resp) = engine.handle_packet(&packet, peer).await {
                        let _ = socket.send_to(&resp, peer).await;
                    }
                });
            }
            Err(err) => {
                error!(error = %err, "udp recv failed");
            }
        }
    }
}

async fn serve_tcp(listener: TcpListener, engine: Engine) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, engine).await;
        });
    }
}

/// Length-prefixed request/response loop on one client connection.
/// Malformed frames or handler errors drop the connection; a client
/// closing between frames is a clean exit.
async fn handle_tcp_conn(mut stream: TcpStream, peer: SocketAddr, engine: Engine) -> Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = usize::from(u16::from_be_bytes(len_buf));
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let resp = match engine.handle_packet(&buf, peer).await {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };

        if resp.len() <= usize::from(u16::MAX) {
            let len_bytes = (resp.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&resp).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Blocks until SIGINT/SIGTERM. SIGHUP swaps in a freshly built
/// snapshot; a failed reload keeps the old one running.
#[cfg(unix)]
async fn run_signals(config_path: &Path, snapshot: &Arc<ArcSwap<Snapshot>>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => reload(config_path, snapshot),
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn run_signals(_config_path: &Path, _snapshot: &Arc<ArcSwap<Snapshot>>) -> Result<()> {
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    Ok(())
}

#[cfg(unix)]
fn reload(config_path: &Path, snapshot: &Arc<ArcSwap<Snapshot>>) {
    let rebuilt =
        config::load_config(config_path).and_then(|cfg| Snapshot::from_config(&cfg));

    match rebuilt {
        Ok(new_snapshot) => {
            new_snapshot.cache.spawn_sweeper();
            let old = snapshot.swap(Arc::new(new_snapshot));
            // the retired snapshot's sweeper must not outlive it
            old.cache.stop();
            info!(target = "reload", path = %config_path.display(), "configuration reloaded");
        }
        Err(err) => {
            error!(
                target = "reload",
                path = %config_path.display(),
                error = %err,
                "reload failed, keeping old config"
            );
        }
    }
}
