mod cache;
mod clock;
mod config;
mod engine;
mod error;
mod message;
mod proto_utils;
mod ratelimit;
mod records;
mod resolver;
mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::AnswerCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{ServerConfig, load_config};
use crate::engine::Engine;
use crate::ratelimit::RateLimiter;
use crate::records::RecordRegistry;
use crate::resolver::Resolver;
use crate::upstream::{UdpUpstream, Upstream};

#[derive(Parser, Debug)]
#[command(author, version, about = "Rate-limited caching DNS forwarder", long_about = None)]
struct Args {
    /// JSON config file; built-in defaults apply without one.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// UDP listen address, overrides the config file.
    #[arg(long = "bind")]
    bind: Option<String>,
    /// Upstream resolver address, overrides config file and UPSTREAM_DNS.
    #[arg(long = "upstream")]
    upstream: Option<String>,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP receive loops (default: one per CPU core)
    #[arg(long = "udp-workers")]
    udp_workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut cfg = load_config(args.config.as_deref()).context("load config")?;
    if let Some(bind) = args.bind {
        cfg.bind_udp = bind;
    }
    if let Some(upstream) = args.upstream {
        cfg.upstream = upstream;
    }
    if let Some(workers) = args.udp_workers {
        cfg.udp_workers = workers;
    }
    cfg.validate().context("validate config")?;

    let bind_addr = cfg.bind_addr()?;
    let (engine, sweeper) = build_engine(&cfg)?;

    let udp_workers = if cfg.udp_workers > 0 {
        cfg.udp_workers
    } else {
        num_cpus::get()
    };

    info!(
        bind_udp = %bind_addr,
        upstream = %cfg.upstream,
        udp_workers,
        rate_limit_capacity = cfg.rate_limit.capacity,
        rate_limit_refill_ms = cfg.rate_limit.refill_ms,
        "dns server started"
    );

    let mut handles = Vec::with_capacity(udp_workers + 2);
    handles.push(sweeper);

    #[cfg(unix)]
    {
        // One SO_REUSEPORT socket per worker; the kernel spreads datagrams.
        for worker_id in 0..udp_workers {
            let std_socket = create_reuseport_udp_socket(bind_addr)
                .with_context(|| format!("create udp socket for worker {}", worker_id))?;
            let socket = Arc::new(UdpSocket::from_std(std_socket)?);
            handles.push(spawn_worker(worker_id, socket, engine.clone(), cfg.max_datagram_size));
        }
    }

    #[cfg(not(unix))]
    {
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&bind_addr.into()).context("bind socket")?;

        let shared = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        for worker_id in 0..udp_workers {
            handles.push(spawn_worker(
                worker_id,
                Arc::clone(&shared),
                engine.clone(),
                cfg.max_datagram_size,
            ));
        }
    }

    if cfg.metrics_interval_secs > 0 {
        let engine = engine.clone();
        let every = Duration::from_secs(cfg.metrics_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(target = "metrics", "{}", engine.metrics_snapshot());
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    info!(metrics = %engine.metrics_snapshot(), "shutting down");
    for h in handles {
        h.abort();
    }
    Ok(())
}

/// Wires the engine from `cfg`. Also returns the idle-bucket sweeper task.
fn build_engine(cfg: &ServerConfig) -> anyhow::Result<(Engine, JoinHandle<()>)> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(RecordRegistry::standard());

    let limiter = Arc::new(
        RateLimiter::new(
            cfg.rate_limit.capacity,
            Duration::from_millis(cfg.rate_limit.refill_ms),
            clock.clone(),
        )
        .with_idle_timeout(Duration::from_secs(cfg.rate_limit.idle_secs)),
    );
    let sweeper = Arc::clone(&limiter).spawn_sweeper(Duration::from_secs(cfg.rate_limit.sweep_secs));

    let upstream: Arc<dyn Upstream> =
        Arc::new(UdpUpstream::new(cfg.upstream_addr()?, cfg.upstream_timeout()));
    let freshness = Duration::from_secs(cfg.cache.freshness_secs);
    let cache = AnswerCache::new(cfg.cache.max_capacity, freshness);
    let resolver = Resolver::new(upstream, &registry, cache, clock).with_freshness(freshness);

    Ok((Engine::new(registry, limiter, Arc::new(resolver)), sweeper))
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    let val: c_int = 1;
    let ret = unsafe {
        setsockopt(
            socket.as_raw_fd(),
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // Without it only the first worker can bind; report and let bind decide.
        warn!(error = %std::io::Error::last_os_error(), "SO_REUSEPORT unavailable");
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn spawn_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    engine: Engine,
    max_datagram_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(run_udp_worker(worker_id, socket, engine, max_datagram_size))
}

/// Receive loop: every datagram is handled on its own task so a slow upstream
/// never stalls the socket.
async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    engine: Engine,
    max_datagram_size: usize,
) {
    let mut buf = vec![0u8; max_datagram_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let packet = Bytes::copy_from_slice(&buf[..len]);
                let engine = engine.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    engine.serve_datagram(&packet, peer, &*socket).await;
                });
            }
            Err(err) => {
                // ICMP port-unreachable from an earlier reply surfaces here on
                // some platforms; keep receiving.
                debug!(worker_id, error = %err, "udp recv failed");
            }
        }
    }
}
