//! NextGCore MME (Mobility Management Entity)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::net::UdpSocket;

use nextgcore_mmed::event::{event_channel, MmeEvent};
use nextgcore_mmed::gtp_path::{self, UdpGtpSender};
use nextgcore_mmed::s1ap_path::QueueS1apPath;
use nextgcore_mmed::{MmeApp, MmeConfig};

/// Timer resolution for S11 retransmissions and shutdown checks
const TICK: Duration = Duration::from_millis(100);

/// NextGCore MME - Mobility Management Entity
#[derive(Parser, Debug)]
#[command(name = "nextgcore-mmed")]
#[command(author = "NextGCore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC Mobility Management Entity")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nextgcore/mme.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(long)]
    no_color: bool,

    /// Run in daemon mode
    #[arg(short, long)]
    daemon: bool,
}

async fn run(config: Arc<MmeConfig>, running: Arc<AtomicBool>) -> Result<()> {
    let socket = Arc::new(
        UdpSocket::bind(config.gtpc)
            .await
            .with_context(|| format!("cannot bind S11 socket {}", config.gtpc))?,
    );
    log::info!("gtp_server() [{}]", config.gtpc);

    let (event_tx, mut event_rx) = event_channel();
    let (s1ap_path, mut s1ap_rx) = QueueS1apPath::new();
    let mut app = MmeApp::new(
        Arc::clone(&config),
        event_tx.clone(),
        Box::new(s1ap_path),
        Box::new(UdpGtpSender::new(Arc::clone(&socket))),
    );

    let mut tick = tokio::time::interval(TICK);
    let mut buf = vec![0u8; 8192];

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            Some(event) = event_rx.recv() => app.dispatch(event),
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => match gtp_path::decode_s11_response(Bytes::copy_from_slice(&buf[..len])) {
                    Some(resp) => {
                        if event_tx.send(MmeEvent::S11Message(resp)).is_err() {
                            log::error!("Event channel closed");
                        }
                    }
                    None => log::error!("Invalid GTPv2-C message from [{}] ({} octets)", from, len),
                },
                Err(e) => log::error!("S11 recv failed: {}", e),
            },
            Some(out) = s1ap_rx.recv() => {
                // No SCTP association layer is attached to this process
                log::debug!(
                    "S1AP PDU for eNB [{}] ppid {} ({} octets) not delivered",
                    out.enb_addr,
                    out.ppid,
                    out.pkbuf.len()
                );
            }
            _ = tick.tick() => app.poll_timers(Instant::now()),
        }
    }

    log::info!("MME main loop exited ({} S11 transactions pending)", app.xact_pool.len());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .write_style(if args.no_color {
            env_logger::WriteStyle::Never
        } else {
            env_logger::WriteStyle::Auto
        })
        .init();

    log::info!("NextGCore MME v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);
    if args.daemon {
        log::warn!("Daemon mode is not supported, running in foreground");
    }

    let config = Arc::new(MmeConfig::from_file(&args.config)?);

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, running))?;

    log::info!("NextGCore MME terminated");
    Ok(())
}
