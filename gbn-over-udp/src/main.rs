//! Entry point for `gbn-over-udp`.
//!
//! Parses CLI arguments and dispatches into either **send** or **route** mode.
//! All protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use gbn_over_udp::channel::{CorruptionMode, ForwardConfig};
use gbn_over_udp::control::{self, ControlPlane};
use gbn_over_udp::gbn_sender::WINDOW_SIZE;
use gbn_over_udp::packet::MAX_DATA_SIZE;
use gbn_over_udp::relay::BackwardConfig;
use gbn_over_udp::router::{Router, RouterConfig};
use gbn_over_udp::rules::{ForcedRules, ImpairmentKind};
use gbn_over_udp::sender::{self, SenderConfig};

/// Go-Back-N over UDP, with a channel-emulating router.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Send one message reliably through the router.
    Send(SendArgs),
    /// Run the router between sender and receiver.
    Route(RouteArgs),
}

#[derive(Args)]
struct SendArgs {
    /// Local address; ACKs arrive here.
    #[arg(long, default_value = "127.0.0.1:9001")]
    bind: SocketAddr,
    /// Router forward-listen address.
    #[arg(long, default_value = "127.0.0.1:9002")]
    router: SocketAddr,
    /// Message to send; read as one line from stdin when omitted.
    #[arg(short, long)]
    message: Option<String>,
    #[arg(long, default_value_t = WINDOW_SIZE)]
    window: usize,
    /// Maximum payload bytes per packet.
    #[arg(long, default_value_t = MAX_DATA_SIZE)]
    chunk: usize,
    /// Retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,
}

#[derive(Args)]
struct RouteArgs {
    /// Where the sender sends data.
    #[arg(long, default_value = "127.0.0.1:9002")]
    listen: SocketAddr,
    /// Where the receiver sends ACKs.
    #[arg(long, default_value = "127.0.0.1:9004")]
    ack_listen: SocketAddr,
    #[arg(long, default_value = "127.0.0.1:9003")]
    receiver: SocketAddr,
    /// ACK destination; learned from incoming data when omitted.
    #[arg(long)]
    sender: Option<SocketAddr>,

    #[arg(long, default_value_t = 0.20, value_parser = probability)]
    p_corrupt: f64,
    #[arg(long, default_value_t = 0.05, value_parser = probability)]
    p_drop: f64,
    #[arg(long, default_value_t = 0.05, value_parser = probability)]
    p_dup: f64,
    #[arg(long, default_value_t = 0.20, value_parser = probability)]
    p_reorder: f64,
    /// Reorder buffer capacity (0 disables random reordering).
    #[arg(long, default_value_t = 3)]
    reorder_window: usize,
    /// Mean per-packet delay in seconds (exponential).
    #[arg(long, default_value = "0.02", value_parser = seconds)]
    delay_mean: Duration,
    #[arg(long, value_enum, default_value_t = CorruptionMode::Shuffle)]
    corrupt_mode: CorruptionMode,

    #[arg(long, default_value_t = 0.02, value_parser = probability)]
    p_drop_ack: f64,
    #[arg(long, default_value_t = 0.03, value_parser = probability)]
    p_dup_ack: f64,
    /// Mean ACK delay in seconds (exponential).
    #[arg(long, default_value = "0.01", value_parser = seconds)]
    delay_mean_ack: Duration,

    /// Always drop these sequence numbers, e.g. "2,5-7".
    #[arg(long)]
    force_drop: Option<String>,
    #[arg(long)]
    force_corrupt: Option<String>,
    #[arg(long)]
    force_dup: Option<String>,
    #[arg(long)]
    force_reorder: Option<String>,
    /// Let each forced rule fire only once.
    #[arg(long)]
    forced_once: bool,

    /// Seed for reproducible impairments.
    #[arg(long)]
    seed: Option<u64>,
    /// Read rule commands from stdin while routing.
    #[arg(long)]
    console: bool,
}

fn probability(s: &str) -> Result<f64, String> {
    let p: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(format!("{p} is not a probability in [0, 1]"))
    }
}

fn seconds(s: &str) -> Result<Duration, String> {
    let t: f64 = s.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(t).map_err(|e| format!("{t} is not a usable duration: {e}"))
}

impl RouteArgs {
    fn into_config(self) -> anyhow::Result<RouterConfig> {
        let mut rules = ForcedRules {
            once: self.forced_once,
            ..Default::default()
        };
        let forced = [
            (ImpairmentKind::Drop, &self.force_drop),
            (ImpairmentKind::Corrupt, &self.force_corrupt),
            (ImpairmentKind::Duplicate, &self.force_dup),
            (ImpairmentKind::Reorder, &self.force_reorder),
        ];
        for (kind, list) in forced {
            if let Some(list) = list {
                let seqs = gbn_over_udp::rules::parse_seq_list(list)
                    .with_context(|| format!("--force-{kind} {list:?}"))?;
                rules.set(kind, seqs);
            }
        }

        Ok(RouterConfig {
            forward_listen: self.listen,
            backward_listen: self.ack_listen,
            receiver: self.receiver,
            sender: self.sender,
            forward: ForwardConfig {
                p_drop: self.p_drop,
                p_corrupt: self.p_corrupt,
                p_dup: self.p_dup,
                p_reorder: self.p_reorder,
                delay_mean: self.delay_mean,
                corrupt_mode: self.corrupt_mode,
                reorder_window: self.reorder_window,
            },
            backward: BackwardConfig {
                p_drop: self.p_drop_ack,
                p_dup: self.p_dup_ack,
                delay_mean: self.delay_mean_ack,
            },
            rules,
            seed: self.seed,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Send(args) => send(args).await,
        Mode::Route(args) => route(args).await,
    }
}

async fn send(args: SendArgs) -> anyhow::Result<()> {
    let message = match args.message {
        Some(message) => message,
        None => {
            eprintln!("Type the message to send and press Enter:");
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            lines.next_line().await?.unwrap_or_default()
        }
    };
    if args.window == 0 || args.chunk == 0 {
        bail!("--window and --chunk must be at least 1");
    }

    let config = SenderConfig {
        bind: args.bind,
        peer: args.router,
        window_size: args.window,
        max_chunk: args.chunk,
        timeout: Duration::from_millis(args.timeout_ms),
    };
    log::info!("Sending {} byte(s) to {}", message.len(), config.peer);
    let stats = sender::transfer(config, message.as_bytes())
        .await
        .context("transfer failed")?;
    println!(
        "sent {} packet(s), {} retransmission(s), {} timeout(s), {}/{} ACKs used",
        stats.packets_sent,
        stats.retransmissions,
        stats.timeouts,
        stats.acks_received - stats.acks_ignored,
        stats.acks_received
    );
    Ok(())
}

async fn route(args: RouteArgs) -> anyhow::Result<()> {
    let console = args.console;
    let config = args.into_config()?;
    let router = Router::bind(config).await.context("router startup failed")?;
    let control = router.control();
    let handle = router.run();

    if console {
        println!("{}", control::HELP);
        tokio::select! {
            result = console_loop(control) => result?,
            _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
        }
    } else {
        tokio::signal::ctrl_c().await?;
        log::info!("Interrupted");
    }

    let (fwd, back) = (handle.forward_stats(), handle.backward_stats());
    handle.shutdown().await;
    println!(
        "forward: {} received, {} dropped, {} corrupted, {} duplicated, {} forwarded",
        fwd.received, fwd.dropped, fwd.corrupted, fwd.duplicated, fwd.forwarded
    );
    println!(
        "backward: {} received, {} dropped, {} duplicated, {} forwarded",
        back.received, back.dropped, back.duplicated, back.forwarded
    );
    Ok(())
}

async fn console_loop(control: ControlPlane) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    control::run_console(control, stdin, tokio::io::stdout())
        .await
        .context("console I/O failed")
}
