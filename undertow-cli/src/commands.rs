//! CLI command implementations

use std::io::{IoSlice, IoSliceMut};
use std::net::{TcpListener, TcpStream as StdTcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use mio::net::TcpStream;
use parking_lot::Mutex;
use undertow_core::UndertowError;
use undertow_core::clock::SystemClock;
use undertow_core::config::UndertowConfig;
use undertow_core::network::{
    CipherFilter, MioSelector, PlainFilter, SpeedTokenDispenser, Transport, TransportFilter,
    XorKeystream,
};
use undertow_core::scheduler::{PeerInstance, TickScheduler};
use undertow_sim::{ScenarioConfig, run_scenario};

/// Bytes offered to the dispenser per loopback tick.
const LOOPBACK_CHUNK_SIZE: usize = 16 * 1024;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a deterministic scheduler scenario and print its report
    Simulate {
        /// Scenario preset (see `scenarios`)
        #[arg(short, long, default_value = "steady")]
        scenario: String,
        /// Seed for jitter, churn and peer behaviour
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List scenario presets
    Scenarios,
    /// Stream bytes between local TCP pairs driven by the tick scheduler
    Loopback {
        /// Number of connected socket pairs
        #[arg(short, long, default_value = "4")]
        pairs: usize,
        /// How long to run, in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Bandwidth limit in bytes per second, shared by all pairs
        #[arg(short, long)]
        limit: Option<u64>,
        /// Obfuscate the stream with this XOR key
        #[arg(short, long)]
        key: Option<String>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Simulate {
            scenario,
            seed,
            output,
        } => simulate(&scenario, seed, output),
        Commands::Scenarios => {
            list_scenarios();
            Ok(())
        }
        Commands::Loopback {
            pairs,
            duration,
            limit,
            key,
        } => loopback(pairs, Duration::from_secs(duration), limit, key),
    }
}

/// Runs one scenario preset and emits its report as JSON.
///
/// # Errors
/// - Unknown preset name
/// - `SimulationError` - Invalid scenario or report encoding failure
/// - `std::io::Error` - Report file could not be written
pub fn simulate(scenario: &str, seed: u64, output: Option<PathBuf>) -> anyhow::Result<()> {
    let Some(config) = ScenarioConfig::preset(scenario, seed) else {
        bail!(
            "Unknown scenario '{scenario}', expected one of: {}",
            ScenarioConfig::preset_names().join(", ")
        );
    };

    let report = run_scenario(config)?;
    let json = report.to_json()?;

    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            println!("Report written to {}", path.display());
        }
        None => println!("{json}"),
    }

    if report.is_clean() {
        tracing::info!(
            "Scenario '{scenario}' passed: {} ticks over {} passes",
            report.scheduler.total_ticks,
            report.passes
        );
    } else {
        for violation in &report.violations {
            tracing::error!("{violation}");
        }
        bail!(
            "Scenario '{scenario}' violated {} invariant(s)",
            report.violations.len()
        );
    }

    Ok(())
}

fn list_scenarios() {
    println!("Available scenarios:");
    for name in ScenarioConfig::preset_names() {
        if let Some(config) = ScenarioConfig::preset(name, 0) {
            println!(
                "  {name:<14} period={}ms duration={}ms peers={}",
                config.period_ms,
                config.duration_ms,
                config.counting_peers + config.failing_peers + config.slow_peers + config.transfer_peers
            );
        }
    }
}

/// Streams a byte pattern through `pairs` loopback connections.
///
/// Each pair is one scheduled peer instance: on every tick it writes what
/// the dispenser grants and drains whatever has arrived on the far side.
///
/// # Errors
/// - `UndertowError::Config` - Invalid environment configuration
/// - `UndertowError::Io` - Sockets, selector or threads could not be set up
/// - `UndertowError::Scheduler` - Scheduler thread could not be started or joined
pub fn loopback(
    pairs: usize,
    duration: Duration,
    limit: Option<u64>,
    key: Option<String>,
) -> anyhow::Result<()> {
    let LoopbackEngine {
        selector,
        scheduler,
        peers,
    } = prepare_loopback(pairs, limit, key.as_deref())?;

    tracing::info!(
        "Streaming over {pairs} pair(s) for {}s, limit={}",
        duration.as_secs(),
        limit.map_or_else(|| "unlimited".to_string(), |rate| format!("{rate} B/s"))
    );

    scheduler.start().map_err(UndertowError::from)?;
    std::thread::sleep(duration);
    scheduler.shutdown().map_err(UndertowError::from)?;

    let mut total = 0;
    for peer in &peers {
        let sent = peer.sender.lock().bytes_written();
        let received = peer.received.load(Ordering::Relaxed);
        total += received;
        println!(
            "{:<12} sent={sent:>12} received={received:>12} encryption={}",
            peer.name,
            peer.sender.lock().encryption(true)
        );
        peer.sender.lock().close("loopback finished");
        peer.receiver.lock().close("loopback finished");
    }

    let secs = duration.as_secs_f64().max(f64::EPSILON);
    println!("Total received: {total} bytes ({:.0} B/s)", total as f64 / secs);
    println!("{}", serde_json::to_string_pretty(&scheduler.stats())?);

    selector.shutdown();
    Ok(())
}

struct LoopbackEngine {
    selector: MioSelector,
    scheduler: TickScheduler,
    peers: Vec<Arc<LoopbackPeer>>,
}

fn prepare_loopback(
    pairs: usize,
    limit: Option<u64>,
    key: Option<&str>,
) -> undertow_core::Result<LoopbackEngine> {
    let mut config = UndertowConfig::from_env();
    if limit.is_some() {
        config.rate_limit.download_limit = limit;
    }
    config.validate()?;

    let clock = SystemClock::with_ticker(config.scheduler.schedule_period)?;
    let selector = MioSelector::start(&config.selector)?;
    let scheduler = TickScheduler::from_config(&config, clock.clone());

    let mut peers = Vec::with_capacity(pairs);
    for index in 0..pairs {
        let (outbound, inbound) = connected_pair()?;
        let mut sender = Transport::with_config(clock.clone(), &config.transport);
        let mut receiver = Transport::with_config(clock.clone(), &config.transport);

        sender.begin_connect();
        sender.set_filter(build_filter(&selector, outbound, key)?);
        sender.connected_outbound();
        receiver.set_filter(build_filter(&selector, inbound, key)?);
        receiver.connected_inbound();

        let peer = Arc::new(LoopbackPeer {
            name: format!("loopback-{index}"),
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
            dispenser: Arc::clone(scheduler.speed_token_dispenser()),
            received: AtomicU64::new(0),
        });
        scheduler.register(peer.clone());
        peers.push(peer);
    }

    Ok(LoopbackEngine {
        selector,
        scheduler,
        peers,
    })
}

fn connected_pair() -> std::io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let outbound = StdTcpStream::connect(listener.local_addr()?)?;
    let (inbound, _) = listener.accept()?;
    outbound.set_nonblocking(true)?;
    inbound.set_nonblocking(true)?;
    Ok((TcpStream::from_std(outbound), TcpStream::from_std(inbound)))
}

fn build_filter(
    selector: &MioSelector,
    stream: TcpStream,
    key: Option<&str>,
) -> std::io::Result<Box<dyn TransportFilter>> {
    let plain: Box<dyn TransportFilter> = Box::new(PlainFilter::new(selector.attach(stream)?));
    let filter: Box<dyn TransportFilter> = match key {
        Some(key) if !key.is_empty() => Box::new(CipherFilter::new(
            plain,
            XorKeystream::new(key.as_bytes())?,
            XorKeystream::new(key.as_bytes())?,
        )),
        _ => plain,
    };
    Ok(filter)
}

/// Byte at `offset` of the loopback stream.
fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

struct LoopbackPeer {
    name: String,
    sender: Mutex<Transport>,
    receiver: Mutex<Transport>,
    dispenser: Arc<dyn SpeedTokenDispenser>,
    received: AtomicU64,
}

impl LoopbackPeer {
    fn send(&self) -> anyhow::Result<()> {
        let mut sender = self.sender.lock();
        if !sender.is_ready_for_write(None) {
            return Ok(());
        }

        let granted = self.dispenser.dispense(LOOPBACK_CHUNK_SIZE as u64);
        if granted == 0 {
            return Ok(());
        }

        let offset = sender.bytes_written();
        let payload: Vec<u8> = (offset..offset + granted).map(pattern_byte).collect();
        let written = sender.write(&[IoSlice::new(&payload)])?;
        self.dispenser.return_unused(granted - written as u64);
        Ok(())
    }

    fn receive(&self) -> anyhow::Result<()> {
        let mut receiver = self.receiver.lock();
        let mut buf = vec![0u8; LOOPBACK_CHUNK_SIZE];

        while receiver.is_ready_for_read(None) == 0 {
            let count = receiver.read(&mut [IoSliceMut::new(&mut buf)])?;
            if count == 0 {
                break;
            }

            let offset = self.received.fetch_add(count as u64, Ordering::Relaxed);
            if let Some(position) = (0..count).find(|&i| buf[i] != pattern_byte(offset + i as u64))
            {
                bail!(
                    "{} received corrupted byte at offset {}",
                    self.name,
                    offset + position as u64
                );
            }
        }
        Ok(())
    }
}

impl PeerInstance for LoopbackPeer {
    fn tick(&self, _now_millis: u64) -> anyhow::Result<()> {
        self.send()?;
        self.receive()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
