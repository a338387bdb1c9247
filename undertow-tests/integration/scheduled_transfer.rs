//! Peer instances moving bytes over sockets from the scheduler thread.

use std::io::{IoSlice, IoSliceMut};
use std::net::{TcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use parking_lot::Mutex;
use undertow_core::clock::SystemClock;
use undertow_core::config::UndertowConfig;
use undertow_core::network::{
    CipherFilter, MioSelector, PlainFilter, SpeedTokenDispenser, Transport, XorKeystream,
};
use undertow_core::scheduler::{PeerInstance, TickScheduler};

const TOTAL_BYTES: u64 = 512 * 1024;
const CHUNK: u64 = 32 * 1024;

struct StreamingPeer {
    sender: Mutex<Transport>,
    receiver: Mutex<Transport>,
    dispenser: Arc<dyn SpeedTokenDispenser>,
    received: AtomicU64,
    ticks: AtomicUsize,
}

impl PeerInstance for StreamingPeer {
    fn tick(&self, _now_millis: u64) -> anyhow::Result<()> {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let mut sender = self.sender.lock();
        let remaining = TOTAL_BYTES - sender.bytes_written();
        if remaining > 0 && sender.is_ready_for_write(None) {
            let granted = self.dispenser.dispense(remaining.min(CHUNK));
            let payload = vec![0xa5; granted as usize];
            let written = sender.write(&[IoSlice::new(&payload)])?;
            self.dispenser.return_unused(granted - written as u64);
        }
        drop(sender);

        let mut receiver = self.receiver.lock();
        let mut buf = [0u8; 8192];
        while receiver.is_ready_for_read(None) == 0 {
            let count = receiver.read(&mut [IoSliceMut::new(&mut buf)])?;
            if count == 0 {
                break;
            }
            anyhow::ensure!(buf[..count].iter().all(|byte| *byte == 0xa5), "corrupted bytes");
            self.received.fetch_add(count as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn name(&self) -> String {
        "streaming".to_string()
    }
}

fn streaming_peer(
    selector: &MioSelector,
    scheduler: &TickScheduler,
    clock: &Arc<SystemClock>,
    obfuscate: bool,
) -> Arc<StreamingPeer> {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let outbound = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (inbound, _) = listener.accept().unwrap();
    outbound.set_nonblocking(true).unwrap();
    inbound.set_nonblocking(true).unwrap();

    let mut transports = Vec::new();
    for stream in [outbound, inbound] {
        let socket = selector.attach(TcpStream::from_std(stream)).unwrap();
        let mut transport = Transport::new(clock.clone());
        if obfuscate {
            transport.set_filter(Box::new(CipherFilter::new(
                Box::new(PlainFilter::new(socket)),
                XorKeystream::new(b"scheduled").unwrap(),
                XorKeystream::new(b"scheduled").unwrap(),
            )));
        } else {
            transport.set_filter(Box::new(PlainFilter::new(socket)));
        }
        transport.connected_outbound();
        transports.push(transport);
    }
    let receiver = transports.pop().unwrap();
    let sender = transports.pop().unwrap();

    Arc::new(StreamingPeer {
        sender: Mutex::new(sender),
        receiver: Mutex::new(receiver),
        dispenser: Arc::clone(scheduler.speed_token_dispenser()),
        received: AtomicU64::new(0),
        ticks: AtomicUsize::new(0),
    })
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_scheduler_thread_drives_transfers_to_completion() {
    let config = UndertowConfig::for_testing();
    let clock = SystemClock::with_ticker(config.scheduler.schedule_period).unwrap();
    let selector = MioSelector::start(&config.selector).unwrap();
    let scheduler = TickScheduler::from_config(&config, clock.clone());

    let peers: Vec<_> = [false, true, false, true]
        .into_iter()
        .map(|obfuscate| streaming_peer(&selector, &scheduler, &clock, obfuscate))
        .collect();
    for peer in &peers {
        scheduler.register(peer.clone());
    }
    scheduler.start().unwrap();

    let finished = wait_for(Duration::from_secs(20), || {
        peers
            .iter()
            .all(|peer| peer.received.load(Ordering::Relaxed) == TOTAL_BYTES)
    });
    scheduler.shutdown().unwrap();

    assert!(finished, "transfers did not complete");
    let stats = scheduler.stats();
    assert_eq!(stats.tick_failures, 0);
    assert_eq!(stats.instances, 4);
    for peer in &peers {
        assert!(peer.ticks.load(Ordering::Relaxed) > 0);
    }
}

#[test]
fn test_unregistered_peer_stops_receiving_ticks() {
    let config = UndertowConfig::for_testing();
    let clock = SystemClock::with_ticker(config.scheduler.schedule_period).unwrap();
    let selector = MioSelector::start(&config.selector).unwrap();
    let scheduler = TickScheduler::from_config(&config, clock.clone());

    let peer = streaming_peer(&selector, &scheduler, &clock, false);
    scheduler.register(peer.clone());
    scheduler.start().unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        peer.ticks.load(Ordering::Relaxed) >= 3
    }));
    assert!(scheduler.unregister(&peer));

    // One pass may already be past its merge point.
    std::thread::sleep(Duration::from_millis(200));
    let settled = peer.ticks.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(peer.ticks.load(Ordering::Relaxed), settled);
    assert!(!scheduler.is_registered(&peer));
    scheduler.shutdown().unwrap();
}
