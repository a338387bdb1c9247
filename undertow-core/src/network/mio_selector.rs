//! Edge-triggered readiness selector backed by a `mio::Poll` thread.
//!
//! Each attached socket is registered once for both interests. Per direction
//! the socket tracks whether a listener is armed: an edge arriving while armed
//! is delivered and disarms the direction, an edge arriving while disarmed is
//! remembered and redelivered as soon as the listener resumes selects.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::selector::{Attachment, ReadinessSelector, SelectListener};
use crate::config::SelectorConfig;

const WAKER_TOKEN: Token = Token(0);
const FIRST_SOCKET_TOKEN: usize = 1;

const DISARMED: u8 = 0;
const ARMED: u8 = 1;
const PENDING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Read,
    Write,
}

type ListenerSlot = Option<(Arc<dyn SelectListener>, Option<Attachment>)>;

struct SideState {
    arm: AtomicU8,
    listener: Mutex<ListenerSlot>,
}

impl SideState {
    fn new() -> Self {
        Self {
            arm: AtomicU8::new(DISARMED),
            listener: Mutex::new(None),
        }
    }
}

struct SelectorShared {
    registry: Registry,
    waker: Waker,
    sockets: Mutex<HashMap<Token, Arc<SelectedSocket>>>,
    redeliver: Mutex<Vec<(Token, Side)>>,
    next_token: AtomicUsize,
    running: AtomicBool,
}

impl SelectorShared {
    fn socket(&self, token: Token) -> Option<Arc<SelectedSocket>> {
        self.sockets.lock().get(&token).cloned()
    }

    fn queue_redelivery(&self, token: Token, side: Side) {
        self.redeliver.lock().push((token, side));
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake selector for redelivery: {e}");
        }
    }
}

/// A TCP stream registered with a [`MioSelector`].
///
/// The socket is the [`ReadinessSelector`] for the stream: transports
/// register their listeners and resume selects through it.
pub struct SelectedSocket {
    token: Token,
    stream: TcpStream,
    shared: Weak<SelectorShared>,
    read: SideState,
    write: SideState,
    cancelled: AtomicBool,
}

impl SelectedSocket {
    /// Underlying non-blocking stream.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Poll token identifying this socket.
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn side(&self, side: Side) -> &SideState {
        match side {
            Side::Read => &self.read,
            Side::Write => &self.write,
        }
    }

    /// Handles a readiness edge reported by poll.
    fn on_edge(&self, side: Side) {
        let state = &self.side(side).arm;
        loop {
            match state.load(Ordering::Acquire) {
                ARMED => {
                    if state
                        .compare_exchange(ARMED, DISARMED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.deliver(side);
                        return;
                    }
                }
                DISARMED => {
                    if state
                        .compare_exchange(DISARMED, PENDING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Arms `side`; an edge remembered while disarmed is redelivered.
    fn arm(&self, side: Side) {
        if self.is_cancelled() {
            return;
        }
        let state = &self.side(side).arm;
        if state.swap(ARMED, Ordering::AcqRel) != PENDING {
            return;
        }
        if state
            .compare_exchange(ARMED, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match self.shared.upgrade() {
            Some(shared) => shared.queue_redelivery(self.token, side),
            None => state.store(PENDING, Ordering::Release),
        }
    }

    fn deliver(&self, side: Side) {
        if self.is_cancelled() {
            return;
        }
        let registered = self.side(side).listener.lock().clone();
        match registered {
            Some((listener, attachment)) => {
                listener.select_success(self, attachment.as_ref());
            }
            None => self.side(side).arm.store(PENDING, Ordering::Release),
        }
    }

    fn fail(&self, cause: &io::Error) {
        if self.is_cancelled() {
            return;
        }
        for side in [Side::Read, Side::Write] {
            let registered = self.side(side).listener.lock().clone();
            if let Some((listener, attachment)) = registered {
                let copy = io::Error::new(cause.kind(), cause.to_string());
                listener.select_failure(self, attachment.as_ref(), copy);
            }
        }
    }

    fn handle_event(&self, event: &Event) {
        if event.is_error() {
            let cause = match self.stream.take_error() {
                Ok(Some(e)) => e,
                Ok(None) => io::Error::other("socket error reported by poll"),
                Err(e) => e,
            };
            debug!(token = ?self.token, "Socket error: {cause}");
            self.fail(&cause);
            return;
        }
        if event.is_readable() || event.is_read_closed() {
            self.on_edge(Side::Read);
        }
        if event.is_writable() || event.is_write_closed() {
            self.on_edge(Side::Write);
        }
    }

    fn register_listener(
        &self,
        side: Side,
        listener: Arc<dyn SelectListener>,
        attachment: Option<Attachment>,
    ) {
        *self.side(side).listener.lock() = Some((listener, attachment));
        self.arm(side);
    }
}

impl ReadinessSelector for SelectedSocket {
    fn register_for_read_selects(
        &self,
        listener: Arc<dyn SelectListener>,
        attachment: Option<Attachment>,
    ) {
        self.register_listener(Side::Read, listener, attachment);
    }

    fn register_for_write_selects(
        &self,
        listener: Arc<dyn SelectListener>,
        attachment: Option<Attachment>,
    ) {
        self.register_listener(Side::Write, listener, attachment);
    }

    fn resume_read_selects(&self) {
        self.arm(Side::Read);
    }

    fn resume_write_selects(&self) {
        self.arm(Side::Write);
    }

    fn cancel_selects(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.read.listener.lock() = None;
        *self.write.listener.lock() = None;
        if let Some(shared) = self.shared.upgrade() {
            shared.sockets.lock().remove(&self.token);
        }
        trace!(token = ?self.token, "Selects cancelled");
    }
}

/// Poll thread delivering readiness edges for attached sockets.
pub struct MioSelector {
    shared: Arc<SelectorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MioSelector {
    /// Creates the poll instance and starts the selector thread.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - If the poll, its waker or the thread could not be created
    pub fn start(config: &SelectorConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(SelectorShared {
            registry,
            waker,
            sockets: Mutex::new(HashMap::new()),
            redeliver: Mutex::new(Vec::new()),
            next_token: AtomicUsize::new(FIRST_SOCKET_TOKEN),
            running: AtomicBool::new(true),
        });

        let timeout = config.poll_timeout;
        let max_events = config.max_events.max(1);
        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("undertow-selector".to_string())
            .spawn(move || poll_loop(poll, &loop_shared, timeout, max_events))?;

        info!("Selector started with poll_timeout={timeout:?} max_events={max_events}");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Registers `stream` with the poll and returns its selector handle.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - If the stream could not be registered
    pub fn attach(&self, mut stream: TcpStream) -> io::Result<Arc<SelectedSocket>> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared
            .registry
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;

        let socket = Arc::new(SelectedSocket {
            token,
            stream,
            shared: Arc::downgrade(&self.shared),
            read: SideState::new(),
            write: SideState::new(),
            cancelled: AtomicBool::new(false),
        });
        self.shared.sockets.lock().insert(token, Arc::clone(&socket));

        // Edges reported before the map insert were dropped; treat both sides as pending.
        socket.read.arm.store(PENDING, Ordering::Release);
        socket.write.arm.store(PENDING, Ordering::Release);

        debug!(token = ?token, "Socket attached");
        Ok(socket)
    }

    /// Number of sockets currently attached.
    pub fn socket_count(&self) -> usize {
        self.shared.sockets.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stops the poll thread and waits for it to exit.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            warn!("Failed to wake selector for shutdown: {e}");
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Selector thread panicked");
            }
        }
        info!("Selector stopped");
    }
}

impl Drop for MioSelector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_loop(mut poll: Poll, shared: &SelectorShared, timeout: Duration, max_events: usize) {
    let mut events = Events::with_capacity(max_events);

    while shared.running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("Selector poll failed: {e}");
            let sockets: Vec<_> = shared.sockets.lock().values().cloned().collect();
            for socket in sockets {
                socket.fail(&e);
            }
            shared.running.store(false, Ordering::Release);
            break;
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            if let Some(socket) = shared.socket(event.token()) {
                socket.handle_event(event);
            }
        }

        let redeliveries = std::mem::take(&mut *shared.redeliver.lock());
        for (token, side) in redeliveries {
            if let Some(socket) = shared.socket(token) {
                socket.deliver(side);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    use super::*;
    use crate::waiter::EventWaiter;

    const WAIT: Duration = Duration::from_secs(5);

    struct RecordingListener {
        hits: AtomicUsize,
        failures: AtomicUsize,
        waiter: Arc<EventWaiter>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
                waiter: Arc::new(EventWaiter::new()),
            })
        }
    }

    impl SelectListener for RecordingListener {
        fn select_success(
            &self,
            _selector: &dyn ReadinessSelector,
            _attachment: Option<&Attachment>,
        ) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.waiter.event_occurred();
            true
        }

        fn select_failure(
            &self,
            _selector: &dyn ReadinessSelector,
            _attachment: Option<&Attachment>,
            _cause: io::Error,
        ) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            self.waiter.event_occurred();
        }
    }

    fn connected_pair() -> (TcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        (TcpStream::from_std(client), server)
    }

    #[test]
    fn test_read_edge_reaches_listener() {
        let selector = MioSelector::start(&SelectorConfig::default()).unwrap();
        let (client, mut server) = connected_pair();
        let socket = selector.attach(client).unwrap();

        let listener = RecordingListener::new();
        socket.register_for_read_selects(listener.clone(), None);
        // Registration redelivers the edge remembered at attach time.
        assert!(listener.waiter.wait_timeout(WAIT));

        let mut stream = socket.stream();
        let mut drain = [0u8; 16];
        assert!(stream.read(&mut drain).is_err());

        server.write_all(b"have").unwrap();
        socket.resume_read_selects();
        assert!(listener.waiter.wait_timeout(WAIT));

        let mut buffer = [0u8; 16];
        let count = stream.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..count], b"have");
        assert!(listener.hits.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_write_edge_delivered_after_registration() {
        let selector = MioSelector::start(&SelectorConfig::default()).unwrap();
        let (client, _server) = connected_pair();
        let socket = selector.attach(client).unwrap();

        let listener = RecordingListener::new();
        socket.register_for_write_selects(listener.clone(), None);

        assert!(listener.waiter.wait_timeout(WAIT));
        assert_eq!(listener.failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disarmed_side_is_not_delivered_twice() {
        let selector = MioSelector::start(&SelectorConfig::default()).unwrap();
        let (client, mut server) = connected_pair();
        let socket = selector.attach(client).unwrap();

        let listener = RecordingListener::new();
        socket.register_for_read_selects(listener.clone(), None);
        assert!(listener.waiter.wait_timeout(WAIT));
        let hits = listener.hits.load(Ordering::SeqCst);

        server.write_all(b"one").unwrap();
        assert!(!listener.waiter.wait_timeout(Duration::from_millis(200)));
        assert_eq!(listener.hits.load(Ordering::SeqCst), hits);

        socket.resume_read_selects();
        assert!(listener.waiter.wait_timeout(WAIT));
    }

    #[test]
    fn test_cancel_detaches_socket() {
        let selector = MioSelector::start(&SelectorConfig::default()).unwrap();
        let (client, _server) = connected_pair();
        let socket = selector.attach(client).unwrap();
        assert_eq!(selector.socket_count(), 1);

        socket.cancel_selects();

        assert!(socket.is_cancelled());
        assert_eq!(selector.socket_count(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let selector = MioSelector::start(&SelectorConfig::default()).unwrap();
        assert!(selector.is_running());

        selector.shutdown();
        selector.shutdown();

        assert!(!selector.is_running());
    }
}
