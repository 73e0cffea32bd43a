//! The singleton I/O worker (§4.4, §4.5, §5). One background thread owns
//! the raw socket and every connection's worker-private retransmission
//! state; every other thread talks to it only through `ConnectionShared`
//! handles and a small command queue, mirroring the way `Endpoint` is the
//! sole owner of its `mio::Poll` and channel table.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use crate::addr::AddrInfo;
use crate::connection::{ConnectionShared, LifecycleState, Terminal};
use crate::error::{DropReason, Error, Result};
use crate::logging::{self, Logger};
use crate::packet::{self, Body, Packet, PacketKind};
use crate::raw_socket::{RawSocket, Substrate};
use crate::retransmit::RetransmitSet;

const SOCKET_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// §4.5: RTO starts at MIN_TIMEOUT, doubles on loss up to MAX_TIMEOUT,
/// halves on a clean window.
const MIN_RTO: Duration = Duration::from_millis(10);
const MAX_RTO: Duration = Duration::from_secs(5);
/// `max_in_flight` is a packet count, not a byte budget (§8: retransmit_set
/// size <= max_in_flight + 1). The source leaves the starting value
/// unspecified; 4 gives new connections a slow-start-like ramp.
const INITIAL_MAX_IN_FLIGHT: usize = 4;
/// Peer-advertised window in bytes isn't known until the first ACK, so a
/// new connection assumes the full receive-buffer capacity until told
/// otherwise.
const INITIAL_PEER_WINDOW: usize = crate::recv_buffer::MAX_PACKETS * packet::MAX_DATA;
const MAX_SYN_ATTEMPTS: u32 = 5;

fn now_ms() -> u64 {
    // Wall-clock echo timestamp only; not used for RTT math, which relies on
    // `Instant` exclusively (monotonic, immune to clock step).
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

enum Command {
    Connect {
        conn: Arc<ConnectionShared>,
    },
    Close {
        addr: AddrInfo,
    },
}

/// Per-port queue of handshakes completed by the worker, awaiting
/// `accept_one_client`.
pub struct ListenerState {
    ready: Mutex<VecDeque<Arc<ConnectionShared>>>,
    closed: Mutex<bool>,
    ready_cv: std::sync::Condvar,
}

impl ListenerState {
    fn new() -> ListenerState {
        ListenerState {
            ready: Mutex::new(VecDeque::new()),
            closed: Mutex::new(false),
            ready_cv: std::sync::Condvar::new(),
        }
    }

    fn push(&self, conn: Arc<ConnectionShared>) {
        self.ready.lock().unwrap().push_back(conn);
        self.ready_cv.notify_one();
    }

    pub fn accept_one(&self) -> Result<Arc<ConnectionShared>> {
        let mut guard = self.ready.lock().unwrap();
        loop {
            if let Some(conn) = guard.pop_front() {
                return Ok(conn);
            }
            if *self.closed.lock().unwrap() {
                return Err(Error::IoError("listener closed".into()));
            }
            guard = self.ready_cv.wait(guard).unwrap();
        }
    }

    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
        self.ready_cv.notify_all();
    }
}

/// Worker-private per-connection state (§5): touched exclusively by the
/// I/O thread, so it carries no internal locking.
struct ConnectionWorker {
    shared: Arc<ConnectionShared>,
    retransmit: RetransmitSet,
    next_send_sequence: u64,
    rto: Duration,
    max_in_flight: usize,
    peer_window: usize,
    syn_attempts: u32,
    last_syn_sent: Instant,
}

impl ConnectionWorker {
    /// Next poll timeout this connection calls for, clamped to
    /// [MIN_RTO, MAX_RTO] per §4.5 step 1. Connections with nothing
    /// in flight don't need a tight wakeup; their own `rto` (itself
    /// clamped) stands in for "check back eventually".
    fn poll_timeout(&self) -> Duration {
        self.rto.clamp(MIN_RTO, MAX_RTO)
    }
}

struct WorkerState {
    socket: Box<dyn Substrate>,
    connections: HashMap<AddrInfo, ConnectionWorker>,
    log: Logger,
}

/// Shared handle threads use to talk to the manager: the command queue and
/// the `mio` readiness pair used to wake the worker out of `poll`.
struct ManagerHandle {
    commands: Mutex<VecDeque<Command>>,
    set_readiness: SetReadiness,
    listeners: Mutex<HashMap<u16, Arc<ListenerState>>>,
    log: Logger,
}

impl ManagerHandle {
    fn wake(&self) {
        let _ = self.set_readiness.set_readiness(Ready::readable());
    }

    fn push_command(&self, command: Command) {
        self.commands.lock().unwrap().push_back(command);
        self.wake();
    }

    /// Picks a client source port at random in the ephemeral range, the way
    /// `get_random_port()` in the original client does, retrying on
    /// collision with a port this process already has a connection on.
    fn allocate_ephemeral_port(&self) -> u16 {
        use rand::Rng;
        let taken = self.listeners.lock().unwrap();
        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(49152..=65535);
            if !taken.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// Public, clonable entry point used by `stream.rs`: `connect`, `listen`
/// and `accept` all go through this.
#[derive(Clone)]
pub struct NetworkManager {
    handle: Arc<ManagerHandle>,
}

static MANAGER: OnceLock<NetworkManager> = OnceLock::new();
static MANAGER_INIT: Mutex<()> = Mutex::new(());

impl NetworkManager {
    /// Returns the process-wide singleton, starting the I/O worker thread
    /// on first use. `OnceLock::get_or_init` can't run a fallible
    /// initializer on stable, so a plain mutex serializes the one-time
    /// socket-open-and-spawn below; the fast path never takes it.
    pub fn global(log: Logger) -> Result<NetworkManager> {
        if let Some(manager) = MANAGER.get() {
            return Ok(manager.clone());
        }

        let _guard = MANAGER_INIT.lock().unwrap();
        if let Some(manager) = MANAGER.get() {
            return Ok(manager.clone());
        }

        let manager = NetworkManager::start(log)?;
        let _ = MANAGER.set(manager.clone());
        Ok(manager)
    }

    fn start(log: Logger) -> Result<NetworkManager> {
        let socket = RawSocket::open().map_err(|e| Error::SocketCreate(e.to_string()))?;
        NetworkManager::start_with_substrate(Box::new(socket), log)
    }

    /// Runs the worker over an arbitrary `Substrate` instead of a real
    /// `RawSocket`, bypassing the process-wide singleton entirely — every
    /// call gets its own worker thread and connection table. Exists for
    /// integration tests that need to drive `manager.rs`'s handshake,
    /// retransmission and flow-control logic without `CAP_NET_RAW`
    /// (see `loopback.rs`); production code always goes through `global()`.
    pub fn start_with_substrate(socket: Box<dyn Substrate>, log: Logger) -> Result<NetworkManager> {
        let poll = Poll::new().map_err(|e| Error::SocketCreate(e.to_string()))?;
        poll.register(&socket, SOCKET_TOKEN, Ready::readable(), PollOpt::edge())
            .map_err(|e| Error::SocketCreate(e.to_string()))?;

        let (registration, set_readiness) = Registration::new2();
        poll.register(&registration, WAKE_TOKEN, Ready::readable(), PollOpt::edge())
            .map_err(|e| Error::SocketCreate(e.to_string()))?;

        let handle = Arc::new(ManagerHandle {
            commands: Mutex::new(VecDeque::new()),
            set_readiness,
            listeners: Mutex::new(HashMap::new()),
            log: log.clone(),
        });

        let worker_handle = handle.clone();
        std::thread::Builder::new()
            .name("mycp-io".into())
            .spawn(move || {
                // `registration` must outlive the loop so the wake source
                // stays registered; it is dropped only when the process
                // exits, since the worker never returns in normal operation.
                let _registration = registration;
                let mut state = WorkerState {
                    socket,
                    connections: HashMap::new(),
                    log,
                };
                run_loop(&worker_handle, &mut state, poll);
            })
            .expect("failed to spawn mycp I/O worker thread");

        Ok(NetworkManager { handle })
    }

    /// Registers interest in inbound SYNs on `port`, creating the listener
    /// if it does not already exist.
    pub fn listen(&self, port: u16) -> Arc<ListenerState> {
        self.handle
            .listeners
            .lock()
            .unwrap()
            .entry(port)
            .or_insert_with(|| Arc::new(ListenerState::new()))
            .clone()
    }

    pub fn allocate_ephemeral_port(&self) -> u16 {
        self.handle.allocate_ephemeral_port()
    }

    /// Begins a handshake toward `(remote_ip, remote_port)` from
    /// `local_port` and returns the (not-yet-established) shared handle.
    /// The caller blocks on `ConnectionShared::wait_for_established`.
    pub fn connect(&self, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> Arc<ConnectionShared> {
        let addr = AddrInfo::new(local_port, remote_ip, remote_port);
        let conn = Arc::new(ConnectionShared::new(addr, 0));
        self.handle.push_command(Command::Connect { conn: conn.clone() });
        conn
    }

    /// Tears down a connection's worker-side state. Safe to call more than
    /// once; the worker ignores unknown addresses.
    pub fn close(&self, addr: AddrInfo) {
        self.handle.push_command(Command::Close { addr });
    }
}

/// Upper bound on how long `poll` ever sleeps, independent of connection
/// RTOs: with zero live connections `next_poll_timeout` has nothing to
/// clamp against, and commands (new connects/listens) still need to be
/// picked up promptly.
const IDLE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

fn next_poll_timeout(state: &WorkerState) -> Duration {
    state
        .connections
        .values()
        .map(ConnectionWorker::poll_timeout)
        .min()
        .unwrap_or(IDLE_POLL_TIMEOUT)
}

fn run_loop(handle: &Arc<ManagerHandle>, state: &mut WorkerState, poll: Poll) {
    let mut events = Events::with_capacity(1024);

    loop {
        let timeout = next_poll_timeout(state);
        if let Err(err) = poll.poll(&mut events, Some(timeout)) {
            logging::error!(state.log, "poll failed"; "error" => %err);
            continue;
        }

        for event in &events {
            if event.token() == WAKE_TOKEN {
                drain_commands(handle, state);
            }
        }

        drain_socket(handle, state);
        let now = Instant::now();
        retransmit_due(state, now);
        flush_send_queues(handle, state, now);
        advance_pending_syns(handle, state, now);
    }
}

fn drain_commands(handle: &Arc<ManagerHandle>, state: &mut WorkerState) {
    loop {
        let command = handle.commands.lock().unwrap().pop_front();
        let Some(command) = command else { break };
        match command {
            Command::Connect { conn } => {
                let worker = ConnectionWorker {
                    shared: conn.clone(),
                    retransmit: RetransmitSet::new(),
                    next_send_sequence: 0,
                    rto: MIN_RTO,
                    max_in_flight: INITIAL_MAX_IN_FLIGHT,
                    peer_window: INITIAL_PEER_WINDOW,
                    syn_attempts: 0,
                    last_syn_sent: Instant::now() - MIN_RTO,
                };
                state.connections.insert(conn.addr, worker);
            }
            Command::Close { addr } => {
                if let Some(worker) = state.connections.get(&addr) {
                    send_packet(
                        &state.socket,
                        &state.log,
                        worker.shared.addr,
                        Packet::close(addr.local_port, addr.remote_port, worker.next_send_sequence, now_ms()),
                    );
                }
                state.connections.remove(&addr);
            }
        }
    }
}

fn send_packet(socket: &dyn Substrate, log: &Logger, addr: AddrInfo, packet: Packet) {
    let bytes = packet::encode(&packet);
    if let Err(err) = socket.send_to(addr.remote_ip, &bytes) {
        if err.kind() != std::io::ErrorKind::WouldBlock {
            logging::warn!(log, "sendto failed"; "addr" => ?addr, "error" => %err);
        }
    }
}

fn drain_socket(handle: &Arc<ManagerHandle>, state: &mut WorkerState) {
    loop {
        let inbound = match state.socket.recv_from() {
            Ok(Some(inbound)) => inbound,
            Ok(None) => break,
            Err(err) => {
                logging::warn!(state.log, "recvfrom failed"; "error" => %err);
                break;
            }
        };

        let packet = match packet::decode(&inbound.payload) {
            Ok(packet) => packet,
            Err(reason) => {
                logging::trace!(state.log, "dropping datagram"; "reason" => %reason);
                continue;
            }
        };

        handle_packet(handle, state, inbound.src_ip, packet);
    }
}

fn handle_packet(handle: &Arc<ManagerHandle>, state: &mut WorkerState, src_ip: Ipv4Addr, packet: Packet) {
    let addr = AddrInfo::new(packet.header.dst_port, src_ip, packet.header.src_port);

    if state.connections.contains_key(&addr) {
        let WorkerState { socket, connections, log } = state;
        let worker = connections.get_mut(&addr).expect("checked above");
        dispatch_to_connection(socket, log, worker, packet);
        return;
    }

    if packet.header.kind == PacketKind::Syn {
        accept_new_connection(handle, state, addr, packet);
    } else {
        // No tracked connection matches this (local_port, remote_ip, remote_port)
        // triple, so the datagram is either stale or from an unexpected source.
        logging::trace!(state.log, "dropping datagram"; "addr" => ?addr, "kind" => ?packet.header.kind, "reason" => %DropReason::AddressMismatch);
    }
}

fn dispatch_to_connection(socket: &dyn Substrate, log: &Logger, worker: &mut ConnectionWorker, packet: Packet) {
    match packet.header.kind {
        PacketKind::SynAck => {
            if worker.shared.lifecycle() == LifecycleState::SynSent {
                worker.shared.set_lifecycle(LifecycleState::Established);
            }
        }
        PacketKind::Data => {
            let seq = packet.header.packet_number;
            if let Body::Data(payload) = packet.body {
                if worker.shared.free_window_bytes() == 0 {
                    logging::trace!(log, "receive window exhausted, dropping"; "reason" => %DropReason::WindowExhausted);
                } else {
                    worker.shared.insert_data(seq, payload);
                    let ack = Packet::ack(
                        worker.shared.addr.local_port,
                        worker.shared.addr.remote_port,
                        worker.shared.max_contiguous_sequence(),
                        packet.header.timestamp,
                        worker.shared.free_window_bytes().min(u16::MAX as usize) as u16,
                    );
                    send_packet(socket, log, worker.shared.addr, ack);
                }
            }
        }
        PacketKind::Ack => {
            if let Body::Ack { advertised_window } = packet.body {
                // packet_number on an ACK carries the cumulative max
                // contiguous sequence the peer holds, not the number of any
                // single DATA packet (§8's ack-coverage invariant only
                // holds under that reading).
                worker.retransmit.ack_up_to(packet.header.packet_number);
                worker.peer_window = advertised_window as usize;
            }
        }
        PacketKind::Close => {
            worker.shared.mark_terminal(Terminal::PeerClosed);
        }
        PacketKind::Syn => {
            logging::trace!(log, "duplicate SYN on established connection"; "addr" => ?worker.shared.addr);
        }
    }
}

fn accept_new_connection(handle: &Arc<ManagerHandle>, state: &mut WorkerState, addr: AddrInfo, syn: Packet) {
    let listener = {
        let listeners = handle.listeners.lock().unwrap();
        listeners.get(&addr.local_port).cloned()
    };

    let Some(listener) = listener else {
        logging::trace!(state.log, "SYN for unknown port"; "port" => addr.local_port);
        return;
    };

    let shared = Arc::new(ConnectionShared::new_established(addr, 0));
    let worker = ConnectionWorker {
        shared: shared.clone(),
        retransmit: RetransmitSet::new(),
        next_send_sequence: 0,
        rto: MIN_RTO,
        max_in_flight: INITIAL_MAX_IN_FLIGHT,
        peer_window: INITIAL_PEER_WINDOW,
        syn_attempts: 0,
        last_syn_sent: Instant::now(),
    };
    state.connections.insert(addr, worker);

    let syn_ack = Packet::syn_ack(addr.local_port, addr.remote_port, syn.header.packet_number, now_ms());
    send_packet(&state.socket, &state.log, addr, syn_ack);

    listener.push(shared);
}

/// Resends the client-side SYN until a SYN-ACK arrives, up to
/// `MAX_SYN_ATTEMPTS`, at which point the handshake fails with
/// `Error::ConnectRefused` (§4.6, §7).
fn advance_pending_syns(handle: &Arc<ManagerHandle>, state: &mut WorkerState, now: Instant) {
    let mut to_remove = Vec::new();

    for (addr, worker) in state.connections.iter_mut() {
        if worker.shared.lifecycle() != LifecycleState::SynSent {
            continue;
        }
        if now.duration_since(worker.last_syn_sent) < worker.rto {
            continue;
        }
        if worker.syn_attempts >= MAX_SYN_ATTEMPTS {
            worker.shared.fail_handshake(Error::ConnectRefused(worker.syn_attempts));
            to_remove.push(*addr);
            continue;
        }

        let syn = Packet::syn(addr.local_port, addr.remote_port, worker.next_send_sequence, now_ms());
        send_packet(&state.socket, &state.log, *addr, syn);
        worker.last_syn_sent = now;
        worker.syn_attempts += 1;
    }

    for addr in to_remove {
        state.connections.remove(&addr);
    }
    let _ = handle;
}

/// §4.5 step 5a: re-send anything whose RTO has elapsed, then adjust the
/// AIMD knob for next tick — multiplicative decrease on loss, additive
/// increase on a clean pass, and RTO doubles/halves in step.
fn retransmit_due(state: &mut WorkerState, now: Instant) {
    for (addr, worker) in state.connections.iter_mut() {
        let timed_out = worker.retransmit.take_timed_out(now, worker.rto);
        if timed_out.is_empty() {
            worker.max_in_flight += 1;
            worker.rto = (worker.rto / 2).max(MIN_RTO);
            continue;
        }

        worker.max_in_flight = (worker.max_in_flight / 2).max(1);
        worker.rto = (worker.rto * 2).min(MAX_RTO);
        for packet in timed_out {
            send_packet(&state.socket, &state.log, *addr, packet);
        }
    }
}

/// §4.5 step 5c: drain the send queue while the packet-count cap and the
/// peer's advertised byte window both still have room. A chunk that would
/// overrun the peer window is pushed back rather than sent, so a
/// zero-window peer stalls the sender cleanly (§8) instead of looping.
fn flush_send_queues(handle: &Arc<ManagerHandle>, state: &mut WorkerState, now: Instant) {
    for (addr, worker) in state.connections.iter_mut() {
        if worker.shared.lifecycle() != LifecycleState::Established {
            continue;
        }

        loop {
            if worker.retransmit.len() >= worker.max_in_flight {
                break;
            }
            let Some(chunk) = worker.shared.send_queue.pop() else { break };
            if worker.retransmit.outstanding_bytes() + chunk.len() > worker.peer_window {
                worker.shared.send_queue.push_front(chunk);
                break;
            }

            let packet = Packet::data(addr.local_port, addr.remote_port, worker.next_send_sequence, now_ms(), chunk.clone());
            match state.socket.send_to(addr.remote_ip, &packet::encode(&packet)) {
                Ok(_) => {
                    worker.retransmit.push(packet, now);
                    worker.next_send_sequence += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    worker.shared.send_queue.push_front(chunk);
                    break;
                }
                Err(err) => {
                    logging::warn!(state.log, "sendto failed"; "addr" => ?addr, "error" => %err);
                    worker.shared.mark_terminal(Terminal::IoError(err.to_string()));
                    break;
                }
            }
        }
    }
    let _ = handle;
}
