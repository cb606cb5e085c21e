//! The select-loop reactor
//!
//! One reactor owns every socket it opens. A dedicated thread blocks in
//! `select`; other threads submit work by taking the reactor lock to adjust
//! fd sets and queues, then writing to a self-pipe so the sleeping `select`
//! returns and re-reads the sets. Sockets are only ever closed on the
//! reactor thread, after housekeeping has removed them from the fd sets and
//! the socket table.
//!
//! Completion callbacks are invoked with no reactor or connection lock held,
//! so a callback may immediately submit more I/O on its own handle.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::addr::{bind_addr, resolve_target};
use super::buffer::{IoBuffer, IoOp};
use super::conn::{ConnKind, Connection, Timeouts, WaitFlags};
use super::fdset::{FD_SET_CAPACITY, FdSet, select};
use crate::alloc_site;
use crate::error::{Error, Result};
use crate::platform::{self, NETWORK_MTU, SockBuf};
use crate::table::{NameTable, TableOptions};
use bitflags::bitflags;

/// The wake message written to the self-pipe.
const WAKE_MESSAGE: &[u8] = b"GW1\0";
/// Back-off after a failed select, so a bad descriptor cannot busy-loop.
const SELECT_ERROR_SLEEP_MS: u64 = 100;
/// Connections timed out per housekeeping pass.
const MAX_TIMEOUTS_PER_CHECK: usize = 64;
const LISTEN_BACKLOG: i32 = 5;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Operations on this connection never time out.
        const NEVER_TIMEOUT = 1 << 0;
    }
}

/// Completion events delivered to a connection's callback.
pub enum IoEvent {
    /// The async connect finished, or failed with the given error.
    Connect(Result<()>),
    /// A listener produced a new connection.
    Accept(ConnHandle),
    /// A read completed; the buffer carries the data or the terminal error.
    Read(IoBuffer),
    /// A queued write fully drained, or failed.
    Write(Result<()>),
    /// The peer went away while nothing was outstanding.
    PeerDisconnect(Error),
}

impl std::fmt::Debug for IoEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoEvent::Connect(result) => write!(f, "Connect({result:?})"),
            IoEvent::Accept(_) => write!(f, "Accept(..)"),
            IoEvent::Read(buffer) => write!(f, "Read({:?})", buffer.result()),
            IoEvent::Write(result) => write!(f, "Write({result:?})"),
            IoEvent::PeerDisconnect(err) => write!(f, "PeerDisconnect({err})"),
        }
    }
}

pub type IoCallback = Arc<dyn Fn(&ConnHandle, IoEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// How often housekeeping checks timeouts; also the select timeout.
    pub timeout_check_ms: u64,
    /// Upper bound on live connections; capped by the fd-set size less the
    /// self-pipe and slack.
    pub max_connections: usize,
    pub socket_buffer_bytes: usize,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig {
            connect_timeout_ms: 150 * 1000,
            read_timeout_ms: 200 * 1000,
            write_timeout_ms: 150 * 1000,
            timeout_check_ms: 5000,
            max_connections: FD_SET_CAPACITY - 3,
            socket_buffer_bytes: 16_000,
        }
    }
}

struct ReactorState {
    read_set: FdSet,
    write_set: FdSet,
    except_set: FdSet,
    /// One past the highest registered descriptor, for `select`.
    fd_range: RawFd,
    /// Socket handle -> connection.
    table: NameTable<Arc<Connection>>,
    /// Every live connection.
    conns: Vec<Arc<Connection>>,
    pending_close: VecDeque<Arc<Connection>>,
    /// Suppresses redundant self-pipe writes.
    pending_wakeup: bool,
    last_timeout_check_ms: u64,
}

/// Lifetime counters, readable at any time via [`Reactor::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorStats {
    /// Connections currently registered (listeners included).
    pub open_connections: usize,
    /// Client and server sockets opened over the reactor's lifetime.
    pub total_opened: u64,
    /// Connections produced by listeners.
    pub total_accepted: u64,
    /// Connections torn down by housekeeping.
    pub total_closed: u64,
    /// Operation timeouts fired.
    pub timeouts_fired: u64,
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    accepted: AtomicU64,
    closed: AtomicU64,
    timeouts: AtomicU64,
}

struct Shared {
    config: ReactorConfig,
    state: Mutex<ReactorState>,
    counters: Counters,
    /// Signalled when the pending-close queue drains.
    all_closed: Condvar,
    wake_send_fd: RawFd,
    wake_recv_fd: RawFd,
    stop: AtomicBool,
}

fn fd_key(fd: RawFd) -> [u8; 4] {
    fd.to_ne_bytes()
}

impl Shared {
    /// Poke the select loop. The flag collapses bursts of wake-ups into one
    /// self-pipe write.
    fn wake(&self) {
        {
            let mut state = platform::lock(&self.state);
            if state.pending_wakeup {
                return;
            }
            state.pending_wakeup = true;
        }
        let mut remaining = WAKE_MESSAGE;
        while !remaining.is_empty() {
            match platform::send_socket(self.wake_send_fd, remaining) {
                Ok(sent) => remaining = &remaining[sent..],
                Err(err) if platform::would_block(&err) => platform::sleep_ms(100),
                Err(err) => {
                    warn!("self-pipe write failed: {err}");
                    break;
                }
            }
        }
    }
}

/// A handle to one connection. Cheap to clone; callbacks receive one with
/// every event.
#[derive(Clone)]
pub struct ConnHandle {
    conn: Arc<Connection>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnHandle(fd {})", self.conn.fd)
    }
}

pub struct Reactor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Reactor::with_config(ReactorConfig::default())
    }

    pub fn with_config(config: ReactorConfig) -> Result<Reactor> {
        // The self-pipe: a connected loopback TCP pair. The receive end sits
        // in the read set forever; writing one tag to the send end is how
        // any thread interrupts the sleeping select.
        let (wake_send_fd, wake_recv_fd) = Reactor::make_self_pipe().map_err(|err| {
            warn!("self-pipe setup failed: {err}");
            Error::from_os(&err)
        })?;

        let mut read_set = FdSet::new();
        read_set.insert(wake_recv_fd);
        let state = ReactorState {
            read_set,
            write_set: FdSet::new(),
            except_set: FdSet::new(),
            fd_range: wake_recv_fd + 1,
            table: NameTable::new(TableOptions::empty(), 6),
            conns: Vec::new(),
            pending_close: VecDeque::new(),
            pending_wakeup: false,
            last_timeout_check_ms: platform::ticks_ms(),
        };
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(state),
            counters: Counters::default(),
            all_closed: Condvar::new(),
            wake_send_fd,
            wake_recv_fd,
            stop: AtomicBool::new(false),
        });

        let worker = shared.clone();
        let thread = match platform::spawn_thread("net-reactor", move || run(worker)) {
            Ok(thread) => thread,
            Err(err) => {
                unsafe {
                    libc::close(wake_send_fd);
                    libc::close(wake_recv_fd);
                }
                return Err(Error::from_os(&err));
            }
        };

        Ok(Reactor { shared, thread: Mutex::new(Some(thread)) })
    }

    fn make_self_pipe() -> io::Result<(RawFd, RawFd)> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let send = TcpStream::connect(listener.local_addr()?)?;
        let (recv, _) = listener.accept()?;
        send.set_nonblocking(true)?;
        recv.set_nonblocking(true)?;
        Ok((send.into_raw_fd(), recv.into_raw_fd()))
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.shared.config
    }

    /// Open a non-blocking TCP client connection. The callback's `Connect`
    /// event reports completion or failure.
    pub fn open_client(
        &self,
        target: &str,
        flags: OpenFlags,
        callback: IoCallback,
    ) -> Result<ConnHandle> {
        let addr = resolve_target(target)?;
        let config = &self.shared.config;
        let fd = platform::tcp_socket().map_err(|err| Error::from_os(&err))?;

        let prepared = platform::set_nonblocking(fd)
            .and_then(|()| platform::set_socket_buffer(fd, SockBuf::Send, config.socket_buffer_bytes))
            .and_then(|()| platform::set_socket_buffer(fd, SockBuf::Recv, config.socket_buffer_bytes));
        if let Err(err) = prepared {
            platform::safe_close_socket(fd, false);
            return Err(Error::from_os(&err));
        }

        let conn = Arc::new(Connection::new(
            fd,
            ConnKind::Tcp,
            Some(addr),
            self.timeouts(),
            callback,
        ));

        // Arm the connect state before the socket is visible to the select
        // thread, so a fast completion cannot be missed.
        {
            let mut conn_state = platform::lock(&conn.state);
            if flags.contains(OpenFlags::NEVER_TIMEOUT) {
                conn_state.wait.insert(WaitFlags::NEVER_TIMEOUT);
            }
            conn_state.wait.insert(WaitFlags::CONNECTING);
            conn_state.start_timeout(IoOp::Connect, &conn.timeouts);
        }

        // Register before connecting so the select thread cannot miss a fast
        // completion; the wake itself can wait until the connect is issued.
        {
            let mut state = platform::lock(&self.shared.state);
            if let Err(err) = register(config, &mut state, &conn, true) {
                drop(state);
                platform::safe_close_socket(fd, false);
                return Err(err);
            }
        }

        debug!("connecting socket {} to {}", fd, addr);
        if let Err(err) = platform::connect_socket(fd, addr) {
            debug!("connect failed synchronously: {err}");
            prepare_to_disconnect(&self.shared, &conn);
            return Err(Error::NoResponse);
        }
        self.shared.wake();

        self.shared.counters.opened.fetch_add(1, Ordering::Relaxed);
        Ok(ConnHandle { conn, shared: self.shared.clone() })
    }

    /// Open a TCP listener or a bound UDP socket. TCP listeners surface new
    /// connections through `Accept` events; UDP sockets deliver unsolicited
    /// `Read` events carrying the datagram source.
    pub fn open_server(
        &self,
        udp: bool,
        port: u16,
        loopback_only: bool,
        callback: IoCallback,
    ) -> Result<ConnHandle> {
        let fd = if udp {
            platform::udp_socket().map_err(|err| Error::from_os(&err))?
        } else {
            platform::tcp_socket().map_err(|err| Error::from_os(&err))?
        };

        let addr = bind_addr(port, loopback_only);
        let prepared = platform::set_nonblocking(fd)
            .and_then(|()| platform::bind_socket(fd, addr));
        if let Err(err) = prepared {
            warn!("server bind to {addr} failed: {err}");
            platform::safe_close_socket(fd, udp);
            return Err(Error::from_os(&err));
        }

        let kind = if udp { ConnKind::Udp } else { ConnKind::Listener };
        let conn = Arc::new(Connection::new(fd, kind, None, self.timeouts(), callback));
        {
            let mut state = platform::lock(&self.shared.state);
            if let Err(err) = register(&self.shared.config, &mut state, &conn, false) {
                drop(state);
                platform::safe_close_socket(fd, udp);
                return Err(err);
            }
        }

        if !udp {
            if let Err(err) = platform::listen_socket(fd, LISTEN_BACKLOG) {
                warn!("listen failed: {err}");
                prepare_to_disconnect(&self.shared, &conn);
                return Err(Error::from_os(&err));
            }
        }

        self.shared.wake();
        self.shared.counters.opened.fetch_add(1, Ordering::Relaxed);
        Ok(ConnHandle { conn, shared: self.shared.clone() })
    }

    fn timeouts(&self) -> Timeouts {
        let config = &self.shared.config;
        Timeouts {
            connect_ms: config.connect_timeout_ms,
            read_ms: config.read_timeout_ms,
            write_ms: config.write_timeout_ms,
        }
    }

    /// Live connections currently registered.
    pub fn active_connections(&self) -> usize {
        platform::lock(&self.shared.state).conns.len()
    }

    pub fn stats(&self) -> ReactorStats {
        let counters = &self.shared.counters;
        ReactorStats {
            open_connections: self.active_connections(),
            total_opened: counters.opened.load(Ordering::Relaxed),
            total_accepted: counters.accepted.load(Ordering::Relaxed),
            total_closed: counters.closed.load(Ordering::Relaxed),
            timeouts_fired: counters.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Block until every close requested so far has been carried out by the
    /// reactor thread. Returns false on timeout.
    pub fn wait_for_all_closed(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = platform::lock(&self.shared.state);
        while !state.pending_close.is_empty() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .shared
                .all_closed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
        true
    }

    /// Stop the select thread and release the self-pipe. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("reactor shutting down");
        self.shared.wake();
        if let Some(thread) = platform::lock(&self.thread).take() {
            let _ = thread.join();
        }
        unsafe {
            libc::close(self.shared.wake_send_fd);
            libc::close(self.shared.wake_recv_fd);
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ConnHandle {
    /// Submit a read. If data is already available the callback fires inline
    /// from this thread; otherwise the buffer parks until select reports the
    /// socket readable.
    pub fn read_block_async(&self, buffer: IoBuffer) -> Result<()> {
        let conn = &self.conn;
        if conn.is_listener() {
            return Err(Error::InvalidArgument);
        }
        let mut completed: Option<IoBuffer> = None;
        let mut closed: Option<Error> = None;
        {
            let mut state = platform::lock(&conn.state);
            if !state.open {
                return Err(Error::EndOfStream);
            }
            let mut buffer = buffer;
            match do_read(conn, &mut buffer) {
                ReadOutcome::Data { .. } => {
                    state.cancel_timeout(IoOp::Read);
                    completed = Some(buffer);
                }
                ReadOutcome::WouldBlock => {
                    // select always watches reads, so parking is enough.
                    state.pending_reads.push_back(buffer);
                    state.wait.insert(WaitFlags::READING);
                    state.start_timeout(IoOp::Read, &conn.timeouts);
                }
                ReadOutcome::Closed(err) => {
                    state.cancel_timeout(IoOp::Read);
                    buffer.set_error(err);
                    completed = Some(buffer);
                    closed = Some(err);
                }
            }
        }
        if let Some(buffer) = completed {
            deliver(&self.shared, conn, IoEvent::Read(buffer));
        }
        if closed.is_some() {
            prepare_to_disconnect(&self.shared, conn);
        }
        Ok(())
    }

    /// Submit a write. A full inline send completes immediately; anything
    /// else parks the buffer, arms the write select and wakes the reactor.
    pub fn write_block_async(&self, buffer: IoBuffer) -> Result<()> {
        let conn = &self.conn;
        if conn.is_listener() {
            return Err(Error::InvalidArgument);
        }
        let mut finished: Option<Result<()>> = None;
        let mut rearm = false;
        {
            let mut state = platform::lock(&conn.state);
            if !state.open {
                return Err(Error::PeerDisconnected);
            }
            // Keep completions FIFO: anything already queued (or a connect
            // still in flight) forces this buffer behind it.
            let must_park = state.wait.contains(WaitFlags::CONNECTING)
                || state.wait.contains(WaitFlags::WRITING)
                || !state.pending_writes.is_empty();
            if must_park {
                state.pending_writes.push_back(buffer);
                state.wait.insert(WaitFlags::WRITING);
                state.start_timeout(IoOp::Write, &conn.timeouts);
                rearm = true;
            } else {
                let mut buffer = buffer;
                let udp_dest = state.udp_dest;
                match do_write(conn, &mut buffer, udp_dest) {
                    WriteOutcome::Finished(result) => {
                        state.cancel_timeout(IoOp::Write);
                        finished = Some(result);
                    }
                    WriteOutcome::Again => {
                        state.pending_writes.push_back(buffer);
                        state.wait.insert(WaitFlags::WRITING);
                        state.start_timeout(IoOp::Write, &conn.timeouts);
                        rearm = true;
                    }
                }
            }
        }
        if rearm {
            {
                let mut state = platform::lock(&self.shared.state);
                state.write_set.insert(conn.fd);
            }
            self.shared.wake();
        }
        if let Some(result) = finished {
            let failed = result.is_err();
            deliver(&self.shared, conn, IoEvent::Write(result));
            if failed {
                prepare_to_disconnect(&self.shared, conn);
            }
        }
        Ok(())
    }

    /// Request teardown. The reactor thread removes the socket from the fd
    /// sets and the socket table, closes it, and releases queued buffers.
    /// Idempotent.
    pub fn close(&self) {
        prepare_to_disconnect(&self.shared, &self.conn);
    }

    /// Set the destination for subsequent UDP writes.
    pub fn set_udp_dest(&self, dest: SocketAddrV4) {
        platform::lock(&self.conn.state).udp_dest = Some(dest);
    }

    /// The locally bound address (useful for servers opened on port 0).
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        platform::local_addr(self.conn.fd).map_err(|err| Error::from_os(&err))
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.conn.peer
    }

    /// Whether the connection still accepts submissions.
    pub fn is_open(&self) -> bool {
        platform::lock(&self.conn.state).open
    }

    /// Test hook: tear the connection down as if the network had failed.
    #[cfg(test)]
    pub(crate) fn simulate_network_error(&self) {
        deliver(&self.shared, &self.conn, IoEvent::PeerDisconnect(Error::NoResponse));
        prepare_to_disconnect(&self.shared, &self.conn);
    }
}

/// Add a connection to the fd sets, the socket table and the live list.
/// Called with the reactor lock held.
fn register(
    config: &ReactorConfig,
    state: &mut ReactorState,
    conn: &Arc<Connection>,
    want_write: bool,
) -> Result<()> {
    if state.conns.len() >= config.max_connections {
        return Err(Error::TooManySockets);
    }
    if conn.fd as usize >= FD_SET_CAPACITY {
        return Err(Error::TooManySockets);
    }
    state.read_set.insert(conn.fd);
    state.except_set.insert(conn.fd);
    if want_write {
        state.write_set.insert(conn.fd);
    }
    if conn.fd >= state.fd_range {
        state.fd_range = conn.fd + 1;
    }
    state.table.set_value(&fd_key(conn.fd), conn.clone())?;
    state.conns.push(conn.clone());
    Ok(())
}

fn deliver(shared: &Arc<Shared>, conn: &Arc<Connection>, event: IoEvent) {
    let handle = ConnHandle { conn: conn.clone(), shared: shared.clone() };
    (conn.callback)(&handle, event);
}

/// Mark a connection for teardown and hand it to the reactor thread.
fn prepare_to_disconnect(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    {
        let mut state = platform::lock(&conn.state);
        if state.wait.contains(WaitFlags::CLOSING) {
            return;
        }
        state.wait.insert(WaitFlags::CLOSING);
        state.open = false;
        // Pending reads are discarded; their buffers free on drop.
        state.pending_reads.clear();
    }
    {
        let mut state = platform::lock(&shared.state);
        state.pending_close.push_back(conn.clone());
    }
    shared.wake();
}

// =============================================================================
// SELECT THREAD
// =============================================================================

fn run(shared: Arc<Shared>) {
    info!("reactor thread running");
    loop {
        let (mut read, mut write, mut except, fd_range) = {
            let state = platform::lock(&shared.state);
            (
                state.read_set.copy(),
                state.write_set.copy(),
                state.except_set.copy(),
                state.fd_range,
            )
        };

        let selected = select(
            fd_range,
            &mut read,
            &mut write,
            &mut except,
            shared.config.timeout_check_ms,
        );

        // After this point any thread that mutates the fd sets must send a
        // fresh wake-up; clearing the flag before processing makes that safe.
        {
            let mut state = platform::lock(&shared.state);
            state.pending_wakeup = false;
        }
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let ready = match selected {
            Ok(count) => count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                // Usually a closed-but-not-cleared descriptor; housekeeping
                // below gets a chance to remove it.
                warn!("select failed: {err}");
                platform::sleep_ms(SELECT_ERROR_SLEEP_MS);
                housekeeping(&shared);
                continue;
            }
        };

        if ready > 0 {
            for fd in 0..fd_range {
                let readable = read.contains(fd);
                let writable = write.contains(fd);
                let excepted = except.contains(fd);
                if !readable && !writable && !excepted {
                    continue;
                }
                if fd == shared.wake_recv_fd {
                    drain_wake(fd);
                    continue;
                }
                // Socket handle -> connection through the socket table.
                let conn = {
                    let state = platform::lock(&shared.state);
                    state.table.get_value(&fd_key(fd)).cloned()
                };
                let Some(conn) = conn else { continue };
                if readable {
                    process_read(&shared, &conn);
                }
                if writable {
                    process_write(&shared, &conn);
                }
                if excepted {
                    process_exception(&shared, &conn);
                }
            }
        }

        housekeeping(&shared);
    }

    // Final drain, then close whatever is left; only this thread closes
    // sockets.
    housekeeping(&shared);
    let leftover = {
        let mut state = platform::lock(&shared.state);
        std::mem::take(&mut state.conns)
    };
    for conn in leftover {
        platform::safe_close_socket(conn.fd, conn.is_udp());
    }
    info!("reactor thread stopped");
}

fn drain_wake(fd: RawFd) {
    let mut scratch = [0u8; 256];
    loop {
        match platform::recv_socket(fd, &mut scratch) {
            Ok(count) if count > 0 => continue,
            _ => break,
        }
    }
}

enum ReadOutcome {
    Data { full: bool },
    WouldBlock,
    Closed(Error),
}

/// One non-blocking receive into `buffer`, clipped to the MTU block size.
fn do_read(conn: &Connection, buffer: &mut IoBuffer) -> ReadOutcome {
    let clip = buffer.capacity().min(NETWORK_MTU);
    if clip == 0 {
        return ReadOutcome::WouldBlock;
    }
    if conn.is_udp() {
        match platform::recv_from_socket(conn.fd, &mut buffer.space_mut()[..clip]) {
            Ok((0, _)) => ReadOutcome::Closed(Error::EndOfStream),
            Ok((count, from)) => {
                buffer.set_valid(count);
                buffer.set_peer(from);
                ReadOutcome::Data { full: count == clip }
            }
            Err(err) if platform::would_block(&err) || platform::not_connected(&err) => {
                ReadOutcome::WouldBlock
            }
            Err(err) => {
                debug!("recvfrom failed on {}: {err}", conn.fd);
                ReadOutcome::Closed(Error::EndOfStream)
            }
        }
    } else {
        match platform::recv_socket(conn.fd, &mut buffer.space_mut()[..clip]) {
            // Zero from a stream socket is the peer's orderly close.
            Ok(0) => ReadOutcome::Closed(Error::EndOfStream),
            Ok(count) => {
                buffer.set_valid(count);
                ReadOutcome::Data { full: count == clip }
            }
            Err(err) if platform::would_block(&err) || platform::not_connected(&err) => {
                ReadOutcome::WouldBlock
            }
            Err(err) => {
                debug!("recv failed on {}: {err}", conn.fd);
                ReadOutcome::Closed(Error::EndOfStream)
            }
        }
    }
}

enum WriteOutcome {
    Finished(Result<()>),
    Again,
}

/// One non-blocking send of whatever remains in `buffer`.
fn do_write(conn: &Connection, buffer: &mut IoBuffer, udp_dest: Option<SocketAddrV4>) -> WriteOutcome {
    let offset = buffer.start_write();
    let sent = if conn.is_udp() {
        let Some(dest) = buffer.peer().or(udp_dest) else {
            buffer.set_error(Error::InvalidArgument);
            return WriteOutcome::Finished(Err(Error::InvalidArgument));
        };
        platform::send_to_socket(conn.fd, &buffer.as_slice()[offset..], dest)
    } else {
        platform::send_socket(conn.fd, &buffer.as_slice()[offset..])
    };
    match sent {
        Ok(count) => {
            buffer.advance_write(count);
            if buffer.write_finished() {
                WriteOutcome::Finished(Ok(()))
            } else {
                WriteOutcome::Again
            }
        }
        Err(err) if platform::would_block(&err) => WriteOutcome::Again,
        Err(err) => {
            debug!("send failed on {}: {err}", conn.fd);
            buffer.set_error(Error::PeerDisconnected);
            WriteOutcome::Finished(Err(Error::PeerDisconnected))
        }
    }
}

/// Readable socket: accept on listeners, otherwise drain full blocks until
/// the socket would block.
fn process_read(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    if conn.is_listener() {
        accept_ready(shared, conn);
        return;
    }

    let mut completions: Vec<IoBuffer> = Vec::new();
    let mut closed: Option<(Error, bool)> = None;
    {
        let mut state = platform::lock(&conn.state);
        if !state.open {
            return;
        }
        state.wait.remove(WaitFlags::READING);
        loop {
            let (mut buffer, solicited) = match state.pending_reads.pop_front() {
                Some(buffer) => (buffer, true),
                // Unsolicited data still gets a buffer and a completion.
                None => match IoBuffer::with_capacity(NETWORK_MTU, alloc_site!()) {
                    Ok(buffer) => (buffer, false),
                    Err(err) => {
                        warn!("no buffer for unsolicited read: {err}");
                        break;
                    }
                },
            };
            match do_read(conn, &mut buffer) {
                ReadOutcome::Data { full } => {
                    state.cancel_timeout(IoOp::Read);
                    completions.push(buffer);
                    if !full {
                        break;
                    }
                }
                ReadOutcome::WouldBlock => {
                    state.pending_reads.push_front(buffer);
                    state.wait.insert(WaitFlags::READING);
                    break;
                }
                ReadOutcome::Closed(err) => {
                    state.cancel_timeout(IoOp::Read);
                    if solicited {
                        buffer.set_error(err);
                        completions.push(buffer);
                    }
                    closed = Some((err, solicited));
                    break;
                }
            }
        }
    }

    for buffer in completions {
        deliver(shared, conn, IoEvent::Read(buffer));
    }
    if let Some((err, solicited)) = closed {
        if !solicited {
            // Nothing was outstanding; report the disappearance directly.
            deliver(shared, conn, IoEvent::PeerDisconnect(err));
        }
        prepare_to_disconnect(shared, conn);
    }
}

/// Listener readable: accept one connection and hand it to the listener's
/// callback.
fn accept_ready(shared: &Arc<Shared>, listener: &Arc<Connection>) {
    let (fd, peer) = match platform::accept_socket(listener.fd) {
        Ok(accepted) => accepted,
        Err(err) => {
            if !platform::would_block(&err) {
                warn!("accept failed: {err}");
            }
            return;
        }
    };
    debug!("accepted socket {} from {}", fd, peer);

    let prepared = platform::set_nonblocking(fd)
        .and_then(|()| {
            platform::set_socket_buffer(fd, SockBuf::Send, shared.config.socket_buffer_bytes)
        })
        .and_then(|()| {
            platform::set_socket_buffer(fd, SockBuf::Recv, shared.config.socket_buffer_bytes)
        });
    if let Err(err) = prepared {
        warn!("accepted socket setup failed: {err}");
        platform::safe_close_socket(fd, false);
        return;
    }

    let conn = Arc::new(Connection::new(
        fd,
        ConnKind::Accepted,
        Some(peer),
        listener.timeouts,
        listener.callback.clone(),
    ));
    {
        let mut state = platform::lock(&shared.state);
        if let Err(err) = register(&shared.config, &mut state, &conn, false) {
            drop(state);
            warn!("dropping accepted connection: {err}");
            platform::safe_close_socket(fd, false);
            return;
        }
    }

    shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
    let handle = ConnHandle { conn: conn.clone(), shared: shared.clone() };
    deliver(shared, &conn, IoEvent::Accept(handle));
}

/// Writable socket: either the async connect completed, or the head write
/// buffer can drain some more.
fn process_write(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    // Clear the write interest immediately. Selecting for write is
    // edge-like: a ready-to-write socket with nothing to send would spin
    // the loop.
    {
        let mut state = platform::lock(&shared.state);
        state.write_set.remove(conn.fd);
        state.except_set.remove(conn.fd);
    }

    let mut connect_result: Option<Result<()>> = None;
    let mut write_result: Option<Result<()>> = None;
    let mut rearm = false;
    {
        let mut state = platform::lock(&conn.state);
        if !state.open {
            return;
        }
        if state.wait.contains(WaitFlags::CONNECTING) {
            state.wait.remove(WaitFlags::CONNECTING);
            state.cancel_timeout(IoOp::Connect);
            let result = match platform::take_socket_error(conn.fd) {
                Ok(None) | Err(_) => Ok(()),
                Ok(Some(os_err)) => Err(Error::from_os(&os_err)),
            };
            if result.is_ok() && !state.pending_writes.is_empty() {
                // Writes queued while connecting resume now.
                rearm = true;
            }
            connect_result = Some(result);
        } else {
            state.wait.remove(WaitFlags::WRITING);
            let udp_dest = state.udp_dest;
            if let Some(mut buffer) = state.pending_writes.pop_front() {
                match do_write(conn, &mut buffer, udp_dest) {
                    WriteOutcome::Finished(result) => {
                        state.cancel_timeout(IoOp::Write);
                        write_result = Some(result);
                    }
                    WriteOutcome::Again => {
                        state.pending_writes.push_front(buffer);
                        state.wait.insert(WaitFlags::WRITING);
                        rearm = true;
                    }
                }
            }
        }
    }

    if rearm {
        let mut state = platform::lock(&shared.state);
        state.write_set.insert(conn.fd);
        state.except_set.insert(conn.fd);
    }

    if let Some(result) = connect_result {
        let failed = result.is_err();
        deliver(shared, conn, IoEvent::Connect(result));
        if failed {
            prepare_to_disconnect(shared, conn);
        }
    }
    if let Some(result) = write_result {
        let failed = result.is_err();
        deliver(shared, conn, IoEvent::Write(result));
        if failed {
            prepare_to_disconnect(shared, conn);
        }
    }
}

/// Exceptional socket: report no-response to whichever of connect/write was
/// waiting, then tear down.
fn process_exception(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    {
        let mut state = platform::lock(&shared.state);
        state.write_set.remove(conn.fd);
        state.except_set.remove(conn.fd);
    }

    let was_writing = {
        let mut state = platform::lock(&conn.state);
        if !state.open {
            return;
        }
        let old = state.wait;
        state.wait.remove(WaitFlags::CONNECTING | WaitFlags::WRITING);
        if old.contains(WaitFlags::WRITING) {
            state.cancel_timeout(IoOp::Write);
            state.pending_writes.pop_front();
            true
        } else {
            state.cancel_timeout(IoOp::Connect);
            false
        }
    };

    debug!("exception on socket {}", conn.fd);
    if was_writing {
        deliver(shared, conn, IoEvent::Write(Err(Error::NoResponse)));
    } else {
        deliver(shared, conn, IoEvent::Connect(Err(Error::NoResponse)));
    }
    prepare_to_disconnect(shared, conn);
}

/// Post-select pass: drain the pending-close queue, then walk timeouts if a
/// check interval has elapsed.
fn housekeeping(shared: &Arc<Shared>) {
    loop {
        let next = {
            let mut state = platform::lock(&shared.state);
            let next = state.pending_close.pop_front();
            if next.is_some() {
                // Counted under the lock, so a wait_for_all_closed that
                // observes the queue empty also observes the count.
                shared.counters.closed.fetch_add(1, Ordering::Relaxed);
            }
            next
        };
        match next {
            None => break,
            Some(conn) => disconnect_now(shared, &conn),
        }
    }
    {
        let state = platform::lock(&shared.state);
        if state.pending_close.is_empty() {
            shared.all_closed.notify_all();
        }
    }

    // Timeouts are not checked on every wake-up; once per interval is
    // enough and keeps busy periods cheap.
    let now = platform::ticks_ms();
    let elapsed = {
        let mut state = platform::lock(&shared.state);
        let elapsed = now.saturating_sub(state.last_timeout_check_ms);
        if elapsed < shared.config.timeout_check_ms {
            return;
        }
        state.last_timeout_check_ms = now;
        elapsed
    };

    let snapshot: Vec<Arc<Connection>> = {
        let state = platform::lock(&shared.state);
        state.conns.clone()
    };
    let mut fired: Vec<(Arc<Connection>, IoOp)> = Vec::new();
    for conn in snapshot {
        if fired.len() >= MAX_TIMEOUTS_PER_CHECK {
            break;
        }
        let timed_out = platform::lock(&conn.state).check_timeout(elapsed);
        if let Some(op) = timed_out {
            fired.push((conn, op));
        }
    }
    for (conn, op) in fired {
        report_timeout(shared, &conn, op);
    }
}

/// Deliver `NoResponse` for a timed-out operation and start teardown.
fn report_timeout(shared: &Arc<Shared>, conn: &Arc<Connection>, op: IoOp) {
    debug!("socket {} timed out on {:?}", conn.fd, op);
    shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
    match op {
        IoOp::Connect => {
            platform::lock(&conn.state).wait.remove(WaitFlags::CONNECTING);
            deliver(shared, conn, IoEvent::Connect(Err(Error::NoResponse)));
        }
        IoOp::Read => {
            let parked = {
                let mut state = platform::lock(&conn.state);
                state.wait.remove(WaitFlags::READING);
                state.pending_reads.pop_front()
            };
            match parked {
                Some(mut buffer) => {
                    buffer.set_error(Error::NoResponse);
                    deliver(shared, conn, IoEvent::Read(buffer));
                }
                None => deliver(shared, conn, IoEvent::PeerDisconnect(Error::NoResponse)),
            }
        }
        IoOp::Write => {
            {
                let mut state = platform::lock(&conn.state);
                state.wait.remove(WaitFlags::WRITING);
                state.pending_writes.pop_front();
            }
            deliver(shared, conn, IoEvent::Write(Err(Error::NoResponse)));
        }
    }
    prepare_to_disconnect(shared, conn);
}

/// Actually tear a connection down. Runs on the reactor thread only.
fn disconnect_now(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    debug!("disconnecting socket {}", conn.fd);
    {
        let mut state = platform::lock(&shared.state);
        state.read_set.remove(conn.fd);
        state.write_set.remove(conn.fd);
        state.except_set.remove(conn.fd);
        state.table.remove_value(&fd_key(conn.fd));
        state.conns.retain(|other| !Arc::ptr_eq(other, conn));
    }

    // Reads were discarded when the close was requested; unsent writes
    // surface as peer-disconnected completions.
    let unsent: Vec<IoBuffer> = {
        let mut state = platform::lock(&conn.state);
        state.open = false;
        state.pending_writes.drain(..).collect()
    };
    for mut buffer in unsent {
        buffer.set_error(Error::PeerDisconnected);
        deliver(shared, conn, IoEvent::Write(Err(Error::PeerDisconnected)));
    }

    platform::safe_close_socket(conn.fd, conn.is_udp());
}
