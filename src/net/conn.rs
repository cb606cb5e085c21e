//! Per-socket connection state
//!
//! A connection owns one OS socket for its whole life. Queues and wait bits
//! live behind a per-connection lock that both the reactor thread and caller
//! threads take; the socket itself is only ever closed by the reactor
//! thread, after housekeeping has pulled the connection out of the fd sets.

use bitflags::bitflags;
use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::sync::Mutex;
use tracing::debug;

use super::buffer::{IoBuffer, IoOp};
use super::reactor::IoCallback;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct WaitFlags: u32 {
        /// Non-blocking connect in flight.
        const CONNECTING = 1 << 0;
        /// At least one read buffer is parked.
        const READING = 1 << 1;
        /// At least one write buffer is parked.
        const WRITING = 1 << 2;
        /// Teardown requested; the reactor thread will close the socket.
        const CLOSING = 1 << 3;
        /// This connection's timeouts never fire.
        const NEVER_TIMEOUT = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnKind {
    Tcp,
    Udp,
    Listener,
    Accepted,
}

/// Per-operation deadlines, fixed at connection creation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timeouts {
    pub connect_ms: u64,
    pub read_ms: u64,
    pub write_ms: u64,
}

pub(crate) struct ConnState {
    pub wait: WaitFlags,
    /// Cleared on the way to Closed; submissions fail synchronously after.
    pub open: bool,
    pub pending_reads: VecDeque<IoBuffer>,
    pub pending_writes: VecDeque<IoBuffer>,
    /// Destination for UDP sends.
    pub udp_dest: Option<SocketAddrV4>,
    /// Remaining time on the single outstanding timeout.
    timeout_remaining_ms: u64,
    timeout_op: IoOp,
    timeouts_armed: u32,
}

impl ConnState {
    fn new() -> ConnState {
        ConnState {
            wait: WaitFlags::empty(),
            open: true,
            pending_reads: VecDeque::new(),
            pending_writes: VecDeque::new(),
            udp_dest: None,
            timeout_remaining_ms: 0,
            timeout_op: IoOp::Connect,
            timeouts_armed: 0,
        }
    }

    /// Arm the connection's single timeout for `op`. A connection carries at
    /// most one outstanding timeout, so arming while armed is a no-op.
    pub fn start_timeout(&mut self, op: IoOp, timeouts: &Timeouts) {
        if self.timeouts_armed > 0 {
            return;
        }
        self.timeout_remaining_ms = match op {
            IoOp::Connect => timeouts.connect_ms,
            IoOp::Read => timeouts.read_ms,
            IoOp::Write => timeouts.write_ms,
        };
        self.timeout_op = op;
        self.timeouts_armed += 1;
    }

    /// Disarm after the operation completed normally.
    pub fn cancel_timeout(&mut self, op: IoOp) {
        if self.timeouts_armed > 0 && self.timeout_op == op {
            self.timeouts_armed -= 1;
        }
    }

    /// Tick the timeout down by `elapsed_ms`. Returns the timed-out
    /// operation when the deadline passed. Firing clears the armed count
    /// entirely so one operation cannot time out twice.
    pub fn check_timeout(&mut self, elapsed_ms: u64) -> Option<IoOp> {
        if self.wait.contains(WaitFlags::CLOSING) || self.timeouts_armed == 0 {
            return None;
        }
        if self.wait.contains(WaitFlags::NEVER_TIMEOUT) {
            return None;
        }
        if elapsed_ms >= self.timeout_remaining_ms {
            debug!("timeout fired for {:?}", self.timeout_op);
            self.timeouts_armed = 0;
            return Some(self.timeout_op);
        }
        self.timeout_remaining_ms -= elapsed_ms;
        None
    }
}

pub(crate) struct Connection {
    pub fd: RawFd,
    pub kind: ConnKind,
    /// Remote address for clients and accepted sockets.
    pub peer: Option<SocketAddrV4>,
    pub timeouts: Timeouts,
    pub callback: IoCallback,
    pub state: Mutex<ConnState>,
}

impl Connection {
    pub fn new(
        fd: RawFd,
        kind: ConnKind,
        peer: Option<SocketAddrV4>,
        timeouts: Timeouts,
        callback: IoCallback,
    ) -> Connection {
        Connection {
            fd,
            kind,
            peer,
            timeouts,
            callback,
            state: Mutex::new(ConnState::new()),
        }
    }

    pub fn is_udp(&self) -> bool {
        self.kind == ConnKind::Udp
    }

    pub fn is_listener(&self) -> bool {
        self.kind == ConnKind::Listener
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUTS: Timeouts = Timeouts { connect_ms: 1000, read_ms: 2000, write_ms: 1500 };

    #[test]
    fn test_timeout_arms_and_fires_once() {
        let mut state = ConnState::new();
        state.start_timeout(IoOp::Read, &TIMEOUTS);
        assert_eq!(state.check_timeout(500), None);
        assert_eq!(state.check_timeout(1500), Some(IoOp::Read));
        // Fired timeouts do not cascade.
        assert_eq!(state.check_timeout(10_000), None);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let mut state = ConnState::new();
        state.start_timeout(IoOp::Write, &TIMEOUTS);
        state.cancel_timeout(IoOp::Write);
        assert_eq!(state.check_timeout(100_000), None);
    }

    #[test]
    fn test_cancel_for_other_op_is_ignored() {
        let mut state = ConnState::new();
        state.start_timeout(IoOp::Connect, &TIMEOUTS);
        state.cancel_timeout(IoOp::Read);
        assert_eq!(state.check_timeout(2000), Some(IoOp::Connect));
    }

    #[test]
    fn test_never_timeout_bit() {
        let mut state = ConnState::new();
        state.wait.insert(WaitFlags::NEVER_TIMEOUT);
        state.start_timeout(IoOp::Read, &TIMEOUTS);
        assert_eq!(state.check_timeout(u64::MAX), None);
    }
}
