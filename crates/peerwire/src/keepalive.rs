//! Idle-driven liveness probing.
//!
//! The connection task owns one [`KeepAlive`] and calls [`KeepAlive::on_idle`]
//! whenever nothing has been read for the idle timeout. PING and PONG never
//! reach subscribers.

use peerwire_common::DisconnectReason;

/// What the connection task must do after an idle period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Write a PING and keep waiting.
    SendPing,
    /// The previous PING went unanswered.
    Disconnect(DisconnectReason),
}

/// Two-state liveness prober for one connection.
#[derive(Debug, Default, Clone)]
pub struct KeepAlive {
    awaiting_pong: bool,
}

impl KeepAlive {
    /// Creates a prober that is not waiting for a PONG.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            awaiting_pong: false,
        }
    }

    /// Read-idle timer fired.
    pub fn on_idle(&mut self) -> KeepAliveAction {
        if self.awaiting_pong {
            KeepAliveAction::Disconnect(DisconnectReason::Timeout)
        } else {
            self.awaiting_pong = true;
            KeepAliveAction::SendPing
        }
    }

    /// PONG received.
    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
    }

    /// Whether a PING is outstanding.
    #[must_use]
    pub const fn awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }
}
