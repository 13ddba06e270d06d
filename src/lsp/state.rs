// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Connection lifecycle state and pool status types.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a single server connection.
///
/// `Created → Initializing → Ready → ShuttingDown → Closed`, with `Broken`
/// reachable from `Initializing` or `Ready` on an unrecoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Process spawned, handshake not started.
    Created,
    /// `initialize` sent, waiting for the response.
    Initializing,
    /// Handshake complete, accepting requests.
    Ready,
    /// `shutdown`/`exit` in progress.
    ShuttingDown,
    /// Process gone.
    Closed,
    /// Handshake failed or the server violated the protocol.
    Broken,
}

impl ConnectionState {
    /// Create from atomic u8 value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::ShuttingDown,
            4 => Self::Closed,
            _ => Self::Broken,
        }
    }

    /// Convert to atomic u8 value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Initializing => 1,
            Self::Ready => 2,
            Self::ShuttingDown => 3,
            Self::Closed => 4,
            Self::Broken => 5,
        }
    }

    /// Returns true once the connection can never serve requests again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Broken)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Closed => "closed",
            Self::Broken => "broken",
        };
        f.write_str(name)
    }
}

/// Atomic cell holding a [`ConnectionState`], shared with the read task.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Creates a cell in the given state.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Unconditionally moves to `next`.
    pub fn set(&self, next: ConnectionState) {
        self.0.store(next.as_u8(), Ordering::SeqCst);
    }

    /// Moves to `next` only if the current state is one of `from`.
    ///
    /// Returns the previous state on success.
    pub fn transition(
        &self,
        from: &[ConnectionState],
        next: ConnectionState,
    ) -> Option<ConnectionState> {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                from.contains(&ConnectionState::from_u8(current))
                    .then_some(next.as_u8())
            })
            .ok()
            .map(ConnectionState::from_u8)
    }
}

/// Snapshot of one pooled connection.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Descriptor id of the server.
    pub server_id: String,
    /// Workspace root the server was started for.
    pub root: PathBuf,
    /// Current lifecycle state, `None` while the server is still spawning.
    pub state: Option<ConnectionState>,
    /// Number of documents currently open on the server.
    pub open_documents: usize,
    /// Requests currently in flight through the pool.
    pub in_flight: usize,
    /// Seconds since the entry was last used.
    pub idle_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_roundtrip_covers_all_states() {
        for state in [
            ConnectionState::Created,
            ConnectionState::Initializing,
            ConnectionState::Ready,
            ConnectionState::ShuttingDown,
            ConnectionState::Closed,
            ConnectionState::Broken,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_transition_respects_source_states() {
        let cell = StateCell::new(ConnectionState::Created);
        assert!(
            cell.transition(&[ConnectionState::Ready], ConnectionState::ShuttingDown)
                .is_none()
        );
        assert_eq!(cell.get(), ConnectionState::Created);

        let prev = cell.transition(&[ConnectionState::Created], ConnectionState::Initializing);
        assert_eq!(prev, Some(ConnectionState::Created));
        assert_eq!(cell.get(), ConnectionState::Initializing);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Broken.is_terminal());
        assert!(!ConnectionState::Ready.is_terminal());
    }
}
