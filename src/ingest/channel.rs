//! The channel state machine (spec §4.7).

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Broken,
    Closed,
}

/// Offset-token discipline, owned solely by [`super::client::IngestClient`]
/// and mutated only by the single scheduler thread (spec §5).
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub continuation_token: Option<String>,
    pub next_offset: u64,
    pub opened_at: Instant,
    pub state: ChannelState,
    /// Consecutive 5xx/network failures on the current append attempt
    /// sequence; two in a row breaks the channel (spec §4.7).
    pub consecutive_server_errors: u32,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Channel {
            name: name.into(),
            continuation_token: None,
            next_offset: 1,
            opened_at: Instant::now(),
            state: ChannelState::Opening,
            consecutive_server_errors: 0,
        }
    }

    /// Called after a successful `:open` (initial or recovery). Adopts the
    /// fresh continuation token; `next_offset` is left untouched on
    /// recovery to preserve monotonicity (spec §4.7 `Broken -> Opening`).
    pub fn mark_opened(&mut self, continuation_token: String) {
        self.continuation_token = Some(continuation_token);
        self.state = ChannelState::Open;
        self.opened_at = Instant::now();
        self.consecutive_server_errors = 0;
    }

    pub fn mark_open_failed(&mut self) {
        self.state = ChannelState::Broken;
    }

    /// Record a successful append: advances `next_offset` by exactly 1 and
    /// adopts the server's new continuation token.
    pub fn record_success(&mut self, new_continuation_token: String) {
        self.continuation_token = Some(new_continuation_token);
        self.next_offset += 1;
        self.consecutive_server_errors = 0;
    }

    /// Record a transient server/network failure on the current append.
    /// Returns `true` if this breaks the channel (two consecutive).
    pub fn record_server_error(&mut self) -> bool {
        self.consecutive_server_errors += 1;
        if self.consecutive_server_errors >= 2 {
            self.state = ChannelState::Broken;
            true
        } else {
            false
        }
    }

    pub fn mark_broken(&mut self) {
        self.state = ChannelState::Broken;
    }

    pub fn begin_reopen(&mut self) {
        self.state = ChannelState::Opening;
    }

    pub fn mark_closed(&mut self) {
        self.state = ChannelState::Closed;
    }
}
