use std::time::Duration;

use rand::Rng;

/// Backoff parameters for re-establishing a dropped gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before `attempt` (1-based): base doubled per prior
    /// attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
        Duration::from_millis(base_ms.saturating_mul(pow).min(max_ms))
    }

    /// `delay_for` with ±10% jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.delay_for(attempt).as_millis() as u64;
        let jitter_window = (delay_ms / 10).max(1);
        let mut rng = rand::rng();
        let jitter_offset = rng.random_range(0..=(jitter_window * 2));
        Duration::from_millis(
            delay_ms
                .saturating_sub(jitter_window)
                .saturating_add(jitter_offset),
        )
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local user asked to close. Never reconnects.
    ClientClosed,
    /// The server or network dropped an established connection.
    Abnormal,
    /// The connection could not be established at all.
    ConnectError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting { attempt: u32 },
    /// Transport is up; `Join` sent but not yet acknowledged.
    AwaitingJoin,
    Joined,
    Backoff { attempt: u32, delay: Duration },
    Closed,
    /// Retry budget exhausted.
    Failed,
}

/// What the driver should do after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    RetryAfter(Duration),
    Stop,
    GiveUp,
}

/// Client-side connection lifecycle. Every reconnect is a fresh connection
/// that must join again; join state never carries over.
#[derive(Debug)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ConnectionState,
    /// Consecutive failed attempts since the last successful join
    attempts: u32,
    jitter: bool,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            attempts: 0,
            jitter: true,
        }
    }

    /// Disable jitter so delays are exact.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting {
            attempt: self.attempts + 1,
        };
    }

    pub fn on_connected(&mut self) {
        self.state = ConnectionState::AwaitingJoin;
    }

    /// The server acknowledged `Join`. Resets the retry budget.
    pub fn on_joined(&mut self) {
        self.attempts = 0;
        self.state = ConnectionState::Joined;
    }

    pub fn on_disconnect(&mut self, reason: DisconnectReason) -> ReconnectAction {
        if matches!(self.state, ConnectionState::Closed | ConnectionState::Failed) {
            return ReconnectAction::Stop;
        }

        if reason == DisconnectReason::ClientClosed {
            self.state = ConnectionState::Closed;
            return ReconnectAction::Stop;
        }

        if self.attempts >= self.policy.max_attempts {
            self.state = ConnectionState::Failed;
            return ReconnectAction::GiveUp;
        }

        self.attempts += 1;
        let delay = if self.jitter {
            self.policy.jittered_delay(self.attempts)
        } else {
            self.policy.delay_for(self.attempts)
        };
        self.state = ConnectionState::Backoff {
            attempt: self.attempts,
            delay,
        };
        ReconnectAction::RetryAfter(delay)
    }

    /// Local close while connected or backing off.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}
