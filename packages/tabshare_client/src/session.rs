//! Session context for the relay client.
//!
//! The reconnection loop is the only writer of `state`; the join/leave
//! commands are the only writers of `group_id`. Everything else observes the
//! status through a `watch` channel.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Observable view of the client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Id assigned by the relay's `welcome` on the current connection.
    pub client_id: Option<String>,
    /// Group to (re-)join on every connect.
    pub group_id: Option<String>,
    pub member_count: Option<usize>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            client_id: None,
            group_id: None,
            member_count: None,
        }
    }
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Why a connection attempt was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppressed {
    InFlight,
    Cooldown(Duration),
}

/// Suppresses overlapping or too-frequent connection attempts.
#[derive(Debug)]
pub struct ReconnectGate {
    cooldown: Duration,
    last_attempt: Option<Instant>,
    in_flight: bool,
}

impl ReconnectGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_attempt: None,
            in_flight: false,
        }
    }

    /// Claim the right to start an attempt at `now`.
    pub fn try_begin(&mut self, now: Instant) -> Result<(), Suppressed> {
        if self.in_flight {
            return Err(Suppressed::InFlight);
        }
        if let Some(last) = self.last_attempt {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.cooldown {
                return Err(Suppressed::Cooldown(self.cooldown - elapsed));
            }
        }
        self.in_flight = true;
        self.last_attempt = Some(now);
        Ok(())
    }

    /// Mark the in-flight attempt as resolved (connected or failed).
    pub fn finish(&mut self) {
        self.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_allowed() {
        let mut gate = ReconnectGate::new(Duration::from_secs(2));
        assert_eq!(gate.try_begin(Instant::now()), Ok(()));
    }

    #[test]
    fn test_in_flight_attempt_suppresses() {
        let mut gate = ReconnectGate::new(Duration::ZERO);
        let now = Instant::now();
        gate.try_begin(now).unwrap();
        assert_eq!(gate.try_begin(now), Err(Suppressed::InFlight));
        gate.finish();
        assert_eq!(gate.try_begin(now), Ok(()));
    }

    #[test]
    fn test_cooldown_suppresses_rapid_attempts() {
        let mut gate = ReconnectGate::new(Duration::from_secs(2));
        let start = Instant::now();
        gate.try_begin(start).unwrap();
        gate.finish();

        let soon = start + Duration::from_millis(500);
        assert_eq!(
            gate.try_begin(soon),
            Err(Suppressed::Cooldown(Duration::from_millis(1500)))
        );
        assert_eq!(gate.try_begin(start + Duration::from_secs(2)), Ok(()));
    }

    #[test]
    fn test_default_status_is_disconnected() {
        let status = SessionStatus::default();
        assert!(!status.is_connected());
        assert!(status.group_id.is_none());
    }
}
