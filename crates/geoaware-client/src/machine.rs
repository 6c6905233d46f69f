//! Connection lifecycle state machine.
//!
//! Pure and synchronous: inputs come in as method calls, side effects go out
//! as [`Action`]s for the driver to execute. Every transport is tagged with a
//! generation; events from an older generation are ignored, which is what
//! makes teardown safe without waiting for the old transport to finish.

use chrono::{DateTime, Utc};
use std::time::Duration;

use geoaware_core::{ConnectionState, ConnectionTelemetry};

use crate::backoff::ReconnectBackoff;

/// Side effects requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    OpenTransport { generation: u64 },
    /// Close the current transport, if any
    CloseTransport,
    ArmTimer { delay: Duration },
    /// Cancel the reconnect timer, if armed
    CancelTimer,
    StartFallback { epoch: u64 },
    /// Abort the in-flight fallback request, if any
    AbortFallback,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: ReconnectBackoff,
    pub fallback_enabled: bool,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    policy: RetryPolicy,
    state: ConnectionState,
    retry_count: u32,
    last_error: Option<String>,
    using_fallback: bool,
    last_message_at: Option<DateTime<Utc>>,
    /// Set by `disconnect`, cleared by `reconnect`
    manual_stop: bool,
    /// Fallback already fired this session
    fallback_fired: bool,
    fallback_in_flight: bool,
    fallback_epoch: u64,
    generation: u64,
    timer_armed: bool,
}

impl ConnectionMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            retry_count: 0,
            last_error: None,
            using_fallback: false,
            last_message_at: None,
            manual_stop: false,
            fallback_fired: false,
            fallback_in_flight: false,
            fallback_epoch: 0,
            generation: 0,
            timer_armed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True if events tagged `generation` belong to the live transport.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    pub fn telemetry(&self) -> ConnectionTelemetry {
        ConnectionTelemetry {
            state: self.state,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            using_fallback: self.using_fallback,
            last_message_at: self.last_message_at,
        }
    }

    /// Open a new transport, tearing down any previous one. Ignored while a
    /// connect attempt is already in flight.
    pub fn connect(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Connecting {
            return Vec::new();
        }

        self.timer_armed = false;
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        vec![
            Action::CancelTimer,
            Action::CloseTransport,
            Action::OpenTransport {
                generation: self.generation,
            },
        ]
    }

    pub fn on_opened(&mut self, generation: u64) -> Vec<Action> {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            return Vec::new();
        }

        self.state = ConnectionState::Connected;
        self.retry_count = 0;
        self.last_error = None;
        self.using_fallback = false;
        self.fallback_fired = false;

        let mut actions = Vec::new();
        if self.fallback_in_flight {
            self.discard_fallback();
            actions.push(Action::AbortFallback);
        }
        actions
    }

    /// Whether a message from `generation` should be applied.
    pub fn accepts_message(&self, generation: u64) -> bool {
        self.is_current(generation) && self.state == ConnectionState::Connected
    }

    pub fn record_message(&mut self, at: DateTime<Utc>) {
        self.last_message_at = Some(at);
    }

    /// Stream closed or failed without a manual disconnect.
    pub fn on_closed(&mut self, generation: u64, error: Option<String>) -> Vec<Action> {
        if !self.is_current(generation) {
            return Vec::new();
        }

        self.state = ConnectionState::Disconnected;
        self.last_error = Some(error.unwrap_or_else(|| "connection closed".to_string()));
        let mut actions = vec![Action::CloseTransport];

        if self.manual_stop {
            return actions;
        }

        if self.retry_count < self.policy.max_retries {
            let delay = self.policy.backoff.delay_for(self.retry_count);
            self.retry_count += 1;
            self.timer_armed = true;
            actions.push(Action::ArmTimer { delay });
            return actions;
        }

        self.state = ConnectionState::Error;
        if self.policy.fallback_enabled && !self.fallback_fired && !self.fallback_in_flight {
            self.fallback_fired = true;
            self.fallback_in_flight = true;
            self.fallback_epoch += 1;
            actions.push(Action::StartFallback {
                epoch: self.fallback_epoch,
            });
        }
        actions
    }

    pub fn on_timer(&mut self) -> Vec<Action> {
        if !self.timer_armed {
            return Vec::new();
        }
        self.timer_armed = false;
        if self.manual_stop {
            return Vec::new();
        }
        self.connect()
    }

    /// Stop and stay stopped until `reconnect`.
    pub fn disconnect(&mut self) -> Vec<Action> {
        self.manual_stop = true;
        self.timer_armed = false;
        self.generation += 1;
        self.state = ConnectionState::Disconnected;

        let mut actions = vec![Action::CancelTimer, Action::CloseTransport];
        if self.fallback_in_flight {
            self.discard_fallback();
            actions.push(Action::AbortFallback);
        }
        actions
    }

    /// Start a fresh session: clears the manual stop, the retry counter and
    /// the fallback flag, then connects.
    pub fn reconnect(&mut self) -> Vec<Action> {
        self.manual_stop = false;
        self.retry_count = 0;
        self.fallback_fired = false;
        self.state = ConnectionState::Disconnected;

        let mut actions = vec![Action::CloseTransport];
        if self.fallback_in_flight {
            self.discard_fallback();
            actions.push(Action::AbortFallback);
        }
        actions.extend(self.connect());
        actions
    }

    /// The watched space changed; the live connection must not be reused.
    pub fn change_space(&mut self) -> Vec<Action> {
        self.using_fallback = false;
        self.last_message_at = None;
        self.reconnect()
    }

    /// Fallback request finished. Returns true when a successful result
    /// should be applied.
    pub fn on_fallback_finished(&mut self, epoch: u64, succeeded: bool) -> bool {
        if !self.fallback_in_flight || epoch != self.fallback_epoch {
            return false;
        }
        self.fallback_in_flight = false;

        if succeeded && self.state != ConnectionState::Connected {
            self.using_fallback = true;
            return true;
        }
        false
    }

    fn discard_fallback(&mut self) {
        self.fallback_in_flight = false;
        self.fallback_epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_retries: u32, fallback_enabled: bool) -> ConnectionMachine {
        ConnectionMachine::new(RetryPolicy {
            max_retries,
            backoff: ReconnectBackoff::new(Duration::from_millis(100), Duration::from_millis(1000)),
            fallback_enabled,
        })
    }

    fn opened_generation(actions: &[Action]) -> u64 {
        actions
            .iter()
            .find_map(|action| match action {
                Action::OpenTransport { generation } => Some(*generation),
                _ => None,
            })
            .expect("open transport action")
    }

    fn armed_delay(actions: &[Action]) -> Option<Duration> {
        actions.iter().find_map(|action| match action {
            Action::ArmTimer { delay } => Some(*delay),
            _ => None,
        })
    }

    fn fallback_epoch(actions: &[Action]) -> Option<u64> {
        actions.iter().find_map(|action| match action {
            Action::StartFallback { epoch } => Some(*epoch),
            _ => None,
        })
    }

    /// Fail `count` consecutive connect attempts, returning the actions of
    /// the last close.
    fn fail_attempts(machine: &mut ConnectionMachine, count: u32) -> Vec<Action> {
        let mut last = Vec::new();
        for _ in 0..count {
            let generation = machine.generation();
            last = machine.on_closed(generation, Some("refused".to_string()));
            if armed_delay(&last).is_some() {
                machine.on_timer();
            }
        }
        last
    }

    #[test]
    fn connect_opens_and_open_ack_connects() {
        let mut machine = machine(3, true);
        let actions = machine.connect();
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert!(actions.contains(&Action::CancelTimer));
        assert!(actions.contains(&Action::CloseTransport));

        let generation = opened_generation(&actions);
        assert!(machine.on_opened(generation).is_empty());
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(machine.accepts_message(generation));
    }

    #[test]
    fn connect_is_ignored_while_connecting() {
        let mut machine = machine(3, true);
        machine.connect();
        assert!(machine.connect().is_empty());
    }

    #[test]
    fn backoff_delays_follow_retry_count() {
        let mut machine = machine(5, false);
        machine.connect();

        let mut delays = Vec::new();
        for _ in 0..5 {
            let actions = machine.on_closed(machine.generation(), Some("refused".to_string()));
            assert_eq!(machine.state(), ConnectionState::Disconnected);
            delays.push(armed_delay(&actions).expect("timer armed"));
            let reconnect = machine.on_timer();
            assert!(!reconnect.is_empty());
            assert_eq!(machine.state(), ConnectionState::Connecting);
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1000),
            ]
        );
        assert_eq!(machine.retry_count(), 5);
    }

    #[test]
    fn successful_connect_resets_retry_count() {
        let mut machine = machine(5, true);
        machine.connect();
        fail_attempts(&mut machine, 3);
        assert_eq!(machine.retry_count(), 3);

        machine.on_opened(machine.generation());
        let telemetry = machine.telemetry();
        assert_eq!(telemetry.retry_count, 0);
        assert!(telemetry.last_error.is_none());

        // A later drop starts from the base delay again
        let actions = machine.on_closed(machine.generation(), None);
        assert_eq!(armed_delay(&actions), Some(Duration::from_millis(100)));
        assert_eq!(
            machine.telemetry().last_error.as_deref(),
            Some("connection closed")
        );
    }

    #[test]
    fn exhausted_retries_enter_error_and_fire_fallback_once() {
        let mut machine = machine(2, true);
        machine.connect();

        let last = fail_attempts(&mut machine, 3);
        assert_eq!(machine.state(), ConnectionState::Error);
        let epoch = fallback_epoch(&last).expect("fallback started");
        assert!(armed_delay(&last).is_none());

        // Connecting again without reconnect() fails straight back to Error,
        // and the fallback does not fire a second time this session.
        machine.connect();
        let again = machine.on_closed(machine.generation(), Some("refused".to_string()));
        assert_eq!(machine.state(), ConnectionState::Error);
        assert!(fallback_epoch(&again).is_none());

        assert!(machine.on_fallback_finished(epoch, true));
        let telemetry = machine.telemetry();
        assert!(telemetry.using_fallback);
        assert_eq!(telemetry.state, ConnectionState::Error);
        assert_eq!(telemetry.last_error.as_deref(), Some("refused"));
    }

    #[test]
    fn fallback_disabled_never_fires() {
        let mut machine = machine(1, false);
        machine.connect();
        let last = fail_attempts(&mut machine, 2);
        assert_eq!(machine.state(), ConnectionState::Error);
        assert!(fallback_epoch(&last).is_none());
    }

    #[test]
    fn live_connect_clears_fallback_flag_for_next_streak() {
        let mut machine = machine(1, true);
        machine.connect();
        let first = fail_attempts(&mut machine, 2);
        let epoch = fallback_epoch(&first).expect("first fallback");
        assert!(machine.on_fallback_finished(epoch, true));

        machine.connect();
        machine.on_opened(machine.generation());
        assert!(!machine.telemetry().using_fallback);

        let second = fail_attempts(&mut machine, 2);
        assert!(fallback_epoch(&second).is_some());
    }

    #[test]
    fn fallback_completing_after_live_connect_is_discarded() {
        let mut machine = machine(1, true);
        machine.connect();
        let last = fail_attempts(&mut machine, 2);
        let epoch = fallback_epoch(&last).expect("fallback started");

        machine.connect();
        let actions = machine.on_opened(machine.generation());
        assert_eq!(actions, vec![Action::AbortFallback]);
        assert!(!machine.on_fallback_finished(epoch, true));
        assert!(!machine.telemetry().using_fallback);
    }

    #[test]
    fn failed_fallback_keeps_error_state() {
        let mut machine = machine(0, true);
        machine.connect();
        let actions = machine.on_closed(machine.generation(), Some("dns failure".to_string()));
        let epoch = fallback_epoch(&actions).expect("fallback started");

        assert!(!machine.on_fallback_finished(epoch, false));
        let telemetry = machine.telemetry();
        assert_eq!(telemetry.state, ConnectionState::Error);
        assert!(!telemetry.using_fallback);
        assert_eq!(telemetry.last_error.as_deref(), Some("dns failure"));
    }

    #[test]
    fn disconnect_suppresses_auto_reconnect() {
        let mut machine = machine(3, true);
        machine.connect();
        let generation = machine.generation();
        machine.on_opened(generation);

        let actions = machine.disconnect();
        assert!(actions.contains(&Action::CancelTimer));
        assert!(actions.contains(&Action::CloseTransport));
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        // The old transport's close arrives late and is ignored
        assert!(machine.on_closed(generation, None).is_empty());
        assert!(machine.on_timer().is_empty());
        assert!(!machine.accepts_message(generation));
    }

    #[test]
    fn drop_after_disconnect_then_connect_does_not_retry() {
        let mut machine = machine(3, true);
        machine.disconnect();
        machine.connect();
        let actions = machine.on_closed(machine.generation(), Some("reset".to_string()));
        assert!(armed_delay(&actions).is_none());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnect_resets_session() {
        let mut machine = machine(1, true);
        machine.connect();
        let last = fail_attempts(&mut machine, 2);
        let epoch = fallback_epoch(&last).expect("fallback started");
        machine.disconnect();

        let actions = machine.reconnect();
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.retry_count(), 0);
        assert!(actions.contains(&Action::CloseTransport));
        assert!(matches!(actions.last(), Some(Action::OpenTransport { .. })));
        // Disconnect already discarded the in-flight fallback
        assert!(!machine.on_fallback_finished(epoch, true));

        // New failure streak may fire the fallback again
        let streak = fail_attempts(&mut machine, 2);
        assert!(fallback_epoch(&streak).is_some());
    }

    #[test]
    fn reconnect_while_connecting_restarts_attempt() {
        let mut machine = machine(3, true);
        machine.connect();
        let stale = machine.generation();
        let actions = machine.reconnect();
        let fresh = opened_generation(&actions);
        assert_ne!(stale, fresh);
        assert!(machine.on_opened(stale).is_empty());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn change_space_tears_down_live_connection() {
        let mut machine = machine(3, true);
        machine.connect();
        let old = machine.generation();
        machine.on_opened(old);
        machine.record_message(Utc::now());

        let actions = machine.change_space();
        assert!(actions.contains(&Action::CloseTransport));
        assert!(!machine.is_current(old));
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert!(machine.telemetry().last_message_at.is_none());
    }

    #[test]
    fn timer_cancellation_is_idempotent() {
        let mut machine = machine(3, true);
        machine.connect();
        machine.on_closed(machine.generation(), None);
        machine.disconnect();
        machine.disconnect();
        assert!(machine.on_timer().is_empty());
        assert!(machine.on_timer().is_empty());
    }
}
