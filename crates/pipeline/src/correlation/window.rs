//! Per-key rolling windows and the key state machine.

use chrono::{DateTime, Duration, Utc};
use sentinel_core::types::{EventType, RiskLevel, SecurityEvent};
use std::collections::VecDeque;
use uuid::Uuid;

/// The slice of an event the correlation rules need; windows hold thousands
/// of these so the full event is not retained.
#[derive(Debug, Clone)]
pub struct WindowEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub risk_level: RiskLevel,
    pub confidence: u8,
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub user: Option<String>,
    pub source_ip: Option<String>,
    pub process: Option<String>,
    pub mitre_techniques: Vec<String>,
}

impl From<&SecurityEvent> for WindowEvent {
    fn from(event: &SecurityEvent) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type,
            risk_level: event.risk_level,
            confidence: event.confidence,
            timestamp: event.timestamp,
            host: event.host.clone(),
            user: event.user.clone(),
            source_ip: event.source_ip.clone(),
            process: event.process.clone(),
            mitre_techniques: event.mitre_techniques.clone(),
        }
    }
}

/// Lifecycle of one correlation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Idle,
    Accumulating,
    Firing,
    CoolDown,
}

/// Rolling window for one (rule, key) pair.
#[derive(Debug)]
pub struct KeyWindow {
    pub events: VecDeque<WindowEvent>,
    pub state: KeyState,
    pub cooldown_until: Option<DateTime<Utc>>,
    max_events: usize,
}

impl KeyWindow {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            state: KeyState::Idle,
            cooldown_until: None,
            max_events: max_events.max(1),
        }
    }

    /// Add an event and expire the tail. The window is half-open: an event
    /// exactly `window` older than `now` is dropped.
    pub fn push(&mut self, event: WindowEvent, now: DateTime<Utc>, window: Duration) {
        self.events.push_back(event);
        if self.events.len() > self.max_events {
            self.events.pop_front();
        }
        self.expire(now, window);

        match self.state {
            KeyState::Idle => self.state = KeyState::Accumulating,
            KeyState::CoolDown => {
                if self.cooldown_elapsed(now) {
                    self.state = KeyState::Accumulating;
                    self.cooldown_until = None;
                }
            }
            _ => {}
        }
    }

    /// Drop events outside `(now - window, now]`.
    pub fn expire(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while let Some(front) = self.events.front() {
            if front.timestamp <= cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.is_empty() && self.state == KeyState::Accumulating {
            self.state = KeyState::Idle;
        }
        if self.events.is_empty() && self.state == KeyState::CoolDown {
            self.state = KeyState::Idle;
            self.cooldown_until = None;
        }
    }

    pub fn can_fire(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            KeyState::Accumulating => true,
            KeyState::CoolDown => self.cooldown_elapsed(now),
            _ => false,
        }
    }

    /// Transition after a correlation was emitted and persisted.
    pub fn fired(&mut self, now: DateTime<Utc>, cool_off: Duration) {
        self.state = KeyState::CoolDown;
        self.cooldown_until = Some(now + cool_off);
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| now >= until).unwrap_or(true)
    }

    pub fn snapshot(&self) -> Vec<WindowEvent> {
        self.events.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event_at(offset_secs: i64) -> WindowEvent {
        WindowEvent {
            id: Uuid::new_v4(),
            event_type: EventType::AuthenticationFailure,
            risk_level: RiskLevel::High,
            confidence: 85,
            timestamp: base() + Duration::seconds(offset_secs),
            host: "WIN-1".into(),
            user: Some("admin".into()),
            source_ip: None,
            process: None,
            mitre_techniques: vec![],
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
    }

    #[test]
    fn boundary_event_at_window_edge_is_excluded() {
        let mut window = KeyWindow::new(100);
        let span = Duration::seconds(60);

        window.push(event_at(0), base(), span);
        assert_eq!(window.events.len(), 1);

        // New event exactly at t + window: the first event expires.
        let now = base() + Duration::seconds(60);
        window.push(event_at(60), now, span);
        assert_eq!(window.events.len(), 1);
        assert_eq!(window.events[0].timestamp, now);
    }

    #[test]
    fn bounded_window_drops_oldest() {
        let mut window = KeyWindow::new(3);
        for i in 0..5 {
            window.push(event_at(i), base() + Duration::seconds(i), Duration::seconds(300));
        }
        assert_eq!(window.events.len(), 3);
        assert_eq!(window.events[0].timestamp, base() + Duration::seconds(2));
    }

    #[test]
    fn state_machine_walks_idle_accumulating_cooldown_idle() {
        let mut window = KeyWindow::new(10);
        let span = Duration::seconds(60);
        assert_eq!(window.state, KeyState::Idle);

        window.push(event_at(0), base(), span);
        assert_eq!(window.state, KeyState::Accumulating);

        window.fired(base(), Duration::seconds(60));
        assert_eq!(window.state, KeyState::CoolDown);
        assert!(!window.can_fire(base() + Duration::seconds(30)));
        assert!(window.can_fire(base() + Duration::seconds(61)));

        // Window drains entirely: back to idle.
        window.expire(base() + Duration::seconds(600), span);
        assert_eq!(window.state, KeyState::Idle);
    }
}
