//! Single-shot event queue
//!
//! Each state owns at most one protocol event (retransmit, replace or
//! expire) and at most one dead peer detection event. Scheduling a new event
//! into a slot replaces whatever was there; deleting a state cancels both
//! slots. Global events (NAT-T keepalive, pending Phase 2 sweep) carry no
//! serial and are deduplicated by kind.
//!
//! Nothing fires by itself: the owner asks for [`TimerQueue::next_deadline`]
//! and drains due events with [`TimerQueue::pop_due`].

use crate::state::SerialNo;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::trace;

/// Kind of timer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Resend the last message
    Retransmit,
    /// Start rekeying before the SA expires
    SaReplace,
    /// The SA is dead
    SaExpire,
    /// Dead peer detection: maybe probe
    DpdProbe,
    /// Dead peer detection: no answer in time
    DpdTimeout,
    /// Send NAT-T keepalives
    NatKeepalive,
    /// Look for stale Quick Mode requests
    PendingPhase2Check,
}

impl EventKind {
    fn slot(self) -> Slot {
        match self {
            EventKind::DpdProbe | EventKind::DpdTimeout => Slot::Dpd,
            EventKind::NatKeepalive | EventKind::PendingPhase2Check => Slot::Global(self),
            _ => Slot::Main,
        }
    }

    /// Name used in status output
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Retransmit => "EVENT_RETRANSMIT",
            EventKind::SaReplace => "EVENT_SA_REPLACE",
            EventKind::SaExpire => "EVENT_SA_EXPIRE",
            EventKind::DpdProbe => "EVENT_DPD",
            EventKind::DpdTimeout => "EVENT_DPD_TIMEOUT",
            EventKind::NatKeepalive => "EVENT_NAT_T_KEEPALIVE",
            EventKind::PendingPhase2Check => "EVENT_PENDING_PHASE2",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Main,
    Dpd,
    Global(EventKind),
}

/// A scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    /// When it is due
    pub when: Instant,
    /// What to do
    pub kind: EventKind,
    /// State it belongs to ([`SerialNo::NOBODY`] for global events)
    pub serial: SerialNo,
}

type Key = (Instant, u64);

/// Pending events ordered by due time
#[derive(Debug, Default)]
pub struct TimerQueue {
    queue: BTreeMap<Key, TimerEvent>,
    slots: HashMap<(SerialNo, Slot), Key>,
    seq: u64,
}

impl TimerQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scheduled events
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Nothing scheduled
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Schedule `kind` for `serial` after `delay`, replacing the event in
    /// the same slot
    pub fn schedule(&mut self, kind: EventKind, serial: SerialNo, delay: Duration, now: Instant) {
        let slot = kind.slot();
        if let Some(old) = self.slots.remove(&(serial, slot)) {
            self.queue.remove(&old);
        }
        self.seq += 1;
        let when = now + delay;
        let key = (when, self.seq);
        trace!(serial = %serial, event = %kind, delay_secs = delay.as_secs(), "event scheduled");
        self.queue.insert(key, TimerEvent { when, kind, serial });
        self.slots.insert((serial, slot), key);
    }

    /// Schedule a global event unless one of that kind is already pending
    ///
    /// Returns whether a new event was scheduled.
    pub fn schedule_global(&mut self, kind: EventKind, delay: Duration, now: Instant) -> bool {
        if self.slots.contains_key(&(SerialNo::NOBODY, kind.slot())) {
            return false;
        }
        self.schedule(kind, SerialNo::NOBODY, delay, now);
        true
    }

    /// The protocol event of a state, if any
    pub fn event_of(&self, serial: SerialNo) -> Option<TimerEvent> {
        self.get(serial, Slot::Main)
    }

    /// The dead peer detection event of a state, if any
    pub fn dpd_event_of(&self, serial: SerialNo) -> Option<TimerEvent> {
        self.get(serial, Slot::Dpd)
    }

    /// Is a global event of this kind pending
    pub fn has_global(&self, kind: EventKind) -> bool {
        self.slots.contains_key(&(SerialNo::NOBODY, kind.slot()))
    }

    fn get(&self, serial: SerialNo, slot: Slot) -> Option<TimerEvent> {
        self.slots
            .get(&(serial, slot))
            .and_then(|key| self.queue.get(key))
            .copied()
    }

    fn cancel_slot(&mut self, serial: SerialNo, slot: Slot) -> bool {
        match self.slots.remove(&(serial, slot)) {
            Some(key) => self.queue.remove(&key).is_some(),
            None => false,
        }
    }

    /// Cancel the protocol event of a state
    pub fn cancel(&mut self, serial: SerialNo) -> bool {
        self.cancel_slot(serial, Slot::Main)
    }

    /// Cancel the dead peer detection event of a state
    pub fn cancel_dpd(&mut self, serial: SerialNo) -> bool {
        self.cancel_slot(serial, Slot::Dpd)
    }

    /// Cancel everything a state has scheduled
    pub fn cancel_all(&mut self, serial: SerialNo) {
        self.cancel_slot(serial, Slot::Main);
        self.cancel_slot(serial, Slot::Dpd);
    }

    /// When the earliest event is due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(when, _)| *when)
    }

    /// Remove and return every event due at `now`, earliest first
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut due = Vec::new();
        while let Some((&key, _)) = self.queue.iter().next() {
            if key.0 > now {
                break;
            }
            if let Some(ev) = self.queue.remove(&key) {
                self.slots.remove(&(ev.serial, ev.kind.slot()));
                due.push(ev);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_fire_in_order() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(EventKind::SaReplace, SerialNo(1), Duration::from_secs(30), now);
        q.schedule(EventKind::Retransmit, SerialNo(2), Duration::from_secs(10), now);
        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(10)));

        assert!(q.pop_due(now + Duration::from_secs(5)).is_empty());
        let due = q.pop_due(now + Duration::from_secs(60));
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].kind, EventKind::Retransmit);
        assert_eq!(due[1].serial, SerialNo(1));
        assert!(q.is_empty());
    }

    #[test]
    fn test_rescheduling_replaces_slot() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(EventKind::Retransmit, SerialNo(1), Duration::from_secs(10), now);
        q.schedule(EventKind::SaReplace, SerialNo(1), Duration::from_secs(100), now);
        q.schedule(EventKind::DpdProbe, SerialNo(1), Duration::from_secs(30), now);
        assert_eq!(q.len(), 2);
        assert_eq!(q.event_of(SerialNo(1)).map(|e| e.kind), Some(EventKind::SaReplace));
        assert_eq!(q.dpd_event_of(SerialNo(1)).map(|e| e.kind), Some(EventKind::DpdProbe));
    }

    #[test]
    fn test_cancel_on_state_deletion() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(EventKind::Retransmit, SerialNo(3), Duration::from_secs(10), now);
        q.schedule(EventKind::DpdTimeout, SerialNo(3), Duration::from_secs(10), now);
        q.schedule(EventKind::Retransmit, SerialNo(4), Duration::from_secs(10), now);
        q.cancel_all(SerialNo(3));
        let due = q.pop_due(now + Duration::from_secs(10));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].serial, SerialNo(4));
        assert!(!q.cancel(SerialNo(3)));
    }

    #[test]
    fn test_global_events_deduplicated() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        assert!(q.schedule_global(EventKind::NatKeepalive, Duration::from_secs(20), now));
        assert!(!q.schedule_global(EventKind::NatKeepalive, Duration::from_secs(5), now));
        assert!(q.schedule_global(EventKind::PendingPhase2Check, Duration::from_secs(120), now));
        assert!(q.has_global(EventKind::NatKeepalive));
        let due = q.pop_due(now + Duration::from_secs(20));
        assert_eq!(due.len(), 1);
        assert!(!q.has_global(EventKind::NatKeepalive));
    }
}
