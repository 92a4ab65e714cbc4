//! A deadline-ordered queue of one-shot timers with lazy cancellation.
//!
//! Canceling a timer only forgets its id. The heap entry stays where it is
//! and is discarded when it reaches the top, either while looking for the
//! next deadline or while expiring due timers.
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::{Duration, Instant},
};

/// Identifies one armed timer. Ids are never reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TimerId(u64);

/// A min-heap of deadlines carrying a payload of type `T` per timer.
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    live: HashMap<TimerId, T>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    /// Arms a timer that becomes due `delay` after `now`.
    pub fn add(&mut self, now: Instant, delay: Duration, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse((now + delay, id)));
        self.live.insert(id, payload);
        id
    }

    /// Invalidates a timer. Canceling twice, or canceling a fired timer, is
    /// a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        self.live.remove(&id);
    }

    /// Whether the timer is still armed.
    pub fn is_live(&self, id: TimerId) -> bool {
        self.live.contains_key(&id)
    }

    /// The earliest deadline among live timers.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek() {
            if self.live.contains_key(id) {
                return Some(*deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// How long a poll may block before the next live timer is due.
    pub fn timeout(&mut self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Pops every live timer due at `now`, in non-decreasing deadline order.
    ///
    /// The timers stay live until [`take`](Self::take)n, so a handler run
    /// for an earlier timer may still cancel a later one.
    pub fn expire(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            let id = *id;
            self.heap.pop();
            if self.live.contains_key(&id) {
                due.push(id);
            }
        }
        due
    }

    /// Disarms an expired timer and hands back its payload, or `None` if it
    /// was canceled in the meantime.
    pub fn take(&mut self, id: TimerId) -> Option<T> {
        self.live.remove(&id)
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no timer is armed.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_expire_in_deadline_order() {
        let start = Instant::now();
        let mut timers = TimerQueue::default();
        let c = timers.add(start, Duration::from_millis(30), 'c');
        let a = timers.add(start, Duration::from_millis(10), 'a');
        let b = timers.add(start, Duration::from_millis(20), 'b');
        let late = timers.add(start, Duration::from_millis(500), 'z');

        let due = timers.expire(start + Duration::from_millis(100));
        assert_eq!(due, vec![a, b, c]);
        let payloads: Vec<char> = due.into_iter().filter_map(|id| timers.take(id)).collect();
        assert_eq!(payloads, vec!['a', 'b', 'c']);
        assert!(timers.is_live(late));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_canceled_timer_never_fires() {
        let start = Instant::now();
        let mut timers = TimerQueue::default();
        let t = Duration::from_millis(100);
        let id = timers.add(start, t, ());

        // Canceled at T/2, polled well after T.
        assert!(timers.expire(start + t / 2).is_empty());
        timers.cancel(id);
        assert!(timers.expire(start + t * 3).is_empty());
        assert!(timers.take(id).is_none());
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn test_cancel_between_expire_and_take() {
        let start = Instant::now();
        let mut timers = TimerQueue::default();
        let first = timers.add(start, Duration::from_millis(1), 1);
        let second = timers.add(start, Duration::from_millis(2), 2);

        let due = timers.expire(start + Duration::from_millis(5));
        assert_eq!(due, vec![first, second]);
        assert_eq!(timers.take(first), Some(1));
        // The handler of the first timer cancels the second one.
        timers.cancel(second);
        assert_eq!(timers.take(second), None);
    }

    #[test]
    fn test_next_deadline_skips_dead_entries() {
        let start = Instant::now();
        let mut timers = TimerQueue::default();
        let early = timers.add(start, Duration::from_millis(5), ());
        timers.add(start, Duration::from_millis(50), ());
        timers.cancel(early);
        assert_eq!(
            timers.next_deadline(),
            Some(start + Duration::from_millis(50))
        );
        assert_eq!(
            timers.timeout(start + Duration::from_millis(80)),
            Some(Duration::ZERO)
        );
    }
}
