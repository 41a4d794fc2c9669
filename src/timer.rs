use crate::event_loop::Context;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;

/// Identifies a started timer. Ids are never reused within a thread.
pub type TimerId = u64;

pub type TimerHandler = Box<dyn FnMut(&Context)>;

/// A one-shot or repeating timer, built by the user and handed to the
/// owning thread with `Context::start_timer`.
pub struct Timer {
    interval: Duration,
    repeat: bool,
    handler: TimerHandler,
}

impl Timer {
    pub fn new<F>(interval_ms: u64, repeat: bool, handler: F) -> Timer
    where
        F: FnMut(&Context) + 'static,
    {
        Timer {
            interval: Duration::from_millis(interval_ms),
            repeat,
            handler: Box::new(handler),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat
    }
}

struct TimerState {
    interval: Duration,
    repeat: bool,
    handler: Option<TimerHandler>,
    running: bool,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    id: TimerId,
}

/// Ordered, cancellable timers keyed to the monotonic clock.
///
/// Equal deadlines expire in insertion order. Cancellation from inside an
/// expiration batch is honored: a timer cancelled by an earlier handler in
/// the same batch never fires.
pub struct TimerManager {
    next_id: TimerId,
    next_seq: u64,
    // Sorted by (deadline, seq).
    entries: Vec<Entry>,
    timers: HashMap<TimerId, TimerState>,
    just_cancelled: HashSet<TimerId>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            next_id: 1,
            next_seq: 0,
            entries: Vec::new(),
            timers: HashMap::new(),
            just_cancelled: HashSet::new(),
        }
    }

    /// Starts a timer; it fires `interval` from now.
    pub fn start(&mut self, timer: Timer) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        let deadline = Instant::now() + timer.interval;
        self.timers.insert(
            id,
            TimerState {
                interval: timer.interval,
                repeat: timer.repeat,
                handler: Some(timer.handler),
                running: true,
            },
        );
        self.insert_entry(deadline, id);
        id
    }

    /// Cancels a timer. Returns `true` if it was still pending.
    ///
    /// After this returns, the handler will not run again on the owning
    /// thread, even if its expiration was already captured by the current
    /// batch.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let existed = self.timers.remove(&id).is_some();
        if existed {
            self.entries.retain(|entry| entry.id != id);
            self.just_cancelled.insert(id);
        }
        existed
    }

    pub fn cancel_all(&mut self) {
        let ids: Vec<TimerId> = self.timers.keys().copied().collect();
        for id in ids {
            self.cancel(id);
        }
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.timers.get(&id).map(|t| t.running).unwrap_or(false)
    }

    /// Milliseconds until the earliest deadline, or `None` when no timer is
    /// pending. Clamped to the 32-bit millisecond horizon.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.entries.first().map(|entry| {
            let remaining = entry.deadline.saturating_duration_since(now);
            remaining.min(Duration::from_millis(u32::MAX as u64))
        })
    }

    /// Removes and returns every timer due at `now`, clearing the
    /// just-cancelled set first.
    fn begin_expire(&mut self, now: Instant) -> Vec<TimerId> {
        self.just_cancelled.clear();

        let mut due = Vec::new();
        while let Some(entry) = self.entries.first() {
            if entry.deadline > now {
                break;
            }
            due.push(self.entries.remove(0).id);
        }
        due
    }

    fn take_handler(&mut self, id: TimerId) -> Option<TimerHandler> {
        self.timers.get_mut(&id).and_then(|t| t.handler.take())
    }

    /// Reschedules a repeating timer or retires a one-shot after its
    /// handler ran.
    fn finish_fire(&mut self, id: TimerId, handler: TimerHandler, now: Instant) {
        // Cancelled (or cancelled-and-restarted) during its own handler.
        if self.just_cancelled.contains(&id) {
            return;
        }
        let Some(state) = self.timers.get_mut(&id) else {
            return;
        };
        state.handler = Some(handler);
        if state.repeat {
            let deadline = now + state.interval;
            self.insert_entry(deadline, id);
        } else {
            state.running = false;
            self.timers.remove(&id);
        }
    }

    fn insert_entry(&mut self, deadline: Instant, id: TimerId) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let at = self
            .entries
            .partition_point(|entry| (entry.deadline, entry.seq) <= (deadline, seq));
        self.entries.insert(at, Entry { deadline, seq, id });
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

/// Runs every handler due at this instant.
///
/// Handlers execute synchronously on the event loop thread and may
/// themselves start or cancel timers; cancellations inside the batch are
/// honored for timers that have not fired yet.
pub(crate) fn expire(manager: &Rc<RefCell<TimerManager>>, ctx: &Context) {
    let due = manager.borrow_mut().begin_expire(Instant::now());

    for id in due {
        let handler = {
            let mut mgr = manager.borrow_mut();
            if mgr.just_cancelled.contains(&id) {
                continue;
            }
            mgr.take_handler(id)
        };
        let Some(mut handler) = handler else { continue };

        handler(ctx);

        manager.borrow_mut().finish_fire(id, handler, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Timer {
        Timer::new(10, false, |_| {})
    }

    #[test]
    fn next_timeout_tracks_earliest_deadline() {
        let mut mgr = TimerManager::new();
        assert!(mgr.next_timeout(Instant::now()).is_none());

        mgr.start(Timer::new(500, false, |_| {}));
        mgr.start(Timer::new(20, false, |_| {}));

        let timeout = mgr.next_timeout(Instant::now()).unwrap();
        assert!(timeout <= Duration::from_millis(20));
    }

    #[test]
    fn due_timers_pop_in_deadline_then_insertion_order() {
        let mut mgr = TimerManager::new();
        let a = mgr.start(Timer::new(5, false, |_| {}));
        let b = mgr.start(Timer::new(5, false, |_| {}));
        let c = mgr.start(Timer::new(1, false, |_| {}));

        std::thread::sleep(Duration::from_millis(10));
        let due = mgr.begin_expire(Instant::now());
        assert_eq!(due, vec![c, a, b]);
    }

    #[test]
    fn cancel_removes_pending_entry() {
        let mut mgr = TimerManager::new();
        let id = mgr.start(noop());
        assert!(mgr.is_running(id));
        assert!(mgr.cancel(id));
        assert!(!mgr.is_running(id));
        assert_eq!(mgr.pending_count(), 0);
        assert!(!mgr.cancel(id));
    }

    #[test]
    fn cancel_inside_batch_suppresses_captured_expiration() {
        let mut mgr = TimerManager::new();
        let a = mgr.start(Timer::new(1, false, |_| {}));
        let b = mgr.start(Timer::new(1, false, |_| {}));

        std::thread::sleep(Duration::from_millis(5));
        let due = mgr.begin_expire(Instant::now());
        assert_eq!(due, vec![a, b]);

        // Simulates handler `a` cancelling `b` mid-batch.
        mgr.cancel(b);
        assert!(mgr.just_cancelled.contains(&b));
        assert!(mgr.take_handler(b).is_none());
    }

    #[test]
    fn repeating_timer_reschedules_after_fire() {
        let mut mgr = TimerManager::new();
        let id = mgr.start(Timer::new(1, true, |_| {}));

        std::thread::sleep(Duration::from_millis(5));
        let due = mgr.begin_expire(Instant::now());
        assert_eq!(due, vec![id]);

        let handler = mgr.take_handler(id).unwrap();
        mgr.finish_fire(id, handler, Instant::now());
        assert!(mgr.is_running(id));
        assert_eq!(mgr.pending_count(), 1);
    }

    #[test]
    fn one_shot_timer_retires_after_fire() {
        let mut mgr = TimerManager::new();
        let id = mgr.start(Timer::new(1, false, |_| {}));

        std::thread::sleep(Duration::from_millis(5));
        let due = mgr.begin_expire(Instant::now());
        assert_eq!(due, vec![id]);

        let handler = mgr.take_handler(id).unwrap();
        mgr.finish_fire(id, handler, Instant::now());
        assert!(!mgr.is_running(id));
        assert_eq!(mgr.pending_count(), 0);
    }
}
