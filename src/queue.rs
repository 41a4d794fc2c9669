use crate::event::Event;
use crate::event_loop::Context;
use anyhow::Result;
use mio::Waker;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// Outcome of a single `EventController::wait` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// An event (or a bare wakeup) was observed.
    Success,
    /// The timeout elapsed with nothing to deliver.
    Timeout,
    /// The queue is being torn down.
    Cancel,
    /// The wait failed; the loop should exit.
    Error,
}

struct QueueInner {
    events: VecDeque<Event>,
    // Counting semaphore. A wakeup without an event still increments it so
    // that `wait` returns `Success` with no event.
    signals: u32,
    closed: bool,
}

/// Thread-safe FIFO of owned events.
///
/// Any thread may push; exactly one thread (the owner) consumes. A mio
/// `Waker` can be attached so that pushes also interrupt a socket poll.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    waker: Mutex<Option<Arc<Waker>>>,
}

impl EventQueue {
    pub fn new() -> Arc<EventQueue> {
        Arc::new(EventQueue {
            inner: Mutex::new(QueueInner {
                events: VecDeque::new(),
                signals: 0,
                closed: false,
            }),
            available: Condvar::new(),
            waker: Mutex::new(None),
        })
    }

    /// Appends an event and signals the consumer.
    ///
    /// Returns `false` (dropping nothing; the caller keeps the event out of
    /// the queue) once the queue has been closed for teardown.
    pub fn push(&self, event: Event) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            inner.events.push_back(event);
            inner.signals += 1;
        }
        self.available.notify_one();
        self.wake();
        true
    }

    /// Signals the consumer without enqueueing an event.
    pub fn wakeup(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.signals += 1;
        }
        self.available.notify_one();
        self.wake();
    }

    /// Blocks until a signal arrives or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> (WaitResult, Option<Event>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();

        while inner.signals == 0 && !inner.closed {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return (WaitResult::Timeout, None);
                    }
                    let (guard, result) = self
                        .available
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                    if result.timed_out() && inner.signals == 0 && !inner.closed {
                        return (WaitResult::Timeout, None);
                    }
                }
                None => {
                    inner = self.available.wait(inner).unwrap();
                }
            }
        }

        if inner.closed {
            return (WaitResult::Cancel, None);
        }

        inner.signals -= 1;
        (WaitResult::Success, inner.events.pop_front())
    }

    /// Non-blocking variant used by the socket controller after a poll.
    ///
    /// Returns whether a signal was consumed and the head event, if any.
    pub(crate) fn try_take(&self) -> (bool, Option<Event>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(event) = inner.events.pop_front() {
            inner.signals = inner.signals.saturating_sub(1);
            (true, Some(event))
        } else if inner.signals > 0 {
            inner.signals -= 1;
            (true, None)
        } else {
            (false, None)
        }
    }

    /// Number of unconsumed signals.
    pub fn pending(&self) -> u32 {
        self.inner.lock().unwrap().signals
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Rejects further pushes and releases any blocked waiter.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
        }
        self.available.notify_all();
        self.wake();
    }

    /// Destroys all queued events. Only safe during teardown.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.events.clear();
        inner.signals = 0;
    }

    pub(crate) fn set_waker(&self, waker: Arc<Waker>) {
        *self.waker.lock().unwrap() = Some(waker);
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().unwrap().as_ref() {
            // A failed wake leaves the poll to its timeout; nothing to do.
            let _ = waker.wake();
        }
    }
}

/// The event source an event loop blocks on.
///
/// The default implementation waits on the queue alone; the socket
/// controller overrides `wait` to interleave socket readiness.
pub trait EventController {
    fn queue(&self) -> &Arc<EventQueue>;

    fn wait(&self, timeout: Option<Duration>, ctx: &Context) -> (WaitResult, Option<Event>);

    fn wakeup(&self) {
        self.queue().wakeup();
    }

    fn on_init(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn on_exit(&self, _ctx: &Context) {}
}

/// Controller for threads without socket I/O.
pub struct DefaultController {
    queue: Arc<EventQueue>,
}

impl DefaultController {
    pub fn new(queue: Arc<EventQueue>) -> DefaultController {
        DefaultController { queue }
    }
}

impl EventController for DefaultController {
    fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    fn wait(&self, timeout: Option<Duration>, _ctx: &Context) -> (WaitResult, Option<Event>) {
        self.queue.wait(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_id;
    use std::thread;

    #[test]
    fn push_then_wait_preserves_order() {
        let queue = EventQueue::new();
        queue.push(Event::new(10));
        queue.push(Event::new(20));
        queue.push(Event::new(30));

        for expected in [10, 20, 30] {
            let (result, event) = queue.wait(Some(Duration::from_millis(10)));
            assert_eq!(result, WaitResult::Success);
            assert_eq!(event.unwrap().id(), expected);
        }
    }

    #[test]
    fn wakeup_without_event_returns_success_none() {
        let queue = EventQueue::new();
        queue.wakeup();

        let (result, event) = queue.wait(Some(Duration::from_millis(10)));
        assert_eq!(result, WaitResult::Success);
        assert!(event.is_none());
    }

    #[test]
    fn wait_times_out_when_idle() {
        let queue = EventQueue::new();
        let (result, event) = queue.wait(Some(Duration::from_millis(5)));
        assert_eq!(result, WaitResult::Timeout);
        assert!(event.is_none());
    }

    #[test]
    fn close_rejects_push_and_cancels_wait() {
        let queue = EventQueue::new();
        queue.close();
        assert!(!queue.push(Event::new(event_id::USER)));

        let (result, _) = queue.wait(Some(Duration::from_millis(5)));
        assert_eq!(result, WaitResult::Cancel);
    }

    #[test]
    fn cross_thread_push_wakes_waiter() {
        let queue = EventQueue::new();
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for id in 0..100 {
                    assert!(queue.push(Event::new(id)));
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 100 {
            let (result, event) = queue.wait(Some(Duration::from_secs(2)));
            assert_ne!(result, WaitResult::Error);
            if let Some(event) = event {
                seen.push(event.id());
            }
        }
        producer.join().unwrap();

        // FIFO per producer.
        let expected: Vec<u32> = (0..100).collect();
        assert_eq!(seen, expected);
    }
}
