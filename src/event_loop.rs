use crate::event::event_id;
use crate::event::Event;
use crate::event::EventId;
use crate::queue::DefaultController;
use crate::queue::EventController;
use crate::queue::EventQueue;
use crate::queue::WaitResult;
use crate::socket_controller::SocketController;
use crate::thread::ThreadHandle;
use crate::timer;
use crate::timer::Timer;
use crate::timer::TimerId;
use crate::timer::TimerManager;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

/// Event loop lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Init,
    Running,
    Waiting,
    Exit,
}

pub type EventHandler = Box<dyn FnMut(&Context, &mut Event)>;

/// A thunk posted across threads and run on the receiving event loop.
pub type Task = Box<dyn FnOnce(&Context) + Send>;

pub(crate) struct ContextInner {
    name: String,
    queue: Arc<EventQueue>,
    timers: Rc<RefCell<TimerManager>>,
    handlers: Rc<RefCell<HashMap<EventId, Rc<RefCell<EventHandler>>>>>,
    controller: Rc<dyn EventController>,
    sockets: Option<SocketController>,
    status: Rc<Cell<Status>>,
}

/// Capabilities of the current thread, passed to every handler.
///
/// Cloning is cheap; the clone refers to the same thread. A `Context` never
/// leaves its owning thread; use [`Context::thread_handle`] for a handle
/// that does.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    /// Enqueues an event on this thread's controller.
    pub fn post(&self, event: Event) -> bool {
        self.inner.queue.push(event)
    }

    pub fn post_id(&self, id: EventId) -> bool {
        self.post(Event::new(id))
    }

    /// Posts a thunk that runs on this thread's next loop iteration.
    pub fn post_task<F>(&self, task: F) -> bool
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let task: Task = Box::new(task);
        self.post(Event::with_param(event_id::TASK, task))
    }

    /// Registers the handler dispatched for `id`. Replaces any previous one.
    pub fn set_handler<F>(&self, id: EventId, handler: F)
    where
        F: FnMut(&Context, &mut Event) + 'static,
    {
        let handler: EventHandler = Box::new(handler);
        self.inner
            .handlers
            .borrow_mut()
            .insert(id, Rc::new(RefCell::new(handler)));
    }

    pub fn remove_handler(&self, id: EventId) {
        self.inner.handlers.borrow_mut().remove(&id);
    }

    /// Hands a timer to this thread's timer manager and starts it.
    pub fn start_timer(&self, timer: Timer) -> TimerId {
        self.inner.timers.borrow_mut().start(timer)
    }

    /// Cancels a timer. Once this returns the handler will not run again.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.timers.borrow_mut().cancel(id)
    }

    pub fn timer_running(&self, id: TimerId) -> bool {
        self.inner.timers.borrow().is_running(id)
    }

    /// Posts a stop event; the loop exits at its next iteration.
    pub fn stop(&self) {
        self.post_id(event_id::STOP);
        self.inner.controller.wakeup();
    }

    /// A cloneable, `Send` handle other threads can post through.
    pub fn thread_handle(&self) -> ThreadHandle {
        ThreadHandle::new(self.inner.name.clone(), self.inner.queue.clone())
    }

    /// The socket controller, when this thread hosts one.
    pub fn sockets(&self) -> Option<&SocketController> {
        self.inner.sockets.as_ref()
    }

    pub(crate) fn queue(&self) -> &Arc<EventQueue> {
        &self.inner.queue
    }

    pub(crate) fn timers(&self) -> &Rc<RefCell<TimerManager>> {
        &self.inner.timers
    }
}

/// A single-threaded event loop merging queued events, expiring timers and
/// socket readiness into one serialized dispatch stream.
pub struct EventLoop {
    ctx: Context,
}

impl EventLoop {
    /// Creates a loop with the default (queue-only) controller.
    pub fn new(name: &str) -> EventLoop {
        let queue = EventQueue::new();
        let controller: Rc<dyn EventController> = Rc::new(DefaultController::new(queue.clone()));
        let timers = Rc::new(RefCell::new(TimerManager::new()));
        EventLoop::from_parts(name, queue, controller, None, timers)
    }

    pub(crate) fn from_parts(
        name: &str,
        queue: Arc<EventQueue>,
        controller: Rc<dyn EventController>,
        sockets: Option<SocketController>,
        timers: Rc<RefCell<TimerManager>>,
    ) -> EventLoop {
        let ctx = Context {
            inner: Rc::new(ContextInner {
                name: name.to_owned(),
                queue,
                timers,
                handlers: Rc::new(RefCell::new(HashMap::new())),
                controller,
                sockets,
                status: Rc::new(Cell::new(Status::Init)),
            }),
        };
        EventLoop { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn status(&self) -> Status {
        self.ctx.status()
    }

    /// Runs until a stop event is dispatched or the controller cancels.
    pub fn run(&mut self) {
        let inner = &self.ctx.inner;
        inner.status.set(Status::Running);

        loop {
            let timeout = inner.timers.borrow().next_timeout(Instant::now());

            inner.status.set(Status::Waiting);
            let (result, event) = inner.controller.wait(timeout, &self.ctx);
            inner.status.set(Status::Running);

            timer::expire(&inner.timers, &self.ctx);

            match result {
                WaitResult::Success => {
                    if let Some(mut event) = event {
                        if event.id() == event_id::STOP {
                            break;
                        }
                        self.dispatch(&mut event);
                    }
                }
                WaitResult::Timeout => {}
                WaitResult::Cancel | WaitResult::Error => break,
            }
        }

        inner.status.set(Status::Exit);
    }

    pub fn stop(&self) {
        self.ctx.stop();
    }

    /// Looks up the handler for the event's id and invokes it; events
    /// without a handler are dropped.
    fn dispatch(&self, event: &mut Event) {
        if event.id() == event_id::TASK {
            if let Some(task) = event.take_param::<Task>() {
                task(&self.ctx);
            }
            return;
        }

        let handler = self
            .ctx
            .inner
            .handlers
            .borrow()
            .get(&event.id())
            .cloned();

        if let Some(handler) = handler {
            (handler.borrow_mut())(&self.ctx, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn stop_terminates_run() {
        let mut event_loop = EventLoop::new("test");
        event_loop.stop();
        event_loop.run();
        assert_eq!(event_loop.status(), Status::Exit);
    }

    #[test]
    fn events_dispatch_in_post_order() {
        let mut event_loop = EventLoop::new("test");
        let seen = Rc::new(RefCell::new(Vec::new()));

        let ctx = event_loop.context().clone();
        for id in [3_u32, 1, 2] {
            let seen = seen.clone();
            ctx.set_handler(id, move |_, event| {
                seen.borrow_mut().push(event.id());
            });
        }

        ctx.post_id(3);
        ctx.post_id(1);
        ctx.post_id(2);
        ctx.stop();
        event_loop.run();

        assert_eq!(*seen.borrow(), vec![3, 1, 2]);
    }

    #[test]
    fn tasks_run_on_the_loop() {
        let mut event_loop = EventLoop::new("test");
        let hits = Arc::new(std::sync::atomic::AtomicI32::new(0));

        let ctx = event_loop.context().clone();
        let hits2 = hits.clone();
        ctx.post_task(move |ctx| {
            hits2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ctx.stop();
        });
        event_loop.run();

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn timer_fires_and_repeats_until_cancelled() {
        let mut event_loop = EventLoop::new("test");
        let hits = Rc::new(Cell::new(0_u32));

        let ctx = event_loop.context().clone();
        let hits2 = hits.clone();
        let id = Rc::new(Cell::new(0));
        let id2 = id.clone();
        let timer = Timer::new(1, true, move |ctx| {
            hits2.set(hits2.get() + 1);
            if hits2.get() == 3 {
                ctx.cancel_timer(id2.get());
                ctx.stop();
            }
        });
        id.set(ctx.start_timer(timer));
        event_loop.run();

        assert_eq!(hits.get(), 3);
        assert!(!ctx.timer_running(id.get()));
    }

    #[test]
    fn events_without_handler_are_dropped() {
        let mut event_loop = EventLoop::new("test");
        let ctx = event_loop.context().clone();
        ctx.post_id(42);
        ctx.stop();
        event_loop.run();
        assert_eq!(event_loop.status(), Status::Exit);
    }
}
