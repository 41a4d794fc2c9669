use crate::event::event_id;
use crate::event::Event;
use crate::event::EventId;
use crate::event_loop::Context;
use crate::event_loop::EventLoop;
use crate::event_loop::Task;
use crate::queue::DefaultController;
use crate::queue::EventController;
use crate::queue::EventQueue;
use crate::selector::Selector;
use crate::socket_controller::SocketController;
use crate::timer::TimerManager;
use anyhow::Context as _;
use anyhow::Result;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use tracing::warn;

/// Parameter of a `CHILD_FINISHED` event.
pub struct ChildFinished {
    pub name: String,
}

/// A cloneable, `Send` handle for posting events to another thread.
#[derive(Clone)]
pub struct ThreadHandle {
    name: String,
    queue: Arc<EventQueue>,
}

impl ThreadHandle {
    pub(crate) fn new(name: String, queue: Arc<EventQueue>) -> ThreadHandle {
        ThreadHandle { name, queue }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues an event on the target thread. Returns `false` once the
    /// target is shutting down.
    pub fn post(&self, event: Event) -> bool {
        self.queue.push(event)
    }

    pub fn post_id(&self, id: EventId) -> bool {
        self.post(Event::new(id))
    }

    pub fn post_task<F>(&self, task: F) -> bool
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let task: Task = Box::new(task);
        self.post(Event::with_param(event_id::TASK, task))
    }

    /// Requests the target loop to exit after its current handler.
    pub fn stop(&self) {
        self.post_id(event_id::STOP);
    }

    /// Whether this handle points at the thread `ctx` runs on.
    pub fn is_local(&self, ctx: &Context) -> bool {
        Arc::ptr_eq(&self.queue, ctx.queue())
    }
}

/// One event loop plus its controller, hosted on the calling thread.
///
/// This is the common substrate behind `NetThread`, `Application` and the
/// synchronous HTTP driver.
pub(crate) struct Worker {
    event_loop: EventLoop,
    sockets: Option<SocketController>,
}

impl Worker {
    /// Builds a networking worker (socket controller attached).
    pub fn new_net(name: &str) -> Result<Worker> {
        let queue = EventQueue::new();
        Worker::new_net_with_queue(name, queue)
    }

    pub fn new_net_with_queue(name: &str, queue: Arc<EventQueue>) -> Result<Worker> {
        let selector = Selector::new().context("failed to create socket selector")?;
        queue.set_waker(selector.waker());

        let timers = Rc::new(RefCell::new(TimerManager::new()));
        let sockets = SocketController::new(queue.clone(), selector, timers.clone());
        let controller: Rc<dyn EventController> = Rc::new(sockets.clone());

        let event_loop =
            EventLoop::from_parts(name, queue, controller, Some(sockets.clone()), timers);
        Ok(Worker {
            event_loop,
            sockets: Some(sockets),
        })
    }

    /// Builds a plain worker (queue-only controller).
    pub fn new_plain(name: &str, queue: Arc<EventQueue>) -> Worker {
        let controller: Rc<dyn EventController> = Rc::new(DefaultController::new(queue.clone()));
        let timers = Rc::new(RefCell::new(TimerManager::new()));
        let event_loop = EventLoop::from_parts(name, queue, controller, None, timers);
        Worker {
            event_loop,
            sockets: None,
        }
    }

    pub fn context(&self) -> &Context {
        self.event_loop.context()
    }

    /// Runs the loop to completion, then tears the thread's resources down.
    pub fn run(&mut self) {
        self.event_loop.run();
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(sockets) = &self.sockets {
            sockets.close_all();
        }
        let ctx = self.event_loop.context();
        ctx.timers().borrow_mut().cancel_all();
        ctx.queue().close();
        ctx.queue().clear();
    }
}

/// An OS thread hosting one event loop with a socket controller.
///
/// The init closure runs first on the new thread; returning an error skips
/// the loop entirely. On exit the thread posts a `CHILD_FINISHED` event to
/// its parent, when one was recorded at spawn time.
pub struct NetThread {
    name: String,
    post: ThreadHandle,
    join: Option<JoinHandle<()>>,
}

impl NetThread {
    pub fn spawn<F>(name: &str, init: F) -> Result<NetThread>
    where
        F: FnOnce(&Context) -> Result<()> + Send + 'static,
    {
        NetThread::spawn_inner(name, None, init, true)
    }

    /// Spawns a child whose exit is reported to `parent` via
    /// `CHILD_FINISHED`.
    pub fn spawn_child<F>(name: &str, parent: &Context, init: F) -> Result<NetThread>
    where
        F: FnOnce(&Context) -> Result<()> + Send + 'static,
    {
        NetThread::spawn_inner(name, Some(parent.thread_handle()), init, true)
    }

    /// Spawns a thread without socket I/O (default controller).
    pub fn spawn_plain<F>(name: &str, init: F) -> Result<NetThread>
    where
        F: FnOnce(&Context) -> Result<()> + Send + 'static,
    {
        NetThread::spawn_inner(name, None, init, false)
    }

    fn spawn_inner<F>(
        name: &str,
        parent: Option<ThreadHandle>,
        init: F,
        net: bool,
    ) -> Result<NetThread>
    where
        F: FnOnce(&Context) -> Result<()> + Send + 'static,
    {
        let queue = EventQueue::new();
        let post = ThreadHandle::new(name.to_owned(), queue.clone());
        let thread_name = name.to_owned();

        let join = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let worker = if net {
                    match Worker::new_net_with_queue(&thread_name, queue) {
                        Ok(worker) => worker,
                        Err(err) => {
                            warn!(thread = %thread_name, error = %err, "worker setup failed");
                            return;
                        }
                    }
                } else {
                    Worker::new_plain(&thread_name, queue)
                };

                let mut worker = worker;
                match init(worker.context()) {
                    Ok(()) => worker.run(),
                    Err(err) => {
                        warn!(thread = %thread_name, error = %err, "thread init failed");
                    }
                }

                if let Some(parent) = parent {
                    parent.post(Event::with_param(
                        event_id::CHILD_FINISHED,
                        ChildFinished { name: thread_name },
                    ));
                }
            })
            .context("failed to spawn thread")?;

        Ok(NetThread {
            name: name.to_owned(),
            post,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ThreadHandle {
        self.post.clone()
    }

    pub fn post(&self, event: Event) -> bool {
        self.post.post(event)
    }

    pub fn post_task<F>(&self, task: F) -> bool
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.post.post_task(task)
    }

    /// Posts a stop event; the loop finishes its current handler first.
    pub fn stop(&self) {
        self.post.stop();
    }

    /// Waits for the thread to exit.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for NetThread {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.post.stop();
            let _ = join.join();
        }
    }
}

/// Hosts an event loop with socket I/O on the current (main) thread.
pub struct Application {
    worker: Worker,
}

impl Application {
    pub fn new(name: &str) -> Result<Application> {
        let worker = Worker::new_net(name)?;
        Ok(Application { worker })
    }

    pub fn context(&self) -> &Context {
        self.worker.context()
    }

    /// Runs until `stop` is posted. Consumes the thread until then.
    pub fn run(&mut self) {
        self.worker.run();
    }

    pub fn stop(&self) {
        self.worker.context().stop();
    }

    /// Handle other threads can use to post back to this application.
    pub fn handle(&self) -> ThreadHandle {
        self.worker.context().thread_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn posted_tasks_run_on_the_spawned_thread() {
        let (tx, rx) = mpsc::channel();
        let thread = NetThread::spawn("worker", |_| Ok(())).unwrap();

        thread.post_task(move |ctx| {
            tx.send(ctx.name().to_owned()).unwrap();
        });

        assert_eq!(rx.recv().unwrap(), "worker");
        thread.stop();
        thread.join();
    }

    #[test]
    fn child_exit_posts_child_finished_to_parent() {
        let (tx, rx) = mpsc::channel();

        let parent = NetThread::spawn("parent", move |ctx| {
            ctx.set_handler(event_id::CHILD_FINISHED, move |ctx, event| {
                let finished = event.take_param::<ChildFinished>().unwrap();
                tx.send(finished.name).unwrap();
                ctx.stop();
            });
            Ok(())
        })
        .unwrap();

        let (child_tx, child_rx) = mpsc::channel();
        parent.post_task(move |ctx| {
            let child = NetThread::spawn_child("child", ctx, |ctx| {
                ctx.stop();
                Ok(())
            })
            .unwrap();
            child_tx.send(child).unwrap();
        });

        let child = child_rx.recv().unwrap();
        assert_eq!(rx.recv().unwrap(), "child");
        child.join();
        parent.join();
    }

    #[test]
    fn events_cross_threads_in_posting_order() {
        let (tx, rx) = mpsc::channel();
        let thread = NetThread::spawn("sink", move |ctx| {
            let tx = tx.clone();
            ctx.set_handler(event_id::USER, move |_, event| {
                let value = event.take_param::<u64>().unwrap();
                tx.send(value).unwrap();
            });
            Ok(())
        })
        .unwrap();

        for value in 0..200_u64 {
            assert!(thread.post(Event::with_param(event_id::USER, value)));
        }

        let received: Vec<u64> = (0..200).map(|_| rx.recv().unwrap()).collect();
        let expected: Vec<u64> = (0..200).collect();
        assert_eq!(received, expected);

        thread.stop();
        thread.join();
    }
}
