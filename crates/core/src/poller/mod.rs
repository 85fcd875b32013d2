//! Single-threaded event loops and the pool that hands them out.
//!
//! Every [`EventPoller`] owns one OS thread running a `mio::Poll`. The
//! thread is the only place where readiness callbacks, delayed tasks and
//! queued tasks execute, so state touched only from those callbacks needs no
//! locking. Other threads interact with a poller through three entry points:
//!
//! - [`add_event`](EventPoller::add_event) / [`modify_event`](EventPoller::modify_event) /
//!   [`del_event`](EventPoller::del_event): readiness registration (thread-safe,
//!   backed by a shared `mio::Registry`).
//! - [`do_delay_task`](EventPoller::do_delay_task): one-shot or repeating timers.
//! - [`run_async`](EventPoller::run_async): run a closure on the loop thread.
//!
//! Readiness is edge-triggered: a callback must drain its descriptor until
//! `WouldBlock` or it will not be woken again.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

const WAKE_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;

/// Readiness reported to an event callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    /// Either direction was closed by the peer.
    pub closed: bool,
}

impl From<&mio::event::Event> for Ready {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            closed: event.is_read_closed() || event.is_write_closed(),
        }
    }
}

pub type EventCallback = Box<dyn FnMut(Ready) + Send>;
pub type Task = Box<dyn FnOnce() + Send>;

/// Timer body. The return value is the delay in milliseconds until the next
/// run; `0` stops the timer.
pub type DelayCallback = Box<dyn FnMut() -> u64 + Send>;

struct Registration {
    fd: RawFd,
    callback: Arc<Mutex<EventCallback>>,
}

struct DelayTaskInner {
    cancelled: AtomicBool,
    task: Mutex<DelayCallback>,
}

/// Handle to a scheduled delayed task.
///
/// Dropping the handle does not cancel the task; call [`cancel`](Self::cancel).
#[derive(Clone)]
pub struct DelayTask {
    inner: Arc<DelayTaskInner>,
}

impl DelayTask {
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DelayTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayTask")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A single-threaded event loop.
pub struct EventPoller {
    name: String,
    registry: Registry,
    waker: Waker,
    next_token: AtomicUsize,
    events: Mutex<HashMap<Token, Registration>>,
    tasks: Mutex<VecDeque<Task>>,
    timers: Mutex<BTreeMap<(Instant, u64), Arc<DelayTaskInner>>>,
    next_timer: AtomicU64,
    thread_id: OnceLock<ThreadId>,
    exit: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventPoller {
    /// Create a poller and start its loop thread.
    pub fn spawn(name: &str) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let poller = Arc::new(Self {
            name: name.to_string(),
            registry,
            waker,
            next_token: AtomicUsize::new(1),
            events: Mutex::new(HashMap::new()),
            tasks: Mutex::new(VecDeque::new()),
            timers: Mutex::new(BTreeMap::new()),
            next_timer: AtomicU64::new(0),
            thread_id: OnceLock::new(),
            exit: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let runner = poller.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runner.run_loop(poll))?;
        let _ = poller.thread_id.set(handle.thread().id());
        *poller.thread.lock() = Some(handle);

        tracing::debug!(poller = %poller.name, "event poller started");
        Ok(poller)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is this poller's loop thread.
    pub fn is_current_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    pub fn is_shutdown(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Register `fd` for readiness. The returned token identifies this
    /// registration in [`modify_event`](Self::modify_event) and
    /// [`del_event`](Self::del_event).
    pub fn add_event(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: EventCallback,
    ) -> io::Result<Token> {
        if self.is_shutdown() {
            return Err(io::Error::other("event poller is shut down"));
        }
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.events.lock().insert(
            token,
            Registration {
                fd,
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        if let Err(err) = self
            .registry
            .register(&mut SourceFd(&fd), token, interest)
        {
            self.events.lock().remove(&token);
            return Err(err);
        }
        tracing::trace!(poller = %self.name, fd, token = token.0, "event added");
        Ok(token)
    }

    /// Change the interest set of an existing registration.
    pub fn modify_event(&self, token: Token, interest: Interest) -> io::Result<()> {
        let fd = self
            .events
            .lock()
            .get(&token)
            .map(|reg| reg.fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.registry
            .reregister(&mut SourceFd(&fd), token, interest)
    }

    /// Remove a registration. Events already collected for it in the current
    /// loop iteration are discarded.
    pub fn del_event(&self, token: Token) -> io::Result<()> {
        let removed = self.events.lock().remove(&token);
        match removed {
            Some(reg) => {
                tracing::trace!(poller = %self.name, fd = reg.fd, token = token.0, "event removed");
                self.registry.deregister(&mut SourceFd(&reg.fd))
            }
            None => Ok(()),
        }
    }

    /// Run `task` on the loop thread. With `may_sync`, a caller already on the
    /// loop thread runs it inline.
    pub fn run_async<F>(&self, task: F, may_sync: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        if may_sync && self.is_current_thread() {
            task();
            return;
        }
        if self.is_shutdown() {
            return;
        }
        self.tasks.lock().push_back(Box::new(task));
        self.wake();
    }

    /// Schedule `task` after `delay_ms`. The task reschedules itself for as
    /// long as it returns a non-zero delay.
    pub fn do_delay_task<F>(&self, delay_ms: u64, task: F) -> DelayTask
    where
        F: FnMut() -> u64 + Send + 'static,
    {
        let inner = Arc::new(DelayTaskInner {
            cancelled: AtomicBool::new(false),
            task: Mutex::new(Box::new(task)),
        });
        self.schedule(delay_ms, inner.clone());
        if !self.is_current_thread() {
            self.wake();
        }
        DelayTask { inner }
    }

    /// Stop the loop thread and drop every registration, task and timer.
    ///
    /// Joins the thread unless called from it.
    pub fn shutdown(&self) {
        if self.exit.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wake();
        if self.is_current_thread() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::warn!(poller = %self.name, "poller thread panicked");
            }
        }
        tracing::debug!(poller = %self.name, "event poller stopped");
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            tracing::warn!(poller = %self.name, error = %err, "failed to wake poller");
        }
    }

    fn schedule(&self, delay_ms: u64, inner: Arc<DelayTaskInner>) {
        let id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_millis(delay_ms);
        self.timers.lock().insert((deadline, id), inner);
    }

    fn run_loop(self: Arc<Self>, mut poll: Poll) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        while !self.is_shutdown() {
            let timeout = self.flush_delay_tasks();
            if let Err(err) = poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(poller = %self.name, error = %err, "poll failed");
                break;
            }
            for event in events.iter() {
                if event.token() != WAKE_TOKEN {
                    self.dispatch(event.token(), Ready::from(event));
                }
            }
            self.run_tasks();
        }

        // Callbacks hold references back to sockets; drop them here so the
        // sockets they keep alive can be released.
        self.exit.store(true, Ordering::Release);
        let registrations: Vec<_> = self.events.lock().drain().collect();
        for (_, reg) in &registrations {
            let _ = self.registry.deregister(&mut SourceFd(&reg.fd));
        }
        drop(registrations);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        drop(tasks);
        let timers = std::mem::take(&mut *self.timers.lock());
        drop(timers);
    }

    fn dispatch(&self, token: Token, ready: Ready) {
        let callback = self.events.lock().get(&token).map(|reg| reg.callback.clone());
        if let Some(callback) = callback {
            (callback.lock())(ready);
        }
    }

    fn run_tasks(&self) {
        loop {
            let batch = std::mem::take(&mut *self.tasks.lock());
            if batch.is_empty() {
                return;
            }
            for task in batch {
                task();
            }
        }
    }

    /// Run every expired timer, returning the wait until the next one.
    fn flush_delay_tasks(&self) -> Option<Duration> {
        loop {
            let now = Instant::now();
            let expired = {
                let mut timers = self.timers.lock();
                let next_deadline = timers.first_key_value().map(|(&(deadline, _), _)| deadline);
                match next_deadline {
                    Some(deadline) if deadline <= now => timers.pop_first(),
                    Some(deadline) => return Some(deadline - now),
                    None => return None,
                }
            };
            let Some((_, inner)) = expired else {
                return None;
            };
            if inner.cancelled.load(Ordering::Acquire) {
                continue;
            }
            let next = (inner.task.lock())();
            if next > 0 && !inner.cancelled.load(Ordering::Acquire) {
                self.schedule(next, inner);
            }
        }
    }
}

impl std::fmt::Debug for EventPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPoller").field("name", &self.name).finish()
    }
}

/// A fixed set of pollers handed out round-robin.
pub struct EventPollerPool {
    pollers: Vec<Arc<EventPoller>>,
    next: AtomicUsize,
}

impl EventPollerPool {
    /// Start `size` pollers (at least one).
    pub fn new(size: usize) -> io::Result<Self> {
        let pollers = (0..size.max(1))
            .map(|i| EventPoller::spawn(&format!("event-poller-{i}")))
            .collect::<io::Result<Vec<_>>>()?;
        tracing::info!(size = pollers.len(), "event poller pool started");
        Ok(Self {
            pollers,
            next: AtomicUsize::new(0),
        })
    }

    /// The calling thread's own poller if it is one of ours, otherwise the
    /// next poller in round-robin order.
    pub fn get_poller(&self) -> Arc<EventPoller> {
        if let Some(current) = self.pollers.iter().find(|p| p.is_current_thread()) {
            return current.clone();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pollers.len();
        self.pollers[index].clone()
    }

    pub fn get_first_poller(&self) -> Arc<EventPoller> {
        self.pollers[0].clone()
    }

    pub fn pollers(&self) -> &[Arc<EventPoller>] {
        &self.pollers
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }
}

impl Drop for EventPollerPool {
    fn drop(&mut self) {
        for poller in &self.pollers {
            poller.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn run_async_executes_on_loop_thread() {
        let poller = EventPoller::spawn("test-poller").unwrap();
        let (tx, rx) = mpsc::channel();
        let p = poller.clone();
        poller.run_async(
            move || {
                tx.send(p.is_current_thread()).unwrap();
            },
            true,
        );
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        assert!(!poller.is_current_thread());
        poller.shutdown();
    }

    #[test]
    fn delay_task_repeats_until_zero() {
        let poller = EventPoller::spawn("test-poller").unwrap();
        let (tx, rx) = mpsc::channel();
        let mut runs = 0;
        poller.do_delay_task(5, move || {
            runs += 1;
            tx.send(runs).unwrap();
            if runs < 3 { 5 } else { 0 }
        });
        let seen: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        poller.shutdown();
    }

    #[test]
    fn cancelled_delay_task_never_runs() {
        let poller = EventPoller::spawn("test-poller").unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let task = poller.do_delay_task(30, move || {
            let _ = tx.send(());
            0
        });
        task.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        poller.shutdown();
    }

    #[test]
    fn pool_round_robin() {
        let pool = EventPollerPool::new(2).unwrap();
        let a = pool.get_poller();
        let b = pool.get_poller();
        let c = pool.get_poller();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn pool_prefers_current_thread() {
        let pool = Arc::new(EventPollerPool::new(3).unwrap());
        let target = pool.pollers()[2].clone();
        let (tx, rx) = mpsc::channel();
        let inner_pool = pool.clone();
        let expected = target.clone();
        target.run_async(
            move || {
                tx.send(Arc::ptr_eq(&inner_pool.get_poller(), &expected)).unwrap();
            },
            false,
        );
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
}
