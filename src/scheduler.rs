//! Discrete-event scheduler driving cooperative simulation processes.
//!
//! A process is an `async` body registered with [`Env::process`]. It runs until
//! it awaits one of the wait primitives ([`Env::timeout`], [`Env::join`],
//! [`Store::get`]) and is resumed by the scheduler when that wait completes, or
//! earlier when another process interrupts it with [`Env::interrupt`]. Every wait
//! resolves to `Err(Interrupt { cause })` in the latter case and the pending
//! wait is cancelled.
//!
//! Ordering:
//! - timed events fire by time, equal times in the order they were scheduled;
//! - process starts and interruptions raised while a process runs are handled
//!   before the next timed event, in the order they were raised.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;

/// Virtual time in microseconds.
pub type Time = f64;

pub type ProcessId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Timeout,
    Joined,
    Delivered,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Timeout => write!(f, "Timeout"),
            EventType::Joined => write!(f, "Joined"),
            EventType::Delivered => write!(f, "Delivered"),
        }
    }
}

#[derive(Debug)]
pub struct Event {
    event_type: EventType,
    process: ProcessId,
    token: u64,
    time: Time,
}

impl Event {
    fn new(event_type: EventType, process: ProcessId, token: u64, time: Time) -> Event {
        Event {
            event_type,
            process,
            token,
            time,
        }
    }
}

/// Raised inside a suspended process by [`Env::interrupt`].
#[derive(Debug, Clone, PartialEq)]
pub struct Interrupt<C> {
    pub cause: C,
}

enum Wake<C> {
    Fired,
    Interrupted(C),
}

enum Urgent<C> {
    Start(ProcessId),
    Interrupt(ProcessId, C),
}

struct ProcessSlot<C> {
    // Bumped on every interruption; waits registered under an older token are stale.
    token: u64,
    finished: bool,
    wake: Option<Wake<C>>,
    joiners: Vec<(ProcessId, u64)>,
}

struct Kernel<C> {
    now: Time,
    event_list: Vec<Event>,
    urgent: VecDeque<Urgent<C>>,
    processes: Vec<ProcessSlot<C>>,
    spawned: Vec<(ProcessId, LocalBoxFuture<'static, ()>)>,
    current: Option<ProcessId>,
}

impl<C> Kernel<C> {
    fn add_event(&mut self, event_type: EventType, process: ProcessId, token: u64, delay: Time) {
        let time = self.now + delay;
        self.event_list.push(Event::new(event_type, process, token, time));
    }

    fn is_waiting(&self, process: ProcessId, token: u64) -> bool {
        let slot = &self.processes[process];
        !slot.finished && slot.token == token
    }

    fn arm(&self) -> (ProcessId, u64) {
        let process = self
            .current
            .expect("wait primitive awaited outside of a simulation process");
        (process, self.processes[process].token)
    }

    fn take_wake(&mut self) -> Option<Wake<C>> {
        let process = self.current?;
        self.processes[process].wake.take()
    }

    fn finish(&mut self, process: ProcessId) {
        let slot = &mut self.processes[process];
        slot.finished = true;
        let joiners = std::mem::take(&mut slot.joiners);
        for (joiner, token) in joiners {
            if self.is_waiting(joiner, token) {
                self.add_event(EventType::Joined, joiner, token, 0.0);
            }
        }
    }

    /// Picks the next process to resume, or `None` once nothing is left before `horizon`.
    fn next_wakeup(&mut self, horizon: Time) -> Option<(ProcessId, Wake<C>)> {
        loop {
            if let Some(urgent) = self.urgent.pop_front() {
                match urgent {
                    Urgent::Start(process) => return Some((process, Wake::Fired)),
                    Urgent::Interrupt(process, cause) => {
                        debug_assert!(
                            !self.processes[process].finished,
                            "process {} terminated before its interruption was delivered",
                            process
                        );
                        if self.processes[process].finished {
                            log::error!("dropping interrupt for finished process {}", process);
                            continue;
                        }
                        self.processes[process].token += 1;
                        self.event_list.retain(|e| e.process != process);
                        return Some((process, Wake::Interrupted(cause)));
                    }
                }
            }

            // Strict comparison keeps the earliest scheduled event among equal times.
            let mut min_index = None;
            let mut min_time = Time::INFINITY;
            for (pos, e) in self.event_list.iter().enumerate() {
                if e.time < min_time {
                    min_index = Some(pos);
                    min_time = e.time;
                }
            }

            let index = min_index?;
            if min_time >= horizon {
                self.now = horizon;
                return None;
            }

            let event = self.event_list.remove(index);
            if !self.is_waiting(event.process, event.token) {
                continue;
            }
            self.now = event.time;
            log::trace!(
                "[{}] {} for process {}",
                self.now,
                event.event_type,
                event.process
            );
            return Some((event.process, Wake::Fired));
        }
    }
}

/// Cloneable handle given to processes.
pub struct Env<C> {
    kernel: Rc<RefCell<Kernel<C>>>,
}

impl<C> Clone for Env<C> {
    fn clone(&self) -> Self {
        Env {
            kernel: Rc::clone(&self.kernel),
        }
    }
}

impl<C: 'static> Env<C> {
    pub fn now(&self) -> Time {
        self.kernel.borrow().now
    }

    /// Registers a new process. It starts at the current instant, before any queued timed event.
    pub fn process<F>(&self, body: F) -> ProcessId
    where
        F: Future<Output = ()> + 'static,
    {
        let mut kernel = self.kernel.borrow_mut();
        let process = kernel.processes.len();
        kernel.processes.push(ProcessSlot {
            token: 0,
            finished: false,
            wake: None,
            joiners: Vec::new(),
        });
        kernel.spawned.push((process, Box::pin(body)));
        kernel.urgent.push_back(Urgent::Start(process));
        process
    }

    pub fn timeout(&self, delay: Time) -> Timeout<C> {
        Timeout {
            kernel: Rc::clone(&self.kernel),
            delay,
            armed: false,
        }
    }

    pub fn join(&self, process: ProcessId) -> Join<C> {
        Join {
            kernel: Rc::clone(&self.kernel),
            target: process,
            armed: false,
        }
    }

    /// Runs `body` as a sub-process and blocks until it finishes.
    pub async fn call<F>(&self, body: F) -> Result<(), Interrupt<C>>
    where
        F: Future<Output = ()> + 'static,
    {
        let process = self.process(body);
        self.join(process).await
    }

    /// Interrupts a suspended process.
    ///
    /// # Panics
    ///
    /// If `process` has finished or is the one currently running.
    pub fn interrupt(&self, process: ProcessId, cause: C) {
        let mut kernel = self.kernel.borrow_mut();
        assert!(
            !kernel.processes[process].finished,
            "process {} has terminated and cannot be interrupted",
            process
        );
        assert!(
            kernel.current != Some(process),
            "process {} is running and cannot interrupt itself",
            process
        );
        kernel.urgent.push_back(Urgent::Interrupt(process, cause));
    }

    pub fn is_alive(&self, process: ProcessId) -> bool {
        self.kernel
            .borrow()
            .processes
            .get(process)
            .map_or(false, |slot| !slot.finished)
    }

    pub fn store<T>(&self) -> Store<T, C> {
        Store {
            inner: Rc::new(RefCell::new(StoreInner {
                items: VecDeque::new(),
                consumer: None,
            })),
            kernel: Rc::clone(&self.kernel),
        }
    }
}

/// Future returned by [`Env::timeout`].
pub struct Timeout<C> {
    kernel: Rc<RefCell<Kernel<C>>>,
    delay: Time,
    armed: bool,
}

impl<C> Future for Timeout<C> {
    type Output = Result<(), Interrupt<C>>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut kernel = this.kernel.borrow_mut();
        if !this.armed {
            let (process, token) = kernel.arm();
            kernel.add_event(EventType::Timeout, process, token, this.delay);
            this.armed = true;
            return Poll::Pending;
        }
        match kernel.take_wake() {
            Some(Wake::Fired) => Poll::Ready(Ok(())),
            Some(Wake::Interrupted(cause)) => Poll::Ready(Err(Interrupt { cause })),
            None => Poll::Pending,
        }
    }
}

/// Future returned by [`Env::join`].
pub struct Join<C> {
    kernel: Rc<RefCell<Kernel<C>>>,
    target: ProcessId,
    armed: bool,
}

impl<C> Future for Join<C> {
    type Output = Result<(), Interrupt<C>>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut kernel = this.kernel.borrow_mut();
        if !this.armed {
            if kernel.processes[this.target].finished {
                return Poll::Ready(Ok(()));
            }
            let waiter = kernel.arm();
            kernel.processes[this.target].joiners.push(waiter);
            this.armed = true;
            return Poll::Pending;
        }
        match kernel.take_wake() {
            Some(Wake::Fired) => Poll::Ready(Ok(())),
            Some(Wake::Interrupted(cause)) => Poll::Ready(Err(Interrupt { cause })),
            None => Poll::Pending,
        }
    }
}

struct StoreInner<T> {
    items: VecDeque<T>,
    consumer: Option<(ProcessId, u64)>,
}

/// Unbounded FIFO mailbox with a single blocking consumer.
pub struct Store<T, C> {
    inner: Rc<RefCell<StoreInner<T>>>,
    kernel: Rc<RefCell<Kernel<C>>>,
}

impl<T, C> Clone for Store<T, C> {
    fn clone(&self) -> Self {
        Store {
            inner: Rc::clone(&self.inner),
            kernel: Rc::clone(&self.kernel),
        }
    }
}

impl<T, C> Store<T, C> {
    pub fn put(&self, item: T) {
        let mut inner = self.inner.borrow_mut();
        inner.items.push_back(item);
        if let Some((process, token)) = inner.consumer.take() {
            let mut kernel = self.kernel.borrow_mut();
            if kernel.is_waiting(process, token) {
                kernel.add_event(EventType::Delivered, process, token, 0.0);
            }
        }
    }

    pub fn get(&self) -> Get<T, C> {
        Get {
            store: self.clone(),
            armed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }

    /// Drops every queued item.
    pub fn clear(&self) {
        self.inner.borrow_mut().items.clear();
    }
}

/// Future returned by [`Store::get`].
pub struct Get<T, C> {
    store: Store<T, C>,
    armed: bool,
}

impl<T, C> Future for Get<T, C> {
    type Output = Result<T, Interrupt<C>>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut kernel = this.store.kernel.borrow_mut();
        let mut inner = this.store.inner.borrow_mut();
        if this.armed {
            match kernel.take_wake() {
                Some(Wake::Interrupted(cause)) => return Poll::Ready(Err(Interrupt { cause })),
                Some(Wake::Fired) => {}
                None => return Poll::Pending,
            }
        }
        if let Some(item) = inner.items.pop_front() {
            return Poll::Ready(Ok(item));
        }
        inner.consumer = Some(kernel.arm());
        this.armed = true;
        Poll::Pending
    }
}

/// Owns the processes and the clock.
pub struct Scheduler<C> {
    kernel: Rc<RefCell<Kernel<C>>>,
    tasks: Vec<Option<LocalBoxFuture<'static, ()>>>,
    horizon: Time,
}

impl<C: 'static> Scheduler<C> {
    pub fn new(horizon: Time) -> Scheduler<C> {
        Scheduler {
            kernel: Rc::new(RefCell::new(Kernel {
                now: 0.0,
                event_list: Vec::new(),
                urgent: VecDeque::new(),
                processes: Vec::new(),
                spawned: Vec::new(),
                current: None,
            })),
            tasks: Vec::new(),
            horizon,
        }
    }

    pub fn env(&self) -> Env<C> {
        Env {
            kernel: Rc::clone(&self.kernel),
        }
    }

    pub fn now(&self) -> Time {
        self.kernel.borrow().now
    }

    pub fn horizon(&self) -> Time {
        self.horizon
    }

    /// Resumes the next process. Returns `false` once the horizon is reached or nothing is left.
    pub fn handle_next_event(&mut self) -> bool {
        self.adopt_spawned();
        let next = self.kernel.borrow_mut().next_wakeup(self.horizon);
        match next {
            Some((process, wake)) => {
                self.resume(process, wake);
                true
            }
            None => false,
        }
    }

    /// Runs until the horizon or until no process can make progress. Returns the final time.
    pub fn run(&mut self) -> Time {
        while self.handle_next_event() {}
        self.now()
    }

    /// Runs until virtual time would pass `until` (capped at the horizon).
    pub fn run_until(&mut self, until: Time) -> Time {
        let horizon = self.horizon;
        self.horizon = until.min(horizon);
        while self.handle_next_event() {}
        self.horizon = horizon;
        self.now()
    }

    fn adopt_spawned(&mut self) {
        let spawned = std::mem::take(&mut self.kernel.borrow_mut().spawned);
        for (process, task) in spawned {
            if self.tasks.len() <= process {
                self.tasks.resize_with(process + 1, || None);
            }
            self.tasks[process] = Some(task);
        }
    }

    fn resume(&mut self, process: ProcessId, wake: Wake<C>) {
        {
            let mut kernel = self.kernel.borrow_mut();
            kernel.processes[process].wake = Some(wake);
            kernel.current = Some(process);
        }

        let mut cx = Context::from_waker(noop_waker_ref());
        let finished = match self.tasks.get_mut(process).and_then(Option::as_mut) {
            Some(task) => task.as_mut().poll(&mut cx).is_ready(),
            None => false,
        };

        let mut kernel = self.kernel.borrow_mut();
        kernel.current = None;
        kernel.processes[process].wake = None;
        if finished {
            self.tasks[process] = None;
            kernel.finish(process);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    type Log = Rc<RefCell<Vec<(Time, &'static str)>>>;

    fn record(log: &Log, env: &Env<&'static str>, what: &'static str) {
        log.borrow_mut().push((env.now(), what));
    }

    #[test]
    fn equal_time_timeouts_fire_in_scheduling_order() {
        let mut scheduler: Scheduler<&'static str> = Scheduler::new(100.0);
        let env = scheduler.env();
        let log: Log = Rc::default();
        for name in ["a", "b", "c"] {
            let (env, log) = (env.clone(), log.clone());
            env.clone().process(async move {
                env.timeout(5.0).await.ok();
                record(&log, &env, name);
            });
        }
        scheduler.run();
        assert_eq!(*log.borrow(), vec![(5.0, "a"), (5.0, "b"), (5.0, "c")]);
    }

    #[test]
    fn interrupt_cancels_pending_timer() {
        let mut scheduler: Scheduler<&'static str> = Scheduler::new(100.0);
        let env = scheduler.env();
        let log: Log = Rc::default();

        let sleeper = {
            let (env, log) = (env.clone(), log.clone());
            env.clone().process(async move {
                match env.timeout(50.0).await {
                    Ok(()) => record(&log, &env, "timer"),
                    Err(interrupt) => record(&log, &env, interrupt.cause),
                }
                env.timeout(1.0).await.ok();
                record(&log, &env, "done");
            })
        };
        {
            let env2 = env.clone();
            env.process(async move {
                env2.timeout(10.0).await.ok();
                env2.interrupt(sleeper, "busy");
            });
        }

        scheduler.run();
        assert_eq!(*log.borrow(), vec![(10.0, "busy"), (11.0, "done")]);
    }

    #[test]
    fn call_blocks_until_sub_process_finishes() {
        let mut scheduler: Scheduler<()> = Scheduler::new(100.0);
        let env = scheduler.env();
        let finished_at = Rc::new(RefCell::new(None));
        {
            let (env, finished_at) = (env.clone(), finished_at.clone());
            env.clone().process(async move {
                let child_env = env.clone();
                env.call(async move {
                    child_env.timeout(7.0).await.ok();
                })
                .await
                .ok();
                *finished_at.borrow_mut() = Some(env.now());
            });
        }
        scheduler.run();
        assert_eq!(*finished_at.borrow(), Some(7.0));
    }

    #[test]
    fn store_delivers_in_fifo_order_and_survives_interrupts() {
        let mut scheduler: Scheduler<&'static str> = Scheduler::new(100.0);
        let env = scheduler.env();
        let store: Store<u32, &'static str> = env.store();
        let received = Rc::new(RefCell::new(Vec::new()));
        let interrupts = Rc::new(RefCell::new(0));

        let consumer = {
            let (store, received, interrupts) = (store.clone(), received.clone(), interrupts.clone());
            env.process(async move {
                loop {
                    match store.get().await {
                        Ok(item) => received.borrow_mut().push(item),
                        Err(_) => *interrupts.borrow_mut() += 1,
                    }
                }
            })
        };
        {
            let (env, store) = (env.clone(), store.clone());
            env.clone().process(async move {
                env.timeout(1.0).await.ok();
                store.put(1);
                env.interrupt(consumer, "poke");
                store.put(2);
                env.timeout(1.0).await.ok();
                store.put(3);
            });
        }

        scheduler.run();
        assert_eq!(*received.borrow(), vec![1, 2, 3]);
        assert_eq!(*interrupts.borrow(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn run_stops_at_horizon() {
        let mut scheduler: Scheduler<()> = Scheduler::new(25.0);
        let env = scheduler.env();
        let ticks = Rc::new(RefCell::new(0));
        {
            let (env, ticks) = (env.clone(), ticks.clone());
            env.clone().process(async move {
                loop {
                    env.timeout(10.0).await.ok();
                    *ticks.borrow_mut() += 1;
                }
            });
        }
        assert_eq!(scheduler.run(), 25.0);
        assert_eq!(*ticks.borrow(), 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "terminated before its interruption was delivered")]
    fn queued_interrupt_for_a_finished_process_panics() {
        let mut scheduler: Scheduler<&'static str> = Scheduler::new(100.0);
        let env = scheduler.env();
        let target = {
            let env = env.clone();
            env.clone().process(async move {
                // returns on the first interruption
                env.timeout(50.0).await.ok();
            })
        };
        {
            let env2 = env.clone();
            env.process(async move {
                env2.timeout(1.0).await.ok();
                env2.interrupt(target, "first");
                env2.interrupt(target, "second");
            });
        }
        scheduler.run();
    }

    #[test]
    #[should_panic(expected = "cannot be interrupted")]
    fn interrupting_a_finished_process_panics() {
        let mut scheduler: Scheduler<()> = Scheduler::new(100.0);
        let env = scheduler.env();
        let short = env.process(async {});
        {
            let env2 = env.clone();
            env.process(async move {
                env2.timeout(1.0).await.ok();
                env2.interrupt(short, ());
            });
        }
        scheduler.run();
    }
}
