//! Bounded multi-producer, multi-consumer dispatch queue.
//!
//! A fixed ring of slots is partitioned by sequence numbers. Producers claim
//! contiguous ranges with a CAS on the cursor and publish each slot by
//! stamping it with its sequence. Workers claim the next sequence from a
//! shared work sequence, wait for it to be published using the configured
//! [`WaitStrategy`], then hand the event to an [`EventListener`]. Each worker
//! advertises the last sequence it is done with so producers never overwrite
//! a slot that is still being read.

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Error type surfaced by listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Dispatch queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Capacity is zero or not a power of two.
    #[error("capacity {0} must be a non-zero power of two")]
    InvalidCapacity(usize),

    /// No worker threads requested.
    #[error("worker thread count must be greater than zero")]
    InvalidThreadCount,

    /// No listener was supplied.
    #[error("an event listener is required")]
    MissingListener,

    /// The queue no longer accepts events.
    #[error("queue is shut down")]
    Shutdown,

    /// A batch larger than the ring can never be claimed.
    #[error("batch of {size} exceeds capacity {capacity}")]
    BatchTooLarge { size: usize, capacity: usize },

    /// `start` was called twice.
    #[error("queue already started")]
    AlreadyStarted,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How idle workers wait for the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Park on a condition variable until a producer signals.
    Blocking,
    /// Spin on the CPU. Lowest latency, burns a core per worker.
    BusySpin,
    /// Spin briefly, then yield the thread.
    Yielding,
    /// Spin, yield, then sleep in short intervals.
    Sleeping,
}

impl FromStr for WaitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "blocking" => Ok(WaitStrategy::Blocking),
            "busyspin" => Ok(WaitStrategy::BusySpin),
            "yielding" => Ok(WaitStrategy::Yielding),
            "sleeping" => Ok(WaitStrategy::Sleeping),
            _ => Err(format!("unknown wait strategy: {}", s)),
        }
    }
}

/// Consumer of dispatched events.
pub trait EventListener<E>: Send + Sync + 'static {
    /// Handles one event.
    fn on_event(&self, event: &E) -> Result<(), BoxError>;

    /// Receives the event whose `on_event` failed or panicked.
    fn on_exception(&self, error: BoxError, sequence: i64, event: E);
}

#[derive(Debug, Error)]
#[error("listener panicked: {0}")]
struct ListenerPanic(String);

fn panic_error(payload: Box<dyn Any + Send>) -> BoxError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Box::new(ListenerPanic(message))
}

struct Slot<E> {
    published: AtomicI64,
    value: UnsafeCell<Option<E>>,
}

struct Ring<E> {
    slots: Box<[Slot<E>]>,
    mask: i64,
    capacity: i64,
    cursor: CachePadded<AtomicI64>,
    gating_cache: CachePadded<AtomicI64>,
    work_sequence: CachePadded<AtomicI64>,
    worker_sequences: Box<[CachePadded<AtomicI64>]>,
    accepting: AtomicBool,
    halted: AtomicBool,
    strategy: WaitStrategy,
    lock: Mutex<()>,
    signal: Condvar,
}

// SAFETY: a slot's value is written only by the producer that claimed its
// sequence, after every worker has moved past the previous lap, and read only
// by the single worker that claimed the sequence after it was published.
unsafe impl<E: Send> Sync for Ring<E> {}
unsafe impl<E: Send> Send for Ring<E> {}

struct Halted;

impl<E> Ring<E> {
    fn new(capacity: usize, workers: usize, strategy: WaitStrategy) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                published: AtomicI64::new(-1),
                value: UnsafeCell::new(None),
            })
            .collect();
        let worker_sequences = (0..workers)
            .map(|_| CachePadded::new(AtomicI64::new(-1)))
            .collect();
        Self {
            slots,
            mask: capacity as i64 - 1,
            capacity: capacity as i64,
            cursor: CachePadded::new(AtomicI64::new(-1)),
            gating_cache: CachePadded::new(AtomicI64::new(-1)),
            work_sequence: CachePadded::new(AtomicI64::new(-1)),
            worker_sequences,
            accepting: AtomicBool::new(true),
            halted: AtomicBool::new(false),
            strategy,
            lock: Mutex::new(()),
            signal: Condvar::new(),
        }
    }

    fn slot(&self, sequence: i64) -> &Slot<E> {
        &self.slots[(sequence & self.mask) as usize]
    }

    fn minimum_gating(&self, default: i64) -> i64 {
        self.worker_sequences
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .chain(std::iter::once(self.work_sequence.load(Ordering::Acquire)))
            .fold(default, i64::min)
    }

    /// Claims `n` sequences, returning the highest, or `None` when full.
    fn try_claim(&self, n: i64) -> Option<i64> {
        loop {
            let current = self.cursor.load(Ordering::Acquire);
            let next = current + n;
            let wrap_point = next - self.capacity;
            if wrap_point > self.gating_cache.load(Ordering::Acquire) {
                let min = self.minimum_gating(current);
                self.gating_cache.store(min, Ordering::Release);
                if wrap_point > min {
                    return None;
                }
            }
            if self
                .cursor
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(next);
            }
        }
    }

    /// Writes and publishes `events` into the claimed range ending at `hi`.
    fn publish(&self, hi: i64, events: Vec<E>) {
        let lo = hi - events.len() as i64 + 1;
        for (sequence, event) in (lo..=hi).zip(events) {
            let slot = self.slot(sequence);
            // SAFETY: the sequence was claimed by this producer and gating
            // guarantees the previous occupant was taken by its worker.
            unsafe {
                *slot.value.get() = Some(event);
            }
            slot.published.store(sequence, Ordering::Release);
        }
        if self.strategy == WaitStrategy::Blocking {
            let _guard = self.lock.lock();
            self.signal.notify_all();
        }
    }

    fn is_available(&self, sequence: i64) -> bool {
        self.slot(sequence).published.load(Ordering::Acquire) == sequence
    }

    /// Takes the event of a published sequence.
    ///
    /// # Safety
    ///
    /// The caller must own `sequence` through the work sequence and must have
    /// observed it as available.
    unsafe fn take(&self, sequence: i64) -> Option<E> {
        (*self.slot(sequence).value.get()).take()
    }

    fn wait_for(&self, sequence: i64) -> Result<(), Halted> {
        let backoff = Backoff::new();
        loop {
            if self.is_available(sequence) {
                return Ok(());
            }
            if self.halted.load(Ordering::Acquire) {
                return Err(Halted);
            }
            match self.strategy {
                WaitStrategy::BusySpin => std::hint::spin_loop(),
                WaitStrategy::Yielding => backoff.snooze(),
                WaitStrategy::Sleeping => {
                    if backoff.is_completed() {
                        thread::sleep(Duration::from_micros(100));
                    } else {
                        backoff.snooze();
                    }
                }
                WaitStrategy::Blocking => {
                    let mut guard = self.lock.lock();
                    if !self.is_available(sequence) && !self.halted.load(Ordering::Acquire) {
                        // Timed wait so a producer racing the check costs at
                        // most one interval.
                        self.signal.wait_for(&mut guard, Duration::from_millis(10));
                    }
                }
            }
        }
    }

    fn drained(&self) -> bool {
        let cursor = self.cursor.load(Ordering::Acquire);
        self.worker_sequences
            .iter()
            .all(|s| s.load(Ordering::Acquire) >= cursor)
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }
}

/// Builder for [`ParallelQueue`].
pub struct ParallelQueueBuilder<E> {
    capacity: usize,
    threads: usize,
    strategy: WaitStrategy,
    name_prefix: String,
    listener: Option<Arc<dyn EventListener<E>>>,
}

impl<E: Send + 'static> ParallelQueueBuilder<E> {
    /// Sets the ring capacity, a power of two.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the worker thread count.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the idle wait strategy.
    pub fn wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the worker thread name prefix.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Sets the event listener.
    pub fn listener(mut self, listener: Arc<dyn EventListener<E>>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Validates settings and builds a stopped queue.
    pub fn build(self) -> Result<ParallelQueue<E>, QueueError> {
        if self.capacity == 0 || !self.capacity.is_power_of_two() {
            return Err(QueueError::InvalidCapacity(self.capacity));
        }
        if self.threads == 0 {
            return Err(QueueError::InvalidThreadCount);
        }
        let listener = self.listener.ok_or(QueueError::MissingListener)?;
        Ok(ParallelQueue {
            ring: Arc::new(Ring::new(self.capacity, self.threads, self.strategy)),
            listener,
            threads: self.threads,
            name_prefix: self.name_prefix,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// Ring-buffer backed work queue with a pool of worker threads.
///
/// # Example
///
/// ```
/// use rust_apigateway::dispatch::{BoxError, EventListener, ParallelQueue, WaitStrategy};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// struct Counter(AtomicUsize);
///
/// impl EventListener<u64> for Counter {
///     fn on_event(&self, _event: &u64) -> Result<(), BoxError> {
///         self.0.fetch_add(1, Ordering::Relaxed);
///         Ok(())
///     }
///     fn on_exception(&self, _error: BoxError, _sequence: i64, _event: u64) {}
/// }
///
/// let counter = Arc::new(Counter(AtomicUsize::new(0)));
/// let queue = ParallelQueue::builder()
///     .capacity(64)
///     .threads(2)
///     .wait_strategy(WaitStrategy::Yielding)
///     .listener(counter.clone())
///     .build()
///     .unwrap();
/// queue.start().unwrap();
/// for i in 0..100 {
///     queue.add(i).unwrap();
/// }
/// queue.shut_down();
/// assert_eq!(counter.0.load(Ordering::Relaxed), 100);
/// ```
pub struct ParallelQueue<E> {
    ring: Arc<Ring<E>>,
    listener: Arc<dyn EventListener<E>>,
    threads: usize,
    name_prefix: String,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<E: Send + 'static> ParallelQueue<E> {
    /// Starts building a queue.
    pub fn builder() -> ParallelQueueBuilder<E> {
        ParallelQueueBuilder {
            capacity: 1024,
            threads: 1,
            strategy: WaitStrategy::Blocking,
            name_prefix: "parallel-queue".to_string(),
            listener: None,
        }
    }

    /// Spawns the worker threads.
    pub fn start(&self) -> Result<(), QueueError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadyStarted);
        }
        let mut workers = self.workers.lock();
        for index in 0..self.threads {
            let ring = Arc::clone(&self.ring);
            let listener = Arc::clone(&self.listener);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name_prefix, index))
                .spawn(move || run_worker(ring, listener, index))?;
            workers.push(handle);
        }
        info!(
            threads = self.threads,
            capacity = self.ring.capacity,
            strategy = ?self.ring.strategy,
            "parallel queue started"
        );
        Ok(())
    }

    /// Enqueues one event without waiting. Hands the event back when the
    /// ring is full or shut down.
    pub fn try_add(&self, event: E) -> Result<(), E> {
        self.try_add_all(vec![event])
            .map_err(|mut events| events.remove(0))
    }

    /// Enqueues all events or none of them, without waiting.
    pub fn try_add_all(&self, events: Vec<E>) -> Result<(), Vec<E>> {
        if events.is_empty() {
            return Ok(());
        }
        if !self.ring.accepting.load(Ordering::Acquire) || events.len() as i64 > self.ring.capacity {
            return Err(events);
        }
        match self.ring.try_claim(events.len() as i64) {
            Some(hi) => {
                self.ring.publish(hi, events);
                Ok(())
            }
            None => Err(events),
        }
    }

    /// Enqueues one event, waiting for a free slot.
    pub fn add(&self, event: E) -> Result<(), QueueError> {
        self.add_all(vec![event])
    }

    /// Enqueues all events as one contiguous range, waiting for room.
    pub fn add_all(&self, events: Vec<E>) -> Result<(), QueueError> {
        if events.is_empty() {
            return Ok(());
        }
        let n = events.len() as i64;
        if n > self.ring.capacity {
            return Err(QueueError::BatchTooLarge {
                size: events.len(),
                capacity: self.ring.capacity as usize,
            });
        }
        let backoff = Backoff::new();
        loop {
            if !self.ring.accepting.load(Ordering::Acquire) {
                return Err(QueueError::Shutdown);
            }
            if let Some(hi) = self.ring.try_claim(n) {
                self.ring.publish(hi, events);
                return Ok(());
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(50));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.ring.capacity as usize
    }

    /// Stops accepting events, lets workers drain what was published, then
    /// stops and joins them.
    pub fn shut_down(&self) {
        if !self.ring.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.started.load(Ordering::Acquire) {
            while !self.ring.drained() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.ring.halt();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!("dispatch worker exited with a panic");
            }
        }
        info!("parallel queue shut down");
    }

    /// Whether the queue stopped accepting events.
    pub fn is_shutdown(&self) -> bool {
        !self.ring.accepting.load(Ordering::Acquire)
    }
}

impl<E> Drop for ParallelQueue<E> {
    fn drop(&mut self) {
        self.ring.accepting.store(false, Ordering::Release);
        self.ring.halt();
        for handle in std::mem::take(&mut *self.workers.lock()) {
            let _ = handle.join();
        }
    }
}

impl<E> fmt::Debug for ParallelQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelQueue")
            .field("capacity", &self.ring.capacity)
            .field("threads", &self.threads)
            .field("strategy", &self.ring.strategy)
            .field("cursor", &self.ring.cursor.load(Ordering::Relaxed))
            .finish()
    }
}

fn run_worker<E: Send + 'static>(ring: Arc<Ring<E>>, listener: Arc<dyn EventListener<E>>, index: usize) {
    let own = &ring.worker_sequences[index];
    let mut processed = true;
    let mut next = own.load(Ordering::Acquire);

    loop {
        if processed {
            processed = false;
            loop {
                next = ring.work_sequence.load(Ordering::Acquire) + 1;
                own.store(next - 1, Ordering::Release);
                if ring
                    .work_sequence
                    .compare_exchange(next - 1, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }

        if ring.wait_for(next).is_err() {
            break;
        }

        // SAFETY: `next` was claimed through the work sequence by this worker
        // alone and `wait_for` observed it published.
        let event = unsafe { ring.take(next) };
        processed = true;
        let Some(event) = event else {
            continue;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => notify_exception(&*listener, err, next, event),
            Err(payload) => notify_exception(&*listener, panic_error(payload), next, event),
        }
    }
    debug!(worker = index, "dispatch worker stopped");
}

fn notify_exception<E: 'static>(listener: &dyn EventListener<E>, err: BoxError, sequence: i64, event: E) {
    if panic::catch_unwind(AssertUnwindSafe(|| listener.on_exception(err, sequence, event))).is_err() {
        error!(sequence, "exception handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, AtomicUsize};

    struct Recorder {
        seen: Vec<AtomicU8>,
        handled: AtomicUsize,
        failures: Mutex<Vec<(String, i64, usize)>>,
        fail_on: Option<usize>,
        panic_on: Option<usize>,
    }

    impl Recorder {
        fn new(n: usize) -> Arc<Self> {
            Self::failing(n, None, None)
        }

        fn failing(n: usize, fail_on: Option<usize>, panic_on: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                seen: (0..n).map(|_| AtomicU8::new(0)).collect(),
                handled: AtomicUsize::new(0),
                failures: Mutex::new(Vec::new()),
                fail_on,
                panic_on,
            })
        }
    }

    impl EventListener<usize> for Recorder {
        fn on_event(&self, event: &usize) -> Result<(), BoxError> {
            if Some(*event) == self.panic_on {
                panic!("boom {}", event);
            }
            if Some(*event) == self.fail_on {
                return Err("rejected".into());
            }
            self.seen[*event].fetch_add(1, Ordering::Relaxed);
            self.handled.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn on_exception(&self, error: BoxError, sequence: i64, event: usize) {
            self.failures.lock().push((error.to_string(), sequence, event));
        }
    }

    fn queue(listener: Arc<Recorder>, capacity: usize, threads: usize, strategy: WaitStrategy) -> ParallelQueue<usize> {
        ParallelQueue::builder()
            .capacity(capacity)
            .threads(threads)
            .wait_strategy(strategy)
            .name_prefix("test-worker")
            .listener(listener)
            .build()
            .unwrap()
    }

    #[test]
    fn test_capacity_must_be_power_of_two() {
        let result = ParallelQueue::<usize>::builder()
            .capacity(1000)
            .listener(Recorder::new(1))
            .build();
        assert!(matches!(result, Err(QueueError::InvalidCapacity(1000))));

        let result = ParallelQueue::<usize>::builder()
            .threads(0)
            .listener(Recorder::new(1))
            .build();
        assert!(matches!(result, Err(QueueError::InvalidThreadCount)));
    }

    #[test]
    fn test_wait_strategy_from_str() {
        assert_eq!("blocking".parse::<WaitStrategy>().unwrap(), WaitStrategy::Blocking);
        assert_eq!("busySpin".parse::<WaitStrategy>().unwrap(), WaitStrategy::BusySpin);
        assert_eq!("yielding".parse::<WaitStrategy>().unwrap(), WaitStrategy::Yielding);
        assert_eq!("sleeping".parse::<WaitStrategy>().unwrap(), WaitStrategy::Sleeping);
        assert!("napping".parse::<WaitStrategy>().is_err());
    }

    #[test]
    fn test_every_event_delivered_exactly_once() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 5_000;
        let total = PRODUCERS * PER_PRODUCER;
        let recorder = Recorder::new(total);
        let queue = Arc::new(queue(Arc::clone(&recorder), 256, 4, WaitStrategy::Blocking));
        queue.start().unwrap();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.add(p * PER_PRODUCER + i).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        queue.shut_down();

        assert_eq!(recorder.handled.load(Ordering::Relaxed), total);
        assert!(recorder.seen.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_all_wait_strategies_deliver() {
        for strategy in [
            WaitStrategy::Blocking,
            WaitStrategy::BusySpin,
            WaitStrategy::Yielding,
            WaitStrategy::Sleeping,
        ] {
            let recorder = Recorder::new(500);
            let queue = queue(Arc::clone(&recorder), 64, 2, strategy);
            queue.start().unwrap();
            for i in 0..500 {
                queue.add(i).unwrap();
            }
            queue.shut_down();
            assert_eq!(recorder.handled.load(Ordering::Relaxed), 500, "{:?}", strategy);
        }
    }

    #[test]
    fn test_try_add_fails_when_full() {
        let recorder = Recorder::new(8);
        let queue = queue(recorder, 4, 1, WaitStrategy::Blocking);
        for i in 0..4 {
            assert!(queue.try_add(i).is_ok());
        }
        assert_eq!(queue.try_add(4), Err(4));
    }

    #[test]
    fn test_try_add_all_is_all_or_nothing() {
        let recorder = Recorder::new(8);
        let queue = queue(Arc::clone(&recorder), 4, 1, WaitStrategy::Blocking);
        assert!(queue.try_add_all(vec![0, 1, 2]).is_ok());
        assert_eq!(queue.try_add_all(vec![3, 4]), Err(vec![3, 4]));
        assert!(queue.try_add_all(vec![3]).is_ok());
        assert!(matches!(
            queue.add_all(vec![0; 5]),
            Err(QueueError::BatchTooLarge { size: 5, capacity: 4 })
        ));

        queue.start().unwrap();
        queue.shut_down();
        assert_eq!(recorder.handled.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_failed_event_routed_to_exception_handler() {
        let recorder = Recorder::failing(10, Some(3), Some(7));
        let queue = queue(Arc::clone(&recorder), 16, 2, WaitStrategy::Yielding);
        queue.start().unwrap();
        for i in 0..10 {
            queue.add(i).unwrap();
        }
        queue.shut_down();

        assert_eq!(recorder.handled.load(Ordering::Relaxed), 8);
        let mut failures = recorder.failures.lock().clone();
        failures.sort_by_key(|f| f.2);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].0, "rejected");
        assert_eq!((failures[0].1, failures[0].2), (3, 3));
        assert!(failures[1].0.contains("boom 7"));
        assert_eq!(failures[1].2, 7);
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let recorder = Recorder::new(100);
        let queue = queue(Arc::clone(&recorder), 128, 2, WaitStrategy::Sleeping);
        for i in 0..100 {
            queue.try_add(i).unwrap();
        }
        queue.start().unwrap();
        queue.shut_down();

        assert!(queue.is_shutdown());
        assert_eq!(recorder.handled.load(Ordering::Relaxed), 100);
        assert!(queue.try_add(0).is_err());
        assert!(matches!(queue.add(0), Err(QueueError::Shutdown)));
    }

    #[test]
    fn test_start_twice() {
        let queue = queue(Recorder::new(1), 4, 1, WaitStrategy::Blocking);
        queue.start().unwrap();
        assert!(matches!(queue.start(), Err(QueueError::AlreadyStarted)));
        queue.shut_down();
    }
}
