/*!
A bounded thread pool for running chains in parallel.

Jobs are boxed closures consumed from a FIFO queue by a fixed set of OS
worker threads. Enqueueing never blocks; producers that want backpressure
call [`ThreadPool::wait_for_free_capacity`] before enqueueing. Every job
returns a [`Ticket`] that the producer can wait on for completion.
*/

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

use log::{debug, error};

/// Environment variable capping the number of worker threads, read once
/// when the pool is constructed.
pub const MAX_THREADS_ENV: &str = "MULTICHAIN_MAX_THREADS";

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for one enqueued job.
///
/// Tickets only signal completion; a job that panics is logged and its
/// ticket is still marked, so `wait` never deadlocks on a failed job.
#[derive(Clone)]
pub struct Ticket {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Ticket {
    fn new() -> Self {
        Ticket {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Marks the job as completed and wakes all waiters.
    fn mark(&self) {
        let (done, signal) = &*self.inner;
        let mut done = done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        signal.notify_all();
    }

    /// Blocks until the job has completed. Returns immediately if it
    /// already has.
    pub fn wait(&self) {
        let (done, signal) = &*self.inner;
        let done = done.lock().unwrap_or_else(|e| e.into_inner());
        drop(signal.wait_while(done, |d| !*d).unwrap_or_else(|e| e.into_inner()));
    }
}

struct Queue {
    jobs: VecDeque<(Job, Ticket)>,
    // jobs waiting plus jobs currently executing
    pending: u64,
}

struct Shared {
    queue: Mutex<Queue>,
    job_arrival: Condvar,
    capacity_available: Condvar,
    terminate: Mutex<bool>,
    nominal_capacity: u64,
    stop_capacity: u64,
}

/// A fixed-size pool of worker threads with a FIFO job queue.
///
/// The capacity thresholds derive from the worker count: the nominal
/// capacity is `10 × workers` and the stop capacity twice that. They gate
/// only the advisory [`wait_for_free_capacity`](Self::wait_for_free_capacity);
/// the queue itself is unbounded.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool with `workers` threads, or with one thread per
    /// logical CPU if `None`. Either way the count is capped by the
    /// `MULTICHAIN_MAX_THREADS` environment variable when set.
    pub fn new(workers: Option<usize>) -> Self {
        let mut count = workers.unwrap_or_else(num_cpus::get).max(1);
        if let Ok(cap) = std::env::var(MAX_THREADS_ENV) {
            match cap.parse::<usize>() {
                Ok(cap) if cap >= 1 => count = count.min(cap),
                _ => error!("ignoring invalid {}='{}'", MAX_THREADS_ENV, cap),
            }
        }

        let nominal_capacity = 10 * count as u64;
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                pending: 0,
            }),
            job_arrival: Condvar::new(),
            capacity_available: Condvar::new(),
            terminate: Mutex::new(false),
            nominal_capacity,
            stop_capacity: 2 * nominal_capacity,
        });

        debug!("starting thread pool with {} workers", count);
        let workers = (0..count)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || Self::work(shared))
            })
            .collect();

        ThreadPool { shared, workers }
    }

    /// The process-wide pool, created on first use.
    pub fn global() -> &'static ThreadPool {
        static INSTANCE: OnceLock<ThreadPool> = OnceLock::new();
        INSTANCE.get_or_init(|| ThreadPool::new(None))
    }

    pub fn number_of_workers(&self) -> usize {
        self.workers.len()
    }

    /// Adds a job to the back of the queue. Never blocks.
    pub fn enqueue<F>(&self, job: F) -> Ticket
    where
        F: FnOnce() + Send + 'static,
    {
        let ticket = Ticket::new();
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            queue.jobs.push_back((Box::new(job), ticket.clone()));
            queue.pending += 1;
        }
        self.shared.job_arrival.notify_one();
        ticket
    }

    /// Blocks while the number of outstanding jobs is at or above the stop
    /// capacity, until it has drained back to the nominal capacity. Purely
    /// advisory; `enqueue` is not throttled by it.
    pub fn wait_for_free_capacity(&self) {
        let queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if queue.pending < self.shared.stop_capacity {
            return;
        }
        debug!(
            "throttling producer at {} pending jobs",
            queue.pending
        );
        let nominal = self.shared.nominal_capacity;
        drop(
            self.shared
                .capacity_available
                .wait_while(queue, |q| q.pending > nominal)
                .unwrap_or_else(|e| e.into_inner()),
        );
    }

    fn work(shared: Arc<Shared>) {
        loop {
            let (job, ticket) = {
                let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
                loop {
                    if let Some(entry) = queue.jobs.pop_front() {
                        break entry;
                    }
                    if *shared.terminate.lock().unwrap_or_else(|e| e.into_inner()) {
                        return;
                    }
                    queue = shared
                        .job_arrival
                        .wait(queue)
                        .unwrap_or_else(|e| e.into_inner());
                }
            };

            // Run outside the lock. A panicking job must not take the
            // worker down with it; the failure is logged and the ticket
            // marked regardless, so waiters are not stranded.
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("a pool job panicked; the worker continues");
            }

            {
                let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.pending -= 1;
                if queue.pending == shared.nominal_capacity {
                    shared.capacity_available.notify_all();
                }
            }
            ticket.mark();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut terminate = self
                .shared
                .terminate
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *terminate = true;
        }
        // Broadcast under the queue lock: a worker between its empty-check
        // and its wait still holds that lock, so the notification cannot
        // slip into the gap and leave it parked forever.
        {
            let _queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            self.shared.job_arrival.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
