//! Cross-thread job queue feeding a runtime's owner thread.
//!
//! The queue is the only structure in this crate that is mutated from more
//! than one thread. Producers on any thread enqueue boxed closures; the
//! owner thread drains them in `QjsRuntime::run_event_loop`.

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use crate::error::{QjsError, QjsResult};

/// A deferred action executed on the runtime's owner thread
pub type Job = Box<dyn FnOnce() -> QjsResult<()> + Send + 'static>;

/// Tracks jobs the owner thread posts while it drains the queue
struct DrainState {
    owner: ThreadId,
    active: AtomicBool,
    reposted: AtomicUsize,
}

impl DrainState {
    fn note_post(&self) {
        if self.active.load(Ordering::Acquire) && thread::current().id() == self.owner {
            self.reposted.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Unbounded MPSC queue owned by a runtime
pub(crate) struct JobQueue {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    closed: Arc<AtomicBool>,
    drain: Arc<DrainState>,
}

impl JobQueue {
    pub(crate) fn new(closed: Arc<AtomicBool>, owner: ThreadId) -> Self {
        let (tx, rx) = unbounded();
        let drain = Arc::new(DrainState {
            owner,
            active: AtomicBool::new(false),
            reposted: AtomicUsize::new(0),
        });
        Self {
            tx,
            rx,
            closed,
            drain,
        }
    }

    pub(crate) fn sender(&self) -> JobSender {
        JobSender {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
            drain: self.drain.clone(),
        }
    }

    /// Run the jobs queued at entry, plus any those jobs post themselves
    ///
    /// Must be called on the owner thread. Jobs posted by other threads
    /// after entry stay queued for the next drain, so a busy producer cannot
    /// keep the caller here. Returns the number of jobs handed to `run`.
    pub(crate) fn drain(&self, mut run: impl FnMut(Job)) -> usize {
        let mut budget = self.rx.len();
        let nested = self.drain.active.swap(true, Ordering::AcqRel);
        if !nested {
            self.drain.reposted.store(0, Ordering::Release);
        }

        let mut ran = 0;
        while budget > 0 {
            let Some(job) = self.try_next() else {
                break;
            };
            budget -= 1;
            run(job);
            ran += 1;
            budget += self.drain.reposted.swap(0, Ordering::AcqRel);
        }

        if !nested {
            self.drain.active.store(false, Ordering::Release);
        }
        ran
    }

    /// Pop the next job without blocking
    pub(crate) fn try_next(&self) -> Option<Job> {
        match self.rx.try_recv() {
            Ok(job) => Some(job),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Enqueue an internal job even after the runtime was closed
    ///
    /// Used for releasing native handles dropped on foreign threads. On
    /// failure the job is handed back so the caller decides how to drop it.
    pub(crate) fn push_internal(&self, job: Job) -> Result<(), Job> {
        self.tx.send(job).map_err(|e| e.into_inner())
    }

    /// Drop every queued job without running it
    pub(crate) fn discard_pending(&self) -> usize {
        let mut discarded = 0;
        while let Some(job) = self.try_next() {
            drop(job);
            discarded += 1;
        }
        discarded
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }
}

/// Thread-safe handle for posting jobs to a runtime
///
/// Cloneable and `Send + Sync`; posting never blocks and never runs the job
/// synchronously.
#[derive(Clone)]
pub struct JobSender {
    tx: Sender<Job>,
    closed: Arc<AtomicBool>,
    drain: Arc<DrainState>,
}

impl std::fmt::Debug for JobSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSender")
            .field("queued", &self.tx.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl JobSender {
    /// Enqueue a job for the next `run_event_loop` call on the owner thread
    pub fn post<F>(&self, job: F) -> QjsResult<()>
    where
        F: FnOnce() -> QjsResult<()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(QjsError::closed("QjsRuntime"));
        }
        self.tx
            .send(Box::new(job))
            .map_err(|_| QjsError::closed("QjsRuntime"))?;
        self.drain.note_post();
        Ok(())
    }

    /// Whether the target runtime has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
