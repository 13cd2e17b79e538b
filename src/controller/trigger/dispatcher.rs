//! # Rollout Dispatcher
//!
//! A bounded queue served by a fixed pool of workers. Rollouts of the same
//! workload run one at a time; different workloads proceed in parallel.
//!
//! A worker never waits on a busy workload. A job dequeued while its workload
//! is in flight is parked on that workload's deferred list, and the worker
//! that owns the workload runs the list before releasing it. Deferred jobs for
//! the same resource collapse into one that carries the oldest previous
//! fingerprint and the newest current one.

use crate::controller::notifier::{Notification, Notifier};
use crate::controller::trigger::{RolloutJob, RolloutTrigger};
use crate::observability::metrics;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Error)]
#[error("rollout queue is closed")]
pub struct QueueClosed;

/// Producer side of the rollout queue
#[derive(Debug, Clone)]
pub struct RolloutQueue {
    sender: mpsc::Sender<RolloutJob>,
}

impl RolloutQueue {
    /// Wrap an existing channel, for callers that drain jobs themselves
    #[must_use]
    pub fn from_sender(sender: mpsc::Sender<RolloutJob>) -> Self {
        Self { sender }
    }

    /// Enqueue a job, waiting for capacity when the queue is full
    pub async fn submit(&self, job: RolloutJob) -> Result<(), QueueClosed> {
        self.sender.send(job).await.map_err(|_closed| QueueClosed)
    }
}

/// Workloads with a rollout in flight, keyed by workload, with the jobs parked behind it
#[derive(Debug, Default)]
struct InFlight {
    workloads: Mutex<HashMap<String, VecDeque<RolloutJob>>>,
}

impl InFlight {
    /// Take ownership of the job's workload, or park the job if another worker holds it
    fn claim(&self, job: RolloutJob) -> Option<RolloutJob> {
        let mut workloads = self.workloads.lock().unwrap_or_else(PoisonError::into_inner);
        match workloads.get_mut(&job.workload.key()) {
            Some(deferred) => {
                defer(deferred, job);
                None
            }
            None => {
                workloads.insert(job.workload.key(), VecDeque::new());
                Some(job)
            }
        }
    }

    /// Next parked job for a workload the caller owns; releases the workload when none is left
    fn next(&self, key: &str) -> Option<RolloutJob> {
        let mut workloads = self.workloads.lock().unwrap_or_else(PoisonError::into_inner);
        let next = workloads.get_mut(key).and_then(VecDeque::pop_front);
        if next.is_none() {
            workloads.remove(key);
        }
        next
    }
}

fn defer(deferred: &mut VecDeque<RolloutJob>, job: RolloutJob) {
    match deferred.iter_mut().find(|parked| parked.resource == job.resource) {
        Some(parked) => {
            parked.new_fingerprint = job.new_fingerprint;
            parked.strategy = job.strategy;
        }
        None => deferred.push_back(job),
    }
}

/// Worker pool draining the rollout queue
#[derive(Debug)]
pub struct Dispatcher {
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn `workers` workers over a queue of `capacity` jobs
    pub fn start(
        capacity: usize,
        workers: usize,
        trigger: Arc<RolloutTrigger>,
        notifier: Notifier,
    ) -> (RolloutQueue, Dispatcher) {
        let (sender, receiver) = mpsc::channel::<RolloutJob>(capacity.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let in_flight = Arc::new(InFlight::default());

        let workers = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let in_flight = Arc::clone(&in_flight);
                let trigger = Arc::clone(&trigger);
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            debug!(worker, "Rollout queue closed, worker exiting");
                            break;
                        };
                        let key = job.workload.key();
                        let Some(mut job) = in_flight.claim(job) else {
                            debug!(worker, workload = key.as_str(), "Workload busy, rollout deferred");
                            continue;
                        };
                        loop {
                            run_job(&job, &trigger, &notifier).await;
                            match in_flight.next(&key) {
                                Some(next) => job = next,
                                None => break,
                            }
                        }
                    }
                })
            })
            .collect();

        (RolloutQueue { sender }, Dispatcher { workers })
    }

    /// Wait for the workers to drain the queue after every [`RolloutQueue`]
    /// handle has been dropped
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("Rollout workers stopped");
    }
}

async fn run_job(job: &RolloutJob, trigger: &RolloutTrigger, notifier: &Notifier) {
    let event = trigger.execute(job).await;
    metrics::increment_reloads(event.outcome.as_str(), job.strategy.as_str());
    notifier.notify(Notification::Reload(event));
}
