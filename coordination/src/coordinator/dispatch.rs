//! Concurrent fan-out with per-worker timeouts and an overall deadline.
//!
//! ```text
//!   JoinSet ──┬── timeout(per_worker, answer())  worker 0
//!             ├── timeout(per_worker, answer())  worker 1
//!             └── ...
//!   collector: select! { session cancelled | next join | overall deadline }
//! ```
//!
//! The overall deadline is absolute and set by the caller when the request
//! arrived, so time spent queueing for the session shrinks the collection
//! window while each worker keeps its even share of the whole budget.
//! Outcomes are keyed by selection rank; completion order is discarded.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::Context;
use crate::worker::{CallContext, Scratchpad, WorkerFailure, WorkerReply, WorkerError, WorkerResponse};

use super::selection::Selected;

/// What came back from one fan-out.
#[derive(Debug, Default)]
pub(crate) struct DispatchOutcome {
    /// Rank order
    pub responses: Vec<WorkerResponse>,
    /// Rank order
    pub failures: Vec<WorkerFailure>,
    /// The overall deadline fired before every worker finished
    pub timed_out: bool,
}

/// The session was closed while workers were running.
#[derive(Debug)]
pub(crate) struct Cancelled;

/// `min(budget / selected, ceiling)`, never below 1 ms.
pub fn per_worker_timeout(budget: Duration, selected: usize, ceiling: Duration) -> Duration {
    let share = budget / selected.max(1) as u32;
    share.min(ceiling).max(Duration::from_millis(1))
}

/// How one worker task ended.
enum TaskEnd {
    Replied(WorkerReply),
    Errored(WorkerError),
    Panicked,
    TimedOut,
}

type TaskOutput = (usize, Duration, TaskEnd);

enum Slot {
    Pending,
    Done(WorkerResponse),
    Failed(WorkerFailure),
}

pub(crate) async fn dispatch(
    selected: &[Selected],
    query: &str,
    context: Arc<Context>,
    scratch: Scratchpad,
    deadline: Instant,
    per_worker: Duration,
    cancel: &CancellationToken,
) -> Result<DispatchOutcome, Cancelled> {
    let started = Instant::now();

    let mut set: JoinSet<TaskOutput> = JoinSet::new();
    for (rank, s) in selected.iter().enumerate() {
        let worker = s.worker.clone();
        let query = query.to_string();
        let call = CallContext::new(context.clone(), scratch.clone())
            .with_deadline((started + per_worker).min(deadline));
        set.spawn(async move {
            let begun = Instant::now();
            let answer = AssertUnwindSafe(worker.answer(&query, &call)).catch_unwind();
            let end = match tokio::time::timeout(per_worker, answer).await {
                Ok(Ok(Ok(reply))) => TaskEnd::Replied(reply),
                Ok(Ok(Err(e))) => TaskEnd::Errored(e),
                Ok(Err(_panic)) => TaskEnd::Panicked,
                Err(_) => TaskEnd::TimedOut,
            };
            (rank, begun.elapsed(), end)
        });
    }
    debug!(
        workers = selected.len(),
        per_worker_ms = per_worker.as_millis() as u64,
        window_ms = deadline.saturating_duration_since(started).as_millis() as u64,
        "Dispatched"
    );

    let mut slots: BTreeMap<usize, Slot> = (0..selected.len()).map(|r| (r, Slot::Pending)).collect();
    let mut timed_out = false;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                set.abort_all();
                warn!("Session cancelled during dispatch");
                return Err(Cancelled);
            }

            joined = set.join_next() => {
                let Some(joined) = joined else { break };
                let Ok((rank, latency, end)) = joined else {
                    continue;
                };
                let s = &selected[rank];
                let slot = match end {
                    TaskEnd::Replied(reply) => {
                        match WorkerResponse::from_reply(&s.name, s.worker.variant(), reply, latency) {
                            Ok(response) => {
                                debug!(worker = %s.name, latency_ms = response.latency_ms, "Worker responded");
                                Slot::Done(response)
                            }
                            Err(e) => {
                                warn!(worker = %s.name, error = %e, "Invalid worker reply");
                                Slot::Failed(WorkerFailure::execution(&s.name, e.to_string()))
                            }
                        }
                    }
                    TaskEnd::Errored(e) => {
                        warn!(worker = %s.name, error = %e, "Worker failed");
                        Slot::Failed(WorkerFailure::execution(&s.name, e.to_string()))
                    }
                    TaskEnd::Panicked => {
                        warn!(worker = %s.name, "Worker panicked");
                        Slot::Failed(WorkerFailure::execution(&s.name, "worker panicked"))
                    }
                    TaskEnd::TimedOut => {
                        warn!(worker = %s.name, timeout_ms = per_worker.as_millis() as u64, "Worker timed out");
                        Slot::Failed(WorkerFailure::timeout(&s.name, per_worker))
                    }
                };
                slots.insert(rank, slot);
            }

            _ = &mut sleep => {
                set.abort_all();
                timed_out = true;
                warn!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Time budget exhausted"
                );
                break;
            }
        }
    }

    let mut outcome = DispatchOutcome {
        timed_out,
        ..Default::default()
    };
    for (rank, slot) in slots {
        let name = &selected[rank].name;
        match slot {
            Slot::Done(response) => outcome.responses.push(response),
            Slot::Failed(failure) => outcome.failures.push(failure),
            Slot::Pending => {
                outcome
                    .failures
                    .push(WorkerFailure::budget_exhausted(name, started.elapsed()));
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_worker_timeout() {
        let ceiling = Duration::from_secs(30);
        assert_eq!(
            per_worker_timeout(Duration::from_secs(60), 3, ceiling),
            Duration::from_secs(20)
        );
        assert_eq!(
            per_worker_timeout(Duration::from_secs(300), 2, ceiling),
            ceiling
        );
        assert_eq!(
            per_worker_timeout(Duration::from_millis(2), 5, ceiling),
            Duration::from_millis(1)
        );
        assert_eq!(
            per_worker_timeout(Duration::from_secs(6), 0, ceiling),
            Duration::from_secs(6)
        );
    }
}
