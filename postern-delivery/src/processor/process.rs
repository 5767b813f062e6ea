//! One pass over the queue, and the per-message delivery task

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use postern_store::{MessageId, StoreError};
use tokio::task::{self, JoinSet};
use tracing::{debug, error};

use crate::{executor::Executor, scheduler::Scheduler};

/// What a single pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub discarded: usize,
    pub bounced: usize,
    pub dispatched: usize,
    /// Abandoned leases handed back to the queue
    pub released: usize,
    /// Due messages left behind because every worker slot was taken
    pub backlog: usize,
}

/// Claim, attempt and settle one message
///
/// Runs as its own task. A message another worker claimed first is skipped
/// silently.
pub(super) async fn deliver_one(scheduler: Arc<Scheduler>, executor: Arc<Executor>, id: MessageId) {
    let message = match scheduler.claim(id, SystemTime::now()).await {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(e) => {
            error!(id = %id, error = %e, "Failed to claim message");
            return;
        }
    };

    let outcome = executor.attempt(&message).await;

    if let Err(e) = scheduler.settle(&message, outcome, SystemTime::now()).await {
        error!(
            id = %id,
            error = %e,
            "Failed to record delivery outcome, lease is released on the next pass"
        );
    }
}

/// Release abandoned leases, purge discards, generate due bounces, then fill
/// free worker slots with due messages
///
/// `in_flight` maps the ids already being worked on to their task in
/// `workers`. Any other
/// `InProgress` message lost its outcome and is made due again.
///
/// # Errors
/// Returns the store error that stopped the pass
pub(super) async fn process_queue(
    scheduler: &Arc<Scheduler>,
    executor: &Arc<Executor>,
    workers: &mut JoinSet<MessageId>,
    in_flight: &mut HashMap<MessageId, task::Id>,
    max_concurrent: usize,
) -> Result<PassSummary, StoreError> {
    let mut summary = PassSummary {
        released: scheduler
            .release_abandoned(|id| in_flight.contains_key(&id), SystemTime::now())
            .await?,
        discarded: scheduler.purge_discarded().await?,
        bounced: scheduler.generate_bounces(SystemTime::now()).await?,
        ..PassSummary::default()
    };

    let due = scheduler.due_messages(SystemTime::now()).await?;

    for id in due {
        if in_flight.contains_key(&id) {
            continue;
        }
        if workers.len() >= max_concurrent {
            summary.backlog += 1;
            continue;
        }

        let scheduler = Arc::clone(scheduler);
        let executor = Arc::clone(executor);
        let handle = workers.spawn(async move {
            deliver_one(scheduler, executor, id).await;
            id
        });
        in_flight.insert(id, handle.id());
        summary.dispatched += 1;
    }

    debug!(
        released = summary.released,
        discarded = summary.discarded,
        bounced = summary.bounced,
        dispatched = summary.dispatched,
        backlog = summary.backlog,
        "Processed delivery queue"
    );

    Ok(summary)
}
