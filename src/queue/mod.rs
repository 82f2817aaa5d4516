//! Winner-processing queue (spec §4.6) — C6
//!
//! Payout after a draw is dispatched through a bounded-concurrency queue
//! rather than inline in the scheduler task, so a slow or failing ledger
//! write for one room's payout can never block another room's countdown.
//! Grounded on the teacher's `tower`/`Semaphore`-style bounding (the axum
//! service stack already pulls in `tower` for concurrency limiting) and on
//! the tinylvt currency file's retry-with-backoff shape for transient
//! write failures.
//!
//! Dedup is keyed by round id via a `DashSet`: a round already in flight
//! is dropped rather than double-processed if the scheduler were ever to
//! submit it twice.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;

use crate::eventbus::{subjects, EventBus};
use crate::ledger::Ledger;
use crate::models::{RoomId, RoundId, UserId};

pub struct PayoutJob {
    pub room_id: RoomId,
    pub round_id: RoundId,
    pub winners: Vec<(UserId, Decimal)>,
}

#[derive(Clone)]
pub struct PayoutQueue {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<DashSet<RoundId>>,
    ledger: Ledger,
    events: EventBus,
    max_attempts: u32,
    initial_backoff: Duration,
    backoff_factor: u32,
}

impl PayoutQueue {
    pub fn new(
        ledger: Ledger,
        events: EventBus,
        concurrency: usize,
        max_attempts: u32,
        initial_backoff: Duration,
        backoff_factor: u32,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(DashSet::new()),
            ledger,
            events,
            max_attempts,
            initial_backoff,
            backoff_factor,
        }
    }

    /// Submit a payout job for background processing. Returns immediately;
    /// the job runs on a spawned task bounded by the shared semaphore.
    pub fn submit(&self, job: PayoutJob) {
        if !self.in_flight.insert(job.round_id) {
            tracing::warn!(round_id = %job.round_id, "payout job already in flight, dropping duplicate submission");
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            let _permit = queue
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            queue.run_with_retry(job).await;
        });
    }

    async fn run_with_retry(&self, job: PayoutJob) {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.process(&job).await {
                Ok(()) => {
                    self.in_flight.remove(&job.round_id);
                    return;
                }
                Err(err) if attempt < self.max_attempts => {
                    tracing::warn!(
                        round_id = %job.round_id,
                        attempt,
                        error = %err,
                        "payout attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= self.backoff_factor;
                }
                Err(err) => {
                    tracing::error!(
                        round_id = %job.round_id,
                        attempt,
                        error = %err,
                        "payout failed after max attempts"
                    );
                    self.events.publish(
                        &subjects::global_result(),
                        serde_json::json!({
                            "type": "processing-failed",
                            "roomId": job.room_id.0,
                            "roundId": job.round_id.0,
                        }),
                    );
                    self.in_flight.remove(&job.round_id);
                    return;
                }
            }
        }
    }

    async fn process(&self, job: &PayoutJob) -> Result<(), crate::ledger::LedgerError> {
        for (user_id, amount) in &job.winners {
            self.ledger
                .credit_winner(*user_id, job.round_id, *amount)
                .await?;
            self.events.publish(
                &subjects::user_balance(*user_id),
                serde_json::json!({ "reason": "win" }),
            );
        }
        Ok(())
    }
}
