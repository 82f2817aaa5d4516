//! Per-room state machine (spec §4.5) — C5
//!
//! One `tokio::task` per room, driven by an `mpsc::Receiver<SchedulerCommand>`
//! so every state transition for a given room is serialized through a single
//! owner, with a `tokio::time::interval` tick producer racing the command
//! channel inside one `select!` loop. Grounded on the teacher's own
//! long-running-task-plus-channel pattern in `handlers/ws.rs` (one task per
//! connection reading from a channel while writing ticks to the socket),
//! generalised here to one task per room publishing to the event bus
//! instead of a single socket.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::eventbus::{subjects, EventBus};
use crate::ledger::Ledger;
use crate::models::{Room, RoomId, RoundId, UserId};
use crate::oracle::{self, OracleError};
use crate::queue::{PayoutJob, PayoutQueue};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("room {0} has no running scheduler")]
    NotRunning(RoomId),
    #[error("scheduler command channel closed for room {0}")]
    ChannelClosed(RoomId),
    #[error("round is not accepting joins in its current state")]
    NotJoinable,
    #[error("user already participates in the current round")]
    AlreadyParticipating,
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Idle,
    Countdown,
    Drawing,
    Completed,
    Resetting,
}

/// Commands sent to a room's scheduler task. Replies travel back over a
/// `oneshot` so callers can await the effect of their own command (spec
/// §4.5's request/response shape for join/leave), while ticks and state
/// broadcasts go out over the event bus to every subscriber.
pub enum SchedulerCommand {
    Join {
        user_id: UserId,
        bet_amount: rust_decimal::Decimal,
        client_fingerprint: String,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    Leave {
        user_id: UserId,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// Forces an immediate re-check of the min-participants threshold,
    /// used by the watchdog to abort a stalled countdown.
    WatchdogTick,
    Shutdown,
}

#[derive(Clone)]
pub struct SchedulerHandle {
    room_id: RoomId,
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub async fn join(
        &self,
        user_id: UserId,
        bet_amount: rust_decimal::Decimal,
        client_fingerprint: String,
    ) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Join {
                user_id,
                bet_amount,
                client_fingerprint,
                reply,
            })
            .await
            .map_err(|_| SchedulerError::ChannelClosed(self.room_id))?;
        rx.await.map_err(|_| SchedulerError::ChannelClosed(self.room_id))?
    }

    pub async fn leave(&self, user_id: UserId) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Leave { user_id, reply })
            .await
            .map_err(|_| SchedulerError::ChannelClosed(self.room_id))?;
        rx.await.map_err(|_| SchedulerError::ChannelClosed(self.room_id))?
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(SchedulerCommand::Shutdown).await;
    }
}

struct RoomRuntime {
    room: Room,
    ledger: Ledger,
    events: EventBus,
    queue: PayoutQueue,
    countdown: Duration,
    linger: Duration,
    watchdog: Duration,
    state: RoomState,
    round_id: RoundId,
    participants: Vec<(UserId, String)>,
    commitment: Option<oracle::Commitment>,
}

/// Spawn the owning task for one room and return a handle to it. The task
/// runs until `Shutdown` is received or the channel is dropped.
pub fn spawn(
    room: Room,
    ledger: Ledger,
    events: EventBus,
    queue: PayoutQueue,
    countdown: Duration,
    linger: Duration,
    watchdog: Duration,
) -> SchedulerHandle {
    let room_id = room.id;
    let (tx, rx) = mpsc::channel(64);
    let runtime = RoomRuntime {
        room,
        ledger,
        events,
        queue,
        countdown,
        linger,
        watchdog,
        state: RoomState::Idle,
        round_id: RoundId::new(),
        participants: Vec::new(),
        commitment: None,
    };
    tokio::spawn(run(runtime, rx));
    SchedulerHandle { room_id, tx }
}

async fn run(mut rt: RoomRuntime, mut rx: mpsc::Receiver<SchedulerCommand>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut countdown_remaining = rt.countdown;
    let mut watchdog = tokio::time::interval(rt.watchdog);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(SchedulerCommand::Join { user_id, bet_amount, client_fingerprint, reply }) => {
                        let result = rt.handle_join(user_id, bet_amount, client_fingerprint).await;
                        if result.is_ok() && rt.state == RoomState::Idle {
                            rt.state = RoomState::Countdown;
                            countdown_remaining = rt.countdown;
                            rt.publish_state();
                        }
                        let _ = reply.send(result);
                    }
                    Some(SchedulerCommand::Leave { user_id, reply }) => {
                        let result = rt.handle_leave(user_id).await;
                        let _ = reply.send(result);
                    }
                    Some(SchedulerCommand::WatchdogTick) => {
                        if rt.state == RoomState::Countdown {
                            rt.check_watchdog_threshold();
                        }
                    }
                    Some(SchedulerCommand::Shutdown) => {
                        tracing::info!(room_id = %rt.room.id, "scheduler shutting down");
                        return;
                    }
                    None => return,
                }
            }
            _ = tick.tick(), if rt.state == RoomState::Countdown => {
                rt.events.publish(
                    &subjects::room_ticks(rt.room.id),
                    serde_json::json!({ "remainingSecs": countdown_remaining.as_secs() }),
                );
                if countdown_remaining.is_zero() {
                    rt.run_drawing().await;
                    countdown_remaining = rt.countdown;
                } else {
                    countdown_remaining = countdown_remaining.saturating_sub(Duration::from_secs(1));
                }
            }
            _ = watchdog.tick(), if rt.state == RoomState::Countdown => {
                rt.check_watchdog_threshold();
            }
        }
    }
}

impl RoomRuntime {
    async fn handle_join(
        &mut self,
        user_id: UserId,
        bet_amount: rust_decimal::Decimal,
        client_fingerprint: String,
    ) -> Result<(), SchedulerError> {
        if self.state != RoomState::Idle && self.state != RoomState::Countdown {
            return Err(SchedulerError::NotJoinable);
        }
        if self.participants.iter().any(|(id, _)| *id == user_id) {
            return Err(SchedulerError::AlreadyParticipating);
        }
        if self.commitment.is_none() {
            let commitment = oracle::generate_commitment();
            self.ledger
                .create_round(self.round_id, self.room.id, &commitment.server_seed_hash)
                .await?;
            self.commitment = Some(commitment);
        }
        self.ledger
            .deduct_for_join(user_id, &self.room, self.round_id, bet_amount)
            .await?;
        self.participants.push((user_id, client_fingerprint));
        self.events.publish(
            &subjects::user_balance(user_id),
            serde_json::json!({ "reason": "join" }),
        );
        Ok(())
    }

    async fn handle_leave(&mut self, user_id: UserId) -> Result<(), SchedulerError> {
        // Leave is allowed only while Waiting (Idle); once Countdown starts
        // the scheduler is the sole writer of the round (spec §4.5 "Single-
        // writer", §4.8 "refused in Countdown/Drawing").
        if self.state != RoomState::Idle {
            return Err(SchedulerError::NotJoinable);
        }
        self.ledger
            .refund_on_leave(user_id, self.round_id, &self.room)
            .await?;
        self.participants.retain(|(id, _)| *id != user_id);
        self.events.publish(
            &subjects::user_balance(user_id),
            serde_json::json!({ "reason": "leave" }),
        );
        if self.participants.is_empty() {
            self.state = RoomState::Idle;
            self.publish_state();
        }
        Ok(())
    }

    /// Watchdog abort path (spec §4.5 edge case): if the countdown has run
    /// long enough to fire the watchdog and the room still hasn't reached
    /// `min_participants`, abort the round and refund everyone rather than
    /// let the countdown hang indefinitely.
    fn check_watchdog_threshold(&mut self) {
        if self.state == RoomState::Countdown
            && self.participants.len() < self.room.min_participants as usize
        {
            tracing::warn!(
                room_id = %self.room.id,
                participants = self.participants.len(),
                min = self.room.min_participants,
                "watchdog: threshold not met, aborting round"
            );
            self.state = RoomState::Idle;
            self.publish_countdown_cancelled();
        }
    }

    /// Abort path for a Countdown that loses the min-participant threshold
    /// (spec §4.5 "Abort paths", §5 "Cancellation & timeouts"): cancels
    /// pending ticks by dropping back to `Idle` and emits `countdownCancelled`
    /// instead of the normal state snapshot, so clients know no `result`
    /// is coming for this round.
    fn publish_countdown_cancelled(&self) {
        self.events.publish(
            &subjects::room_state(self.room.id),
            serde_json::json!({
                "state": self.state,
                "event": "countdownCancelled",
                "participantCount": self.participants.len(),
            }),
        );
    }

    async fn run_drawing(&mut self) {
        if self.participants.len() < self.room.min_participants as usize {
            self.check_watchdog_threshold();
            return;
        }

        self.state = RoomState::Drawing;
        self.publish_state();

        let commitment = match self.commitment.take() {
            Some(c) => c,
            None => oracle::generate_commitment(),
        };
        let fingerprints: Vec<String> = self
            .participants
            .iter()
            .map(|(_, fp)| fp.clone())
            .collect();
        let client_seed = oracle::aggregate_client_seed(&fingerprints);

        let winners = oracle::draw_winners(
            &commitment.server_seed,
            &client_seed,
            self.round_id.0,
            self.participants.len(),
            self.room.winner_count as usize,
        );

        // Animation is published only after the draw itself has been
        // computed, enforcing animation-before-result ordering structurally:
        // the result event below cannot be constructed before this point.
        self.events.publish(
            &subjects::room_animation(self.room.id),
            serde_json::json!({ "participantCount": self.participants.len() }),
        );

        match winners {
            Ok(indices) => {
                if let Err(err) = self
                    .ledger
                    .reveal_round(self.round_id, &commitment.server_seed, &client_seed)
                    .await
                {
                    tracing::error!(room_id = %self.room.id, error = %err, "failed to persist round reveal");
                }

                let winner_ids: Vec<UserId> = indices
                    .iter()
                    .map(|&i| self.participants[i].0)
                    .collect();
                self.events.publish(
                    &subjects::room_result(self.room.id),
                    serde_json::json!({
                        "winnerIds": winner_ids.iter().map(|u| u.0).collect::<Vec<_>>(),
                        "serverSeed": commitment.server_seed.0,
                        "serverSeedHash": commitment.server_seed_hash.0,
                        "clientSeed": client_seed.0,
                    }),
                );
                self.events.publish(
                    &subjects::global_result(),
                    serde_json::json!({
                        "roomId": self.room.id.0,
                        "winnerIds": winner_ids.iter().map(|u| u.0).collect::<Vec<_>>(),
                    }),
                );

                self.queue.submit(PayoutJob {
                    room_id: self.room.id,
                    round_id: self.round_id,
                    winners: self.split_prize_pool(&winner_ids),
                });
            }
            Err(err) => {
                tracing::error!(room_id = %self.room.id, error = %err, "draw failed, aborting round");
            }
        }

        self.state = RoomState::Resetting;
        self.publish_state();
        tokio::time::sleep(self.linger).await;

        self.state = RoomState::Idle;
        self.round_id = RoundId::new();
        self.participants.clear();
        self.commitment = None;
        self.publish_state();
    }

    /// Split the accumulated prize pool (bets minus commission, tracked by
    /// the ledger as each join lands) evenly across winners. `winner_ids`
    /// is never empty here: `run_drawing` only reaches this point after a
    /// successful draw.
    fn split_prize_pool(
        &self,
        winner_ids: &[UserId],
    ) -> Vec<(UserId, rust_decimal::Decimal)> {
        split_prize_pool(
            self.room.entry_fee,
            self.room.commission_rate,
            self.participants.len(),
            winner_ids,
        )
    }

    fn publish_state(&self) {
        self.events.publish(
            &subjects::room_state(self.room.id),
            serde_json::json!({ "state": self.state, "participantCount": self.participants.len() }),
        );
    }
}

/// Pure prize-pool split: total bets collected minus commission, divided
/// evenly across winners and rounded to cents. `winner_count` is assumed
/// non-zero by callers (a successful draw always returns at least one
/// winner index).
fn split_prize_pool(
    entry_fee: rust_decimal::Decimal,
    commission_rate: rust_decimal::Decimal,
    participant_count: usize,
    winner_ids: &[UserId],
) -> Vec<(UserId, rust_decimal::Decimal)> {
    use rust_decimal::Decimal;

    let total_bets = entry_fee * Decimal::from(participant_count);
    let prize_pool = total_bets * (Decimal::ONE - commission_rate);
    let share = (prize_pool / Decimal::from(winner_ids.len())).round_dp(2);
    winner_ids.iter().map(|&id| (id, share)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn decimal(s: &str) -> rust_decimal::Decimal {
        rust_decimal::Decimal::from_str(s).unwrap()
    }

    #[test]
    fn splits_prize_pool_evenly_after_commission() {
        let winners = vec![UserId::new(), UserId::new()];
        let shares = split_prize_pool(decimal("10"), decimal("0.1"), 5, &winners);

        assert_eq!(shares.len(), 2);
        for (_, amount) in &shares {
            assert_eq!(*amount, decimal("22.50"));
        }
    }

    #[test]
    fn single_winner_takes_the_whole_pool() {
        let winners = vec![UserId::new()];
        let shares = split_prize_pool(decimal("5"), decimal("0"), 4, &winners);

        assert_eq!(shares, vec![(winners[0], decimal("20"))]);
    }
}

