//! Application handlers.
//!
//! Each constructor captures an explicitly owned game state (and, where the
//! handler publishes, a channel) and returns a `Handler` ready to hand to a
//! subscription. The game rules themselves live behind `GameRules`; these
//! handlers only translate rule outcomes into follow-up publishes and ack
//! verdicts.
//!
//! State locks are never held across a publish.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::pubsub::{AckType, Handler, publish_binary, publish_json};
use crate::routing::{
    ArmyMove, EXCHANGE_PERIL_TOPIC, GAME_LOG_SLUG, GameLog, Player, PlayingState,
    RecognitionOfWar, WAR_RECOGNITIONS_PREFIX, routing_key,
};
use crate::transport::AmqpChannel;

/// Game state shared between the REPL and the handlers of one process.
pub type SharedState<G> = Arc<Mutex<G>>;

/// Raised by the game rules when a message leads to an outcome they cannot
/// classify. Retrying cannot fix it, so the delivery is discarded.
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("unrecognized outcome: {0}")]
    UnrecognizedOutcome(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The move came from this player.
    SamePlayer,
    Safe,
    MakeWar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarOutcome {
    /// This player is not part of the war; another client must take it.
    NotInvolved,
    NoUnits,
    OpponentWon,
    YouWon,
    Draw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarResult {
    pub outcome: WarOutcome,
    pub winner: String,
    pub loser: String,
}

pub trait PauseState: Send + 'static {
    fn handle_pause(&mut self, state: PlayingState);
}

/// Domain rules of one player's game.
pub trait GameRules: PauseState {
    fn username(&self) -> &str;

    fn player_snapshot(&self) -> Player;

    fn handle_move(&mut self, army_move: &ArmyMove) -> Result<MoveOutcome, GameError>;

    fn handle_war(&mut self, war: &RecognitionOfWar) -> Result<WarResult, GameError>;
}

fn lock<G>(state: &Mutex<G>) -> MutexGuard<'_, G> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn handler_pause<G: PauseState>(state: SharedState<G>) -> impl Handler<PlayingState> {
    move |playing_state: PlayingState| {
        lock(&state).handle_pause(playing_state);
        info!(paused = playing_state.is_paused, "playing state changed");
        std::future::ready(AckType::Ack)
    }
}

/// Reacts to another player's move; a move that starts a war is announced on
/// `war.<username>` before the move is acked.
pub fn handler_move<G, Ch>(state: SharedState<G>, publish_ch: Ch) -> impl Handler<ArmyMove>
where
    G: GameRules,
    Ch: AmqpChannel,
{
    move |army_move: ArmyMove| {
        let state = Arc::clone(&state);
        let publish_ch = publish_ch.clone();
        async move {
            let (outcome, username, defender) = {
                let mut gs = lock(&state);
                let outcome = gs.handle_move(&army_move);
                (outcome, gs.username().to_string(), gs.player_snapshot())
            };

            match outcome {
                Ok(MoveOutcome::SamePlayer) | Ok(MoveOutcome::Safe) => AckType::Ack,
                Ok(MoveOutcome::MakeWar) => {
                    let war = RecognitionOfWar {
                        attacker: army_move.player,
                        defender,
                    };
                    let key = routing_key(WAR_RECOGNITIONS_PREFIX, &username);
                    match publish_json(&publish_ch, EXCHANGE_PERIL_TOPIC, &key, &war).await {
                        Ok(()) => AckType::Ack,
                        Err(e) => {
                            error!(error = %e, routing_key = %key, "could not publish war recognition");
                            AckType::NackRequeue
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "could not handle move");
                    AckType::NackDiscard
                }
            }
        }
    }
}

/// Resolves a war this player is part of and records the result in the game log.
pub fn handler_war<G, Ch>(state: SharedState<G>, publish_ch: Ch) -> impl Handler<RecognitionOfWar>
where
    G: GameRules,
    Ch: AmqpChannel,
{
    move |war: RecognitionOfWar| {
        let state = Arc::clone(&state);
        let publish_ch = publish_ch.clone();
        async move {
            let (result, username) = {
                let mut gs = lock(&state);
                let result = gs.handle_war(&war);
                (result, gs.username().to_string())
            };

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "could not handle war");
                    return AckType::NackDiscard;
                }
            };

            match result.outcome {
                WarOutcome::NotInvolved => AckType::NackRequeue,
                WarOutcome::NoUnits => AckType::NackDiscard,
                WarOutcome::OpponentWon | WarOutcome::YouWon => {
                    let message = format!("{} won a war against {}", result.winner, result.loser);
                    publish_game_log(&publish_ch, &username, message).await
                }
                WarOutcome::Draw => {
                    let message = format!(
                        "A war between {} and {} resulted in a draw",
                        result.winner, result.loser
                    );
                    publish_game_log(&publish_ch, &username, message).await
                }
            }
        }
    }
}

/// Publishes a game log entry on `game_logs.<username>`; a failed publish
/// asks for the triggering delivery to be retried.
pub async fn publish_game_log<Ch: AmqpChannel>(
    publish_ch: &Ch,
    username: &str,
    message: String,
) -> AckType {
    let log = GameLog {
        current_time: Utc::now(),
        message,
        username: username.to_string(),
    };
    let key = routing_key(GAME_LOG_SLUG, username);
    match publish_binary(publish_ch, EXCHANGE_PERIL_TOPIC, &key, &log).await {
        Ok(()) => AckType::Ack,
        Err(e) => {
            error!(error = %e, routing_key = %key, "could not publish game log");
            AckType::NackRequeue
        }
    }
}

/// Appends game log entries to a file, one line per entry.
#[derive(Debug, Clone)]
pub struct GameLogWriter {
    path: PathBuf,
}

impl GameLogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn write(&self, log: &GameLog) -> std::io::Result<()> {
        let line = format!(
            "{} {}: {}\n",
            log.current_time.to_rfc3339(),
            log.username,
            log.message
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

/// Server-side sink for `game_logs.*`.
pub fn handler_logs(writer: GameLogWriter) -> impl Handler<GameLog> {
    move |log: GameLog| {
        let writer = writer.clone();
        async move {
            match writer.write(&log).await {
                Ok(()) => AckType::Ack,
                Err(e) => {
                    warn!(error = %e, path = %writer.path().display(), "could not write game log");
                    AckType::NackRequeue
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
