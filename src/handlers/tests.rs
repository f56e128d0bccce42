use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::pubsub::{BinaryCodec, Codec, JsonCodec, SimpleQueueType, subscribe_json};
use crate::routing::{ARMY_MOVES_PREFIX, Unit, UnitRank};
use crate::transport::memory::{MemoryBroker, MemoryChannel, Settlement};
use crate::transport::Connector;

/// Scripted game rules: every call returns the next prepared outcome.
struct ScriptedGame {
    username: String,
    paused: bool,
    move_outcome: Result<MoveOutcome, String>,
    war_outcome: Result<WarOutcome, String>,
    moves_seen: usize,
}

impl ScriptedGame {
    fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            paused: false,
            move_outcome: Ok(MoveOutcome::Safe),
            war_outcome: Ok(WarOutcome::NotInvolved),
            moves_seen: 0,
        }
    }
}

impl PauseState for ScriptedGame {
    fn handle_pause(&mut self, state: PlayingState) {
        self.paused = state.is_paused;
    }
}

impl GameRules for ScriptedGame {
    fn username(&self) -> &str {
        &self.username
    }

    fn player_snapshot(&self) -> Player {
        Player {
            username: self.username.clone(),
            units: HashMap::new(),
        }
    }

    fn handle_move(&mut self, _army_move: &ArmyMove) -> Result<MoveOutcome, GameError> {
        self.moves_seen += 1;
        self.move_outcome
            .clone()
            .map_err(GameError::UnrecognizedOutcome)
    }

    fn handle_war(&mut self, war: &RecognitionOfWar) -> Result<WarResult, GameError> {
        let outcome = self
            .war_outcome
            .clone()
            .map_err(GameError::UnrecognizedOutcome)?;
        Ok(WarResult {
            outcome,
            winner: war.attacker.username.clone(),
            loser: war.defender.username.clone(),
        })
    }
}

fn shared(game: ScriptedGame) -> SharedState<ScriptedGame> {
    Arc::new(Mutex::new(game))
}

fn army_move(from: &str) -> ArmyMove {
    let unit = Unit {
        id: 1,
        rank: UnitRank::Cavalry,
        location: "europe".to_string(),
    };
    ArmyMove {
        player: Player {
            username: from.to_string(),
            units: HashMap::from([(1, unit.clone())]),
        },
        units: vec![unit],
        to_location: "asia".to_string(),
    }
}

fn war(attacker: &str, defender: &str) -> RecognitionOfWar {
    RecognitionOfWar {
        attacker: Player {
            username: attacker.to_string(),
            units: HashMap::new(),
        },
        defender: Player {
            username: defender.to_string(),
            units: HashMap::new(),
        },
    }
}

async fn topic_channel() -> (MemoryBroker, MemoryChannel) {
    let broker = MemoryBroker::new();
    broker.declare_exchange(EXCHANGE_PERIL_TOPIC);
    let ch = broker.create_channel().await.unwrap();
    (broker, ch)
}

#[tokio::test]
async fn pause_handler_updates_state_and_acks() {
    let state = shared(ScriptedGame::new("alice"));
    let mut handler = handler_pause(state.clone());

    let verdict = handler.handle(PlayingState { is_paused: true }).await;

    assert_eq!(verdict, AckType::Ack);
    assert!(state.lock().unwrap().paused);
}

#[tokio::test]
async fn safe_move_acks_without_publishing() {
    let (broker, ch) = topic_channel().await;
    let state = shared(ScriptedGame::new("alice"));
    let mut handler = handler_move(state.clone(), ch);

    assert_eq!(handler.handle(army_move("bob")).await, AckType::Ack);
    assert!(broker.published().is_empty());
    assert_eq!(state.lock().unwrap().moves_seen, 1);
}

#[tokio::test]
async fn make_war_publishes_one_recognition_then_acks() {
    let (broker, ch) = topic_channel().await;
    let mut game = ScriptedGame::new("alice");
    game.move_outcome = Ok(MoveOutcome::MakeWar);
    let mut handler = handler_move(shared(game), ch);

    let verdict = handler.handle(army_move("bob")).await;

    assert_eq!(verdict, AckType::Ack);
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, EXCHANGE_PERIL_TOPIC);
    assert_eq!(published[0].routing_key, "war.alice");
    let recognition: RecognitionOfWar = JsonCodec.decode(&published[0].payload).unwrap();
    assert_eq!(recognition.attacker.username, "bob");
    assert_eq!(recognition.defender.username, "alice");
}

#[tokio::test]
async fn make_war_requeues_when_publish_fails() {
    let (broker, ch) = topic_channel().await;
    broker.fail_publishes(true);
    let mut game = ScriptedGame::new("alice");
    game.move_outcome = Ok(MoveOutcome::MakeWar);
    let mut handler = handler_move(shared(game), ch);

    assert_eq!(
        handler.handle(army_move("bob")).await,
        AckType::NackRequeue
    );
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn unrecognized_move_outcome_is_discarded() {
    let (_broker, ch) = topic_channel().await;
    let mut game = ScriptedGame::new("alice");
    game.move_outcome = Err("teleport".to_string());
    let mut handler = handler_move(shared(game), ch);

    assert_eq!(
        handler.handle(army_move("bob")).await,
        AckType::NackDiscard
    );
}

#[tokio::test]
async fn war_outcomes_map_to_verdicts() {
    let cases = [
        (Ok(WarOutcome::NotInvolved), AckType::NackRequeue, 0),
        (Ok(WarOutcome::NoUnits), AckType::NackDiscard, 0),
        (Ok(WarOutcome::YouWon), AckType::Ack, 1),
        (Ok(WarOutcome::OpponentWon), AckType::Ack, 1),
        (Ok(WarOutcome::Draw), AckType::Ack, 1),
        (Err("stalemate".to_string()), AckType::NackDiscard, 0),
    ];

    for (outcome, expected, publishes) in cases {
        let (broker, ch) = topic_channel().await;
        let mut game = ScriptedGame::new("alice");
        game.war_outcome = outcome.clone();
        let mut handler = handler_war(shared(game), ch);

        let verdict = handler.handle(war("bob", "alice")).await;
        assert_eq!(verdict, expected, "outcome {outcome:?}");
        assert_eq!(broker.published().len(), publishes, "outcome {outcome:?}");
    }
}

#[tokio::test]
async fn war_result_is_logged_in_binary() {
    let (broker, ch) = topic_channel().await;
    let mut game = ScriptedGame::new("alice");
    game.war_outcome = Ok(WarOutcome::Draw);
    let mut handler = handler_war(shared(game), ch);

    handler.handle(war("bob", "alice")).await;

    let published = broker.published();
    assert_eq!(published[0].routing_key, "game_logs.alice");
    assert_eq!(published[0].content_type, BinaryCodec.content_type());
    let log: GameLog = BinaryCodec.decode(&published[0].payload).unwrap();
    assert_eq!(log.username, "alice");
    assert_eq!(log.message, "A war between bob and alice resulted in a draw");
}

#[tokio::test]
async fn game_log_publish_failure_requeues() {
    let (broker, ch) = topic_channel().await;
    broker.fail_publishes(true);
    let verdict = publish_game_log(&ch, "alice", "hello".to_string()).await;
    assert_eq!(verdict, AckType::NackRequeue);
}

#[tokio::test]
async fn log_handler_appends_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("game.log");
    let mut handler = handler_logs(GameLogWriter::new(&path));

    for message in ["first", "second"] {
        let log = GameLog {
            current_time: Utc::now(),
            message: message.to_string(),
            username: "alice".to_string(),
        };
        assert_eq!(handler.handle(log).await, AckType::Ack);
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("alice: first"));
    assert!(lines[1].ends_with("alice: second"));
}

#[tokio::test]
async fn log_handler_requeues_when_file_cannot_be_opened() {
    let dir = tempfile::tempdir().unwrap();
    // a directory cannot be opened for appending
    let mut handler = handler_logs(GameLogWriter::new(dir.path()));
    let log = GameLog {
        current_time: Utc::now(),
        message: "lost".to_string(),
        username: "alice".to_string(),
    };
    assert_eq!(handler.handle(log).await, AckType::NackRequeue);
}

#[tokio::test]
async fn move_subscription_publishes_war_before_acking() {
    let (broker, publish_ch) = topic_channel().await;
    let mut game = ScriptedGame::new("alice");
    game.move_outcome = Ok(MoveOutcome::MakeWar);
    let state = shared(game);

    subscribe_json(
        &broker,
        EXCHANGE_PERIL_TOPIC,
        &routing_key(ARMY_MOVES_PREFIX, "alice"),
        &format!("{ARMY_MOVES_PREFIX}.*"),
        SimpleQueueType::Transient,
        handler_move(state, publish_ch.clone()),
    )
    .await
    .unwrap();

    publish_json(
        &publish_ch,
        EXCHANGE_PERIL_TOPIC,
        &routing_key(ARMY_MOVES_PREFIX, "bob"),
        &army_move("bob"),
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), broker.wait_for_settlements(1))
        .await
        .expect("move was not settled");

    let settlements = broker.settlements();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].settlement, Settlement::Ack);

    let routing_keys: Vec<String> = broker
        .published()
        .into_iter()
        .map(|p| p.routing_key)
        .collect();
    assert_eq!(routing_keys, vec!["army_moves.bob", "war.alice"]);
}
