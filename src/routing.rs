//! Exchange names, routing keys and the messages that travel through them.
//!
//! Exchanges are created out of band (broker definitions), never here.
//! Field names serialize in PascalCase so payloads stay compatible with
//! other Peril clients already on the wire.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";
pub const DEAD_LETTER_EXCHANGE: &str = "peril_dlx";

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Joins a prefix and a username into a routing key, e.g. `war.alice`.
pub fn routing_key(prefix: &str, username: &str) -> String {
    format!("{prefix}.{username}")
}

/// Broadcast on `PAUSE_KEY` to pause or resume every client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitRank {
    Infantry,
    Cavalry,
    Artillery,
}

impl UnitRank {
    /// Strength a unit contributes in a war.
    pub fn power(self) -> u32 {
        match self {
            UnitRank::Infantry => 1,
            UnitRank::Cavalry => 5,
            UnitRank::Artillery => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Unit {
    pub id: u32,
    pub rank: UnitRank,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Player {
    pub username: String,
    pub units: HashMap<u32, Unit>,
}

/// Published on `army_moves.<username>` when a player moves units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArmyMove {
    pub player: Player,
    pub units: Vec<Unit>,
    pub to_location: String,
}

/// Published on `war.<username>` when a move lands on an occupied location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecognitionOfWar {
    pub attacker: Player,
    pub defender: Player,
}

/// Published on `game_logs.<username>` with the binary codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameLog {
    pub current_time: DateTime<Utc>,
    pub message: String,
    pub username: String,
}
