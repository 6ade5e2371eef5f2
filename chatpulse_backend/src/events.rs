use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::database::{Character, StoredMessage};

/// Per-character live state, as the client's countdown widgets expect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterLiveState {
    pub countdown_ms: u64,
    pub is_thinking: bool,
    pub is_blocked: bool,
}

/// Relationship numbers that change while chatting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacterStatus {
    pub id: String,
    pub name: String,
    pub affinity: i64,
    pub wallet: f64,
    pub pressure_level: i64,
    pub is_blocked: bool,
}

impl From<&Character> for CharacterStatus {
    fn from(character: &Character) -> Self {
        Self {
            id: character.id.clone(),
            name: character.name.clone(),
            affinity: character.affinity,
            wallet: character.wallet,
            pressure_level: character.pressure_level,
            is_blocked: character.is_blocked,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    NewMessage(StoredMessage),
    EngineState(BTreeMap<String, CharacterLiveState>),
    Typing {
        room_id: String,
        character_ids: Vec<String>,
    },
    CharacterUpdated(CharacterStatus),
    CharacterRemoved(String),
    MomentPosted {
        moment_id: i64,
        author_id: String,
    },
    MemoriesStored {
        character_id: String,
        count: usize,
    },
    RedPacketClaimed {
        packet_id: i64,
        claimer_id: String,
        amount: f64,
    },
    Error(String),
}

/// Fan-out of one tenant's events to every open connection.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Nobody listening is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}
