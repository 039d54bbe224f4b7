//! State snapshot and the collaborator traits the synchronization loop drives.

use crate::commands::Command;
use crate::rpc::RpcClient;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Coarse phase of the game process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Unknown,
    Lobby,
    Loading,
    InGame,
    ExitGame,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Unknown => write!(f, "unknown"),
            Stage::Lobby => write!(f, "lobby"),
            Stage::Loading => write!(f, "loading"),
            Stage::InGame => write!(f, "in-game"),
            Stage::ExitGame => write!(f, "exit-game"),
        }
    }
}

/// Latest state fetched from the game.
///
/// Only the fields the loop itself reads are typed; the rest of the peer's
/// snapshot is kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    #[serde(default)]
    pub current_frame: u64,
    #[serde(default)]
    pub stage: Stage,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl GameState {
    pub fn new(current_frame: u64, stage: Stage) -> Self {
        Self {
            current_frame,
            stage,
            extra: serde_json::Map::new(),
        }
    }

    /// Untyped field of the snapshot.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// Where the loop gets its snapshots from.
#[async_trait]
pub trait StateSource: Send + Sync {
    /// Fetch the latest state. Must fail with a timeout rather than hang.
    async fn fetch_state(&self, client: &RpcClient, timeout: Duration) -> Result<GameState>;

    /// Whether `candidate` should replace `previous`.
    fn should_update(&self, previous: &GameState, candidate: &GameState) -> bool {
        candidate.current_frame != previous.current_frame || candidate.stage != previous.stage
    }
}

/// Fetches state with a `GetGameState` command.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteState;

#[async_trait]
impl StateSource for RemoteState {
    async fn fetch_state(&self, client: &RpcClient, timeout: Duration) -> Result<GameState> {
        #[derive(Deserialize)]
        struct Fetched {
            state: GameState,
        }

        let record = client
            .execute(&Command::GetGameState, Some(timeout))
            .await?
            .check(Command::GetGameState.kind())?;
        Ok(record.unpack::<Fetched>("game state")?.state)
    }
}

/// Per-tick hook invoked with every committed snapshot.
///
/// Returning [`crate::SessionError::Invariant`] stops the loop; any other error
/// is logged and the loop carries on. Commands issued from here wait for their
/// results, which stalls the loop when the game is in single-step mode.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn step(&self, state: &GameState, client: &RpcClient) -> Result<()>;
}

/// Step handler that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStep;

#[async_trait]
impl StepHandler for NoopStep {
    async fn step(&self, _state: &GameState, _client: &RpcClient) -> Result<()> {
        Ok(())
    }
}
