//! Typed client commands and the helper façade automation scripts call.
//!
//! Every command kind declares its fields statically; the tag written on the wire
//! is the variant name. [`Commands`] wraps a running [`SyncLoop`] and adds the
//! error policy of the higher-level helpers: unit orders and configuration calls
//! raise remote-reported failures, while [`Commands::run`] only logs them.

use crate::net::CommandResult;
use crate::sync::{GameState, Stage, SyncLoop};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::error;

/// Map cell coordinates in leptons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Coordinates {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Order issued to one or more units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitAction {
    Select,
    Attack,
    AttackMove,
    Move,
    Capture,
    Repair,
    Deploy,
    Stop,
    Sell,
    SellCell,
}

/// Production queue action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProduceAction {
    Begin,
    Suspend,
    Cancel,
}

/// Runtime configuration of the game-side command handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub single_step: bool,
    #[serde(default)]
    pub debug_log: bool,
    /// Fields this crate does not model, preserved on round trips.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A client command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    GetGameState,
    UnitOrder {
        object_addresses: Vec<u64>,
        action: UnitAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_object: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinates: Option<Coordinates>,
    },
    PlaceBuilding {
        building: u64,
        coordinates: Coordinates,
    },
    PlaceQuery {
        type_class: u64,
        house_class: u64,
        coordinates: Vec<Coordinates>,
    },
    ProduceOrder {
        object_type: u64,
        action: ProduceAction,
    },
    AddMessage {
        message: String,
        duration_frames: u32,
        color: u32,
    },
    ClickEvent {
        object_addresses: Vec<u64>,
        event: u32,
    },
    ReadValue {
        key: String,
    },
    InspectConfiguration {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<Configuration>,
        #[serde(default)]
        update: bool,
    },
}

impl Command {
    /// Wire tag of this command.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::GetGameState => "GetGameState",
            Command::UnitOrder { .. } => "UnitOrder",
            Command::PlaceBuilding { .. } => "PlaceBuilding",
            Command::PlaceQuery { .. } => "PlaceQuery",
            Command::ProduceOrder { .. } => "ProduceOrder",
            Command::AddMessage { .. } => "AddMessage",
            Command::ClickEvent { .. } => "ClickEvent",
            Command::ReadValue { .. } => "ReadValue",
            Command::InspectConfiguration { .. } => "InspectConfiguration",
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Helper façade over a running session.
pub struct Commands<'a> {
    session: &'a SyncLoop,
    timeout: Option<Duration>,
}

impl<'a> Commands<'a> {
    pub(crate) fn new(session: &'a SyncLoop) -> Self {
        Self {
            session,
            timeout: None,
        }
    }

    /// Bound every result wait issued through this façade.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Execute a command and return its result record.
    ///
    /// A remote-reported failure is logged and returned as a normal record.
    pub async fn run(&self, command: Command) -> Result<CommandResult> {
        let record = self.session.execute(&command, self.timeout).await?;
        if record.is_error() {
            error!(
                "Failed to run command {}: {}",
                command.kind(),
                record.error_message.as_deref().unwrap_or_default()
            );
        }
        Ok(record)
    }

    /// Execute a command, turning a remote-reported failure into an error.
    pub async fn run_checked(&self, command: Command) -> Result<CommandResult> {
        let kind = command.kind();
        self.run(command).await?.check(kind)
    }

    pub async fn unit_order(
        &self,
        objects: &[u64],
        action: UnitAction,
        target_object: Option<u64>,
        coordinates: Option<Coordinates>,
    ) -> Result<CommandResult> {
        self.run_checked(Command::UnitOrder {
            object_addresses: objects.to_vec(),
            action,
            target_object,
            coordinates,
        })
        .await
    }

    pub async fn select(&self, objects: &[u64]) -> Result<CommandResult> {
        self.unit_order(objects, UnitAction::Select, None, None).await
    }

    pub async fn attack(&self, objects: &[u64], target: u64) -> Result<CommandResult> {
        self.unit_order(objects, UnitAction::Attack, Some(target), None)
            .await
    }

    pub async fn attack_move(&self, objects: &[u64], at: Coordinates) -> Result<CommandResult> {
        self.unit_order(objects, UnitAction::AttackMove, None, Some(at))
            .await
    }

    pub async fn move_to(&self, objects: &[u64], at: Coordinates) -> Result<CommandResult> {
        self.unit_order(objects, UnitAction::Move, None, Some(at)).await
    }

    pub async fn capture(&self, objects: &[u64], target: u64) -> Result<CommandResult> {
        self.unit_order(objects, UnitAction::Capture, Some(target), None)
            .await
    }

    pub async fn repair(&self, object: u64, target: u64) -> Result<CommandResult> {
        self.unit_order(&[object], UnitAction::Repair, Some(target), None)
            .await
    }

    pub async fn deploy(&self, object: u64) -> Result<CommandResult> {
        self.unit_order(&[object], UnitAction::Deploy, None, None).await
    }

    pub async fn stop_units(&self, objects: &[u64]) -> Result<CommandResult> {
        self.unit_order(objects, UnitAction::Stop, None, None).await
    }

    pub async fn sell(&self, objects: &[u64]) -> Result<CommandResult> {
        self.unit_order(objects, UnitAction::Sell, None, None).await
    }

    pub async fn sell_walls(&self, at: Coordinates) -> Result<CommandResult> {
        self.unit_order(&[], UnitAction::SellCell, None, Some(at)).await
    }

    pub async fn produce_order(
        &self,
        object_type: u64,
        action: ProduceAction,
    ) -> Result<CommandResult> {
        self.run_checked(Command::ProduceOrder {
            object_type,
            action,
        })
        .await
    }

    pub async fn start_production(&self, object_type: u64) -> Result<CommandResult> {
        self.produce_order(object_type, ProduceAction::Begin).await
    }

    pub async fn place_building(&self, building: u64, at: Coordinates) -> Result<CommandResult> {
        self.run(Command::PlaceBuilding {
            building,
            coordinates: at,
        })
        .await
    }

    /// Ask which of `candidates` accept a building of `type_class`.
    pub async fn place_query(
        &self,
        type_class: u64,
        house_class: u64,
        candidates: Vec<Coordinates>,
    ) -> Result<Vec<Coordinates>> {
        #[derive(Deserialize)]
        struct PlaceQueryResult {
            #[serde(default)]
            coordinates: Vec<Coordinates>,
        }

        let record = self
            .run(Command::PlaceQuery {
                type_class,
                house_class,
                coordinates: candidates,
            })
            .await?;
        Ok(record.unpack::<PlaceQueryResult>("place query")?.coordinates)
    }

    pub async fn add_message(
        &self,
        message: impl Into<String>,
        duration_frames: u32,
        color: u32,
    ) -> Result<CommandResult> {
        self.run(Command::AddMessage {
            message: message.into(),
            duration_frames,
            color,
        })
        .await
    }

    pub async fn click_event(&self, objects: &[u64], event: u32) -> Result<CommandResult> {
        self.run(Command::ClickEvent {
            object_addresses: objects.to_vec(),
            event,
        })
        .await
    }

    /// Read a stored value (e.g. `map_data`, `initial_game_state`).
    pub async fn read_value(&self, key: impl Into<String>) -> Result<Value> {
        let record = self.run_checked(Command::ReadValue { key: key.into() }).await?;
        Ok(record.result)
    }

    /// Read the handler configuration, or replace it when `update` is set.
    pub async fn inspect_configuration(
        &self,
        config: Option<Configuration>,
        update: bool,
    ) -> Result<Configuration> {
        #[derive(Deserialize)]
        struct Inspected {
            config: Configuration,
        }

        let record = self
            .run_checked(Command::InspectConfiguration { config, update })
            .await?;
        Ok(record.unpack::<Inspected>("configuration")?.config)
    }

    /// Enable or disable single-step mode.
    pub async fn set_single_step(&self, enabled: bool) -> Result<Configuration> {
        let mut config = self.inspect_configuration(None, false).await?;
        config.single_step = enabled;
        self.inspect_configuration(Some(config), true).await
    }

    pub async fn set_debug_log(&self, enabled: bool) -> Result<Configuration> {
        let mut config = self.inspect_configuration(None, false).await?;
        config.debug_log = enabled;
        self.inspect_configuration(Some(config), true).await
    }

    /// Wait until the match is running past its first frame.
    pub async fn wait_game_to_begin(&self, timeout: Duration) -> Result<()> {
        self.session
            .wait_for(
                |s: &GameState| s.stage == Stage::InGame && s.current_frame > 1,
                timeout,
                Some("game did not begin".to_string()),
            )
            .await
    }

    /// Wait until the game reports it is exiting.
    pub async fn wait_game_to_exit(&self, timeout: Duration) -> Result<()> {
        self.session
            .wait_for(
                |s: &GameState| s.stage == Stage::ExitGame,
                timeout,
                Some("game did not exit".to_string()),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_is_tagged_by_kind() {
        let command = Command::UnitOrder {
            object_addresses: vec![0x10, 0x20],
            action: UnitAction::AttackMove,
            target_object: None,
            coordinates: Some(Coordinates::new(1, 2, 0)),
        };
        let value = command.to_value().unwrap();

        assert_eq!(value["type"], json!("UnitOrder"));
        assert_eq!(value["action"], json!("attack_move"));
        assert_eq!(value["coordinates"], json!({"x": 1, "y": 2, "z": 0}));
        assert!(value.get("target_object").is_none());
        assert_eq!(command.kind(), "UnitOrder");
    }

    #[test]
    fn test_unit_variant_serializes_tag_only() {
        let value = Command::GetGameState.to_value().unwrap();
        assert_eq!(value, json!({"type": "GetGameState"}));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let parsed: std::result::Result<Command, _> =
            serde_json::from_value(json!({"type": "LaunchNukes"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_configuration_preserves_unknown_fields() {
        let config: Configuration =
            serde_json::from_value(json!({"single_step": true, "speed": 3})).unwrap();
        assert!(config.single_step);
        assert!(!config.debug_log);

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["speed"], json!(3));
    }
}
