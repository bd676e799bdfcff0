use serde_json::Value;
use thiserror::Error;

use crate::types::Rgb;

pub const SET_LED_COLOR: &str = "SET_LED_COLOR";
pub const DISPLAY_MESSAGE: &str = "DISPLAY_MESSAGE";
pub const REFRESH_CONFIG: &str = "REFRESH_CONFIG";
pub const BLE_BROADCAST: &str = "BLE_BROADCAST";

const ID_KEYS: [&str; 3] = ["id", "commandId", "commandID"];

/// A command exactly as the backend delivers it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCommand {
    pub id: Option<Value>,
    pub command_type: Option<String>,
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastRequest {
    Start,
    Stop,
    Toggle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    SetLedColor(Rgb),
    DisplayMessage(String),
    RefreshConfig,
    BleBroadcast(BroadcastRequest),
}

impl CommandAction {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::BleBroadcast(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: Option<String>,
    pub action: CommandAction,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("command has no type")]
    MissingType,
    #[error("unknown command type `{0}`")]
    UnknownType(String),
    #[error("invalid parameters for {command_type}: `{parameters}`")]
    InvalidParameters {
        command_type: &'static str,
        parameters: String,
    },
}

impl RawCommand {
    /// Reads one element of a command batch. Only non-objects are refused;
    /// the first id spelling present wins and a non-string type counts as
    /// missing, so a bad field costs this command alone.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };
        let id = ID_KEYS
            .iter()
            .find_map(|key| fields.remove(*key).filter(|id| !id.is_null()));
        let command_type = match fields.remove("commandType") {
            Some(Value::String(kind)) => Some(kind),
            _ => None,
        };
        Some(Self {
            id,
            command_type,
            parameters: fields.remove("parameters"),
        })
    }

    /// The command id as used in acknowledgment URLs. Numeric ids are
    /// rendered without quotes; blank ids count as missing.
    pub fn id_string(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    pub fn parameters_text(&self) -> String {
        match &self.parameters {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        }
    }

    fn normalized_type(&self) -> Option<String> {
        self.command_type
            .as_deref()
            .map(|kind| kind.trim().to_ascii_uppercase())
            .filter(|kind| !kind.is_empty())
    }

    pub fn is_broadcast(&self) -> bool {
        self.normalized_type().as_deref() == Some(BLE_BROADCAST)
    }

    pub fn decode(&self) -> Result<Command, DecodeError> {
        let kind = self.normalized_type().ok_or(DecodeError::MissingType)?;
        let parameters = self.parameters_text();

        let action = match kind.as_str() {
            SET_LED_COLOR => CommandAction::SetLedColor(parse_color(&parameters).ok_or_else(
                || DecodeError::InvalidParameters {
                    command_type: SET_LED_COLOR,
                    parameters: parameters.clone(),
                },
            )?),
            DISPLAY_MESSAGE => {
                if parameters.trim().is_empty() {
                    return Err(DecodeError::InvalidParameters {
                        command_type: DISPLAY_MESSAGE,
                        parameters,
                    });
                }
                CommandAction::DisplayMessage(parameters)
            }
            REFRESH_CONFIG => CommandAction::RefreshConfig,
            BLE_BROADCAST => CommandAction::BleBroadcast(
                parse_broadcast(&parameters).ok_or_else(|| DecodeError::InvalidParameters {
                    command_type: BLE_BROADCAST,
                    parameters: parameters.clone(),
                })?,
            ),
            _ => return Err(DecodeError::UnknownType(kind)),
        };

        Ok(Command {
            id: self.id_string(),
            action,
        })
    }
}

/// `r,g,b` with each channel clamped to `0..=255`.
fn parse_color(parameters: &str) -> Option<Rgb> {
    let channels: Vec<i64> = parameters
        .split(',')
        .map(|part| part.trim().parse::<i64>().ok())
        .collect::<Option<_>>()?;
    let [r, g, b] = channels.as_slice() else {
        return None;
    };
    let clamp = |value: i64| value.clamp(0, 255) as u8;
    Some(Rgb::new(clamp(*r), clamp(*g), clamp(*b)))
}

fn parse_broadcast(parameters: &str) -> Option<BroadcastRequest> {
    match parameters.trim().to_ascii_lowercase().as_str() {
        "start" | "on" => Some(BroadcastRequest::Start),
        "stop" | "off" => Some(BroadcastRequest::Stop),
        "toggle" | "" => Some(BroadcastRequest::Toggle),
        _ => None,
    }
}
