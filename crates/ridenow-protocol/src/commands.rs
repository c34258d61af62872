//! Inbound client actions.
//!
//! Clients name the action with either `event` or `action`, and may put the
//! parameters under `payload` or directly on the top-level object. Both
//! spellings are accepted for every action; a non-empty `action` wins over
//! `event`.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::RideId;

/// A parsed client action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Keepalive; also produced by an empty action name.
    Ping,
    /// Rider asks for a ride.
    RideRequest { pickup: String, dropoff: String },
    /// Driver takes a requested ride.
    RideAccept { ride_id: RideId },
    /// Assigned driver finishes a ride.
    RideComplete { ride_id: RideId },
    /// Rider or assigned driver cancels a ride.
    RideCancel { ride_id: RideId },
    /// Anything else; echoed back as an `unknown_event` error.
    Unknown(String),
}

impl ClientAction {
    /// Name used in logs.
    pub fn name(&self) -> &str {
        match self {
            ClientAction::Ping => "ping",
            ClientAction::RideRequest { .. } => "ride_request",
            ClientAction::RideAccept { .. } => "ride_accept",
            ClientAction::RideComplete { .. } => "ride_complete",
            ClientAction::RideCancel { .. } => "ride_cancel",
            ClientAction::Unknown(name) => name,
        }
    }
}

/// Why an inbound frame could not be turned into an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("payload is not valid JSON")]
    NotJson,

    #[error("payload must be a JSON object")]
    NotObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

impl std::str::FromStr for ClientAction {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s).map_err(|_| ParseError::NotJson)?;
        ClientAction::from_value(&value)
    }
}

impl ClientAction {
    /// Interpret an already-decoded JSON frame.
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        let frame = value.as_object().ok_or(ParseError::NotObject)?;
        let kind = kind_field(frame, "action")?
            .filter(|name| !name.is_empty())
            .or(kind_field(frame, "event")?)
            .unwrap_or("");
        let params = Params::new(frame);

        match kind {
            "" | "ping" => Ok(ClientAction::Ping),
            "ride_request" | "ride_requested" => Ok(ClientAction::RideRequest {
                pickup: params.non_empty_str("pickup")?,
                dropoff: params.non_empty_str("dropoff")?,
            }),
            "ride_accept" | "ride_assigned" => Ok(ClientAction::RideAccept {
                ride_id: params.ride_id()?,
            }),
            "ride_complete" | "ride_completed" => Ok(ClientAction::RideComplete {
                ride_id: params.ride_id()?,
            }),
            "ride_cancel" | "ride_cancelled" => Ok(ClientAction::RideCancel {
                ride_id: params.ride_id()?,
            }),
            other => Ok(ClientAction::Unknown(other.to_string())),
        }
    }
}

/// An action name field; absent and `null` are `None`, other non-strings are
/// rejected.
fn kind_field<'a>(
    frame: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, ParseError> {
    match frame.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) => Ok(Some(name.as_str())),
        Some(_) => Err(ParseError::InvalidField(field)),
    }
}

/// Field lookup that prefers `payload.<field>` and falls back to `<field>`.
struct Params<'a> {
    frame: &'a Map<String, Value>,
    payload: Option<&'a Map<String, Value>>,
}

impl<'a> Params<'a> {
    fn new(frame: &'a Map<String, Value>) -> Self {
        let payload = frame.get("payload").and_then(Value::as_object);
        Self { frame, payload }
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        self.payload
            .and_then(|p| p.get(field))
            .or_else(|| self.frame.get(field))
            .filter(|v| !v.is_null())
    }

    fn non_empty_str(&self, field: &'static str) -> Result<String, ParseError> {
        let value = self.get(field).ok_or(ParseError::MissingField(field))?;
        let text = value.as_str().ok_or(ParseError::InvalidField(field))?.trim();
        if text.is_empty() {
            return Err(ParseError::MissingField(field));
        }
        Ok(text.to_string())
    }

    fn ride_id(&self) -> Result<RideId, ParseError> {
        let value = self.get("ride_id").ok_or(ParseError::MissingField("ride_id"))?;
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(RideId::new)
                .ok_or(ParseError::InvalidField("ride_id")),
            Value::String(s) => s.parse().map_err(|_| ParseError::InvalidField("ride_id")),
            _ => Err(ParseError::InvalidField("ride_id")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ClientAction, ParseError> {
        text.parse()
    }

    #[test]
    fn test_event_and_action_spellings() {
        let a = parse(r#"{"event":"ride_accept","payload":{"ride_id":4}}"#).unwrap();
        let b = parse(r#"{"action":"ride_accept","ride_id":4}"#).unwrap();
        assert_eq!(a, ClientAction::RideAccept { ride_id: RideId::new(4) });
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_action_falls_back_to_event() {
        assert!(matches!(
            parse(r#"{"action":"","event":"ride_request","pickup":"A","dropoff":"B"}"#).unwrap(),
            ClientAction::RideRequest { .. }
        ));
        assert_eq!(
            parse(r#"{"action":"ride_cancel","event":"ping","ride_id":2}"#).unwrap(),
            ClientAction::RideCancel { ride_id: RideId::new(2) }
        );
        assert_eq!(parse(r#"{"action":null,"event":"ping"}"#).unwrap(), ClientAction::Ping);
    }

    #[test]
    fn test_non_string_action_name_is_rejected() {
        assert_eq!(
            parse(r#"{"event":5}"#),
            Err(ParseError::InvalidField("event"))
        );
        assert_eq!(
            parse(r#"{"action":{"name":"ride_accept"},"ride_id":1}"#),
            Err(ParseError::InvalidField("action"))
        );
        assert_eq!(
            parse(r#"{"action":"","event":true}"#),
            Err(ParseError::InvalidField("event"))
        );
    }

    #[test]
    fn test_legacy_aliases() {
        assert_eq!(
            parse(r#"{"action":"ride_completed","ride_id":"9"}"#).unwrap(),
            ClientAction::RideComplete { ride_id: RideId::new(9) }
        );
        assert!(matches!(
            parse(r#"{"action":"ride_requested","pickup":"A","dropoff":"B"}"#).unwrap(),
            ClientAction::RideRequest { .. }
        ));
    }

    #[test]
    fn test_ride_request_fields() {
        let action =
            parse(r#"{"event":"ride_request","payload":{"pickup":" Main St ","dropoff":"Airport"}}"#)
                .unwrap();
        assert_eq!(
            action,
            ClientAction::RideRequest {
                pickup: "Main St".to_string(),
                dropoff: "Airport".to_string(),
            }
        );

        assert_eq!(
            parse(r#"{"event":"ride_request","payload":{"pickup":"A"}}"#),
            Err(ParseError::MissingField("dropoff"))
        );
        assert_eq!(
            parse(r#"{"event":"ride_request","payload":{"pickup":"","dropoff":"B"}}"#),
            Err(ParseError::MissingField("pickup"))
        );
    }

    #[test]
    fn test_ping_and_unknown() {
        assert_eq!(parse(r#"{"event":"ping"}"#).unwrap(), ClientAction::Ping);
        assert_eq!(parse("{}").unwrap(), ClientAction::Ping);
        assert_eq!(
            parse(r#"{"event":"teleport"}"#).unwrap(),
            ClientAction::Unknown("teleport".to_string())
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(parse("not json"), Err(ParseError::NotJson));
        assert_eq!(parse("[1,2]"), Err(ParseError::NotObject));
        assert_eq!(
            parse(r#"{"event":"ride_accept","ride_id":"abc"}"#),
            Err(ParseError::InvalidField("ride_id"))
        );
        assert_eq!(
            parse(r#"{"event":"ride_cancel"}"#),
            Err(ParseError::MissingField("ride_id"))
        );
    }
}
