//! Outbound events and relay envelopes.
//!
//! `ServerEvent` is what a client sees on its socket. `DispatchEvent` is what
//! travels over the shared channel between processes: a `ServerEvent` plus the
//! routing target.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ids::UserId;

// ============================================================================
// Event kinds
// ============================================================================

/// All event kinds the server can emit, serialized in snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // -- Connection --
    /// Handshake succeeded.
    Connected,
    /// Server keepalive.
    Ping,
    /// Reply to a client `ping`.
    Pong,
    /// Typed error for the calling session only.
    Error,

    // -- Ride lifecycle notifications --
    /// A rider requested a ride (sent to all drivers).
    NewRide,
    /// A driver was assigned (sent to the rider and the driver).
    RideAssigned,
    /// The ride finished (sent to the rider).
    RideCompleted,
    /// The ride was cancelled (broadcast).
    RideCancelled,

    // -- Acknowledgements to the acting session --
    RideCreated,
    RideAssignedSuccess,
    RideCompletedSuccess,
    RideCancelledSuccess,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Ping => "ping",
            EventKind::Pong => "pong",
            EventKind::Error => "error",
            EventKind::NewRide => "new_ride",
            EventKind::RideAssigned => "ride_assigned",
            EventKind::RideCompleted => "ride_completed",
            EventKind::RideCancelled => "ride_cancelled",
            EventKind::RideCreated => "ride_created",
            EventKind::RideAssignedSuccess => "ride_assigned_success",
            EventKind::RideCompletedSuccess => "ride_completed_success",
            EventKind::RideCancelledSuccess => "ride_cancelled_success",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error codes carried in `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The frame was not a JSON object or a required field was missing.
    InvalidPayload,
    /// The event/action name is not recognized.
    UnknownEvent,
    /// The caller's role may not perform this action.
    Forbidden,
    /// The referenced ride does not exist.
    NotFound,
    /// The ride's current status does not allow the action.
    InvalidTransition,
    /// The caller is not the driver assigned to the ride.
    NotRideDriver,
    /// Server-side failure.
    Internal,
}

// ============================================================================
// Server -> Client
// ============================================================================

/// A frame sent to a client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub event: EventKind,
    #[serde(default)]
    pub payload: Value,
}

impl ServerEvent {
    pub fn new(event: EventKind, payload: Value) -> Self {
        Self { event, payload }
    }

    pub fn connected(user_id: &UserId, is_driver: bool) -> Self {
        Self::new(
            EventKind::Connected,
            json!({
                "message": "WebSocket connection established",
                "user_id": user_id,
                "is_driver": is_driver,
            }),
        )
    }

    pub fn ping() -> Self {
        Self::new(EventKind::Ping, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(EventKind::Pong, Value::Null)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            EventKind::Error,
            json!({ "code": code, "message": message.into() }),
        )
    }

    /// The error code, if this is an `error` event.
    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.event != EventKind::Error {
            return None;
        }
        serde_json::from_value(self.payload.get("code")?.clone()).ok()
    }
}

// ============================================================================
// Relay envelope
// ============================================================================

/// Who should receive a dispatched event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    /// Every live session of one user.
    User { user_id: UserId },
    /// Every live session whose user is a driver.
    AllDrivers,
    /// Every live session.
    Broadcast,
}

/// An event in flight between a producer and the sessions it targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub event_kind: EventKind,
    pub target: Target,
    #[serde(default)]
    pub payload: Value,
}

impl DispatchEvent {
    pub fn to_user(event_kind: EventKind, user_id: UserId, payload: Value) -> Self {
        Self {
            event_kind,
            target: Target::User { user_id },
            payload,
        }
    }

    pub fn to_all_drivers(event_kind: EventKind, payload: Value) -> Self {
        Self {
            event_kind,
            target: Target::AllDrivers,
            payload,
        }
    }

    pub fn broadcast(event_kind: EventKind, payload: Value) -> Self {
        Self {
            event_kind,
            target: Target::Broadcast,
            payload,
        }
    }

    /// The frame delivered to each targeted session.
    pub fn to_server_event(&self) -> ServerEvent {
        ServerEvent::new(self.event_kind, self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_event_wire_format() {
        let event = ServerEvent::new(EventKind::RideAssigned, json!({ "ride_id": 3 }));
        let parsed: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(parsed["event"], "ride_assigned");
        assert_eq!(parsed["payload"]["ride_id"], 3);
    }

    #[test]
    fn test_error_event_carries_code() {
        let event = ServerEvent::error(ErrorCode::InvalidTransition, "ride already assigned");
        let parsed: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(parsed["event"], "error");
        assert_eq!(parsed["payload"]["code"], "invalid_transition");
        assert_eq!(event.error_code(), Some(ErrorCode::InvalidTransition));
        assert_eq!(ServerEvent::pong().error_code(), None);
    }

    #[test]
    fn test_dispatch_event_target_encoding() {
        let event = DispatchEvent::to_user(
            EventKind::RideCompleted,
            UserId::from("7"),
            json!({ "ride_id": 1 }),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"target\":{\"type\":\"user\",\"user_id\":\"7\"}"));

        let drivers = DispatchEvent::to_all_drivers(EventKind::NewRide, Value::Null);
        let parsed: Value = serde_json::to_value(&drivers).unwrap();
        assert_eq!(parsed["target"]["type"], "all_drivers");

        let back: DispatchEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_kind_names_match_serde() {
        for kind in [
            EventKind::NewRide,
            EventKind::RideCreated,
            EventKind::RideAssignedSuccess,
            EventKind::RideCancelled,
        ] {
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                Value::String(kind.as_str().to_string())
            );
        }
    }
}
