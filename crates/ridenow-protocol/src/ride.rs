//! Ride lifecycle status and its transition table.

use serde::{Deserialize, Serialize};

/// Ride status.
///
/// Moves strictly forward: `requested -> assigned -> completed`, and either
/// `requested` or `assigned` may move to `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    /// Waiting for a driver.
    Requested,
    /// A driver has been assigned.
    Assigned,
    /// The driver finished the ride.
    Completed,
    /// Cancelled by the rider or the assigned driver.
    Cancelled,
}

impl RideStatus {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: RideStatus) -> bool {
        matches!(
            (self, next),
            (RideStatus::Requested, RideStatus::Assigned)
                | (RideStatus::Assigned, RideStatus::Completed)
                | (RideStatus::Requested, RideStatus::Cancelled)
                | (RideStatus::Assigned, RideStatus::Cancelled)
        )
    }

    /// Completed and cancelled rides never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Requested => "requested",
            RideStatus::Assigned => "assigned",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RideStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requested" => Ok(RideStatus::Requested),
            "assigned" => Ok(RideStatus::Assigned),
            "completed" => Ok(RideStatus::Completed),
            "cancelled" => Ok(RideStatus::Cancelled),
            _ => Err(format!("unknown ride status: {}", s)),
        }
    }
}

impl TryFrom<String> for RideStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
