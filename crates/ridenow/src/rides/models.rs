//! Ride and user data models.

use ridenow_protocol::{RideId, RideStatus, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::{FromRow, Row, sqlite::SqliteRow};

/// A ride request and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub rider_id: UserId,
    pub driver_id: Option<UserId>,
    pub pickup: String,
    pub dropoff: String,
    pub status: RideStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl Ride {
    /// Whether `user_id` is the rider or the assigned driver.
    pub fn involves(&self, user_id: &UserId) -> bool {
        &self.rider_id == user_id || self.driver_id.as_ref() == Some(user_id)
    }

    /// Payload shared by the ride lifecycle events.
    pub fn event_payload(&self) -> Value {
        json!({
            "ride_id": self.id,
            "rider_id": self.rider_id,
            "driver_id": self.driver_id,
            "pickup": self.pickup,
            "dropoff": self.dropoff,
            "status": self.status,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Ride {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<RideStatus>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: e.into(),
            })?;

        Ok(Self {
            id: RideId::new(row.try_get("id")?),
            rider_id: UserId::new(row.try_get::<String, _>("rider_id")?),
            driver_id: row
                .try_get::<Option<String>, _>("driver_id")?
                .map(UserId::new),
            pickup: row.try_get("pickup")?,
            dropoff: row.try_get("dropoff")?,
            status,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Fields written by a conditional ride update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RideUpdate {
    pub status: RideStatus,
    /// `None` leaves the current driver untouched.
    pub driver_id: Option<UserId>,
}

impl RideUpdate {
    pub fn status(status: RideStatus) -> Self {
        Self {
            status,
            driver_id: None,
        }
    }

    pub fn assign(driver_id: UserId) -> Self {
        Self {
            status: RideStatus::Assigned,
            driver_id: Some(driver_id),
        }
    }
}

/// A user as seen by the dispatch service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub is_driver: bool,
}

impl<'r> FromRow<'r, SqliteRow> for User {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: UserId::new(row.try_get::<String, _>("id")?),
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            is_driver: row.try_get("is_driver")?,
        })
    }
}

/// Request to provision a user record.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_driver: bool,
}

/// Request body for creating a ride over REST.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRideRequest {
    pub pickup: String,
    pub dropoff: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ride() -> Ride {
        Ride {
            id: RideId::new(9),
            rider_id: UserId::from("1"),
            driver_id: Some(UserId::from("2")),
            pickup: "A".to_string(),
            dropoff: "B".to_string(),
            status: RideStatus::Assigned,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_involves_rider_and_driver_only() {
        let ride = ride();
        assert!(ride.involves(&UserId::from("1")));
        assert!(ride.involves(&UserId::from("2")));
        assert!(!ride.involves(&UserId::from("3")));
    }

    #[test]
    fn test_event_payload_shape() {
        let payload = ride().event_payload();
        assert_eq!(payload["ride_id"], 9);
        assert_eq!(payload["rider_id"], "1");
        assert_eq!(payload["driver_id"], "2");
        assert_eq!(payload["status"], "assigned");
    }
}
