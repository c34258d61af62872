//! Ride persistence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ridenow_protocol::{RideId, RideStatus, UserId};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{NewUser, Ride, RideUpdate, User};

/// Persistence operations used by the dispatch core.
///
/// Every status change goes through [`RideStore::conditional_update_ride`],
/// which only applies when the stored status still equals the expected one.
/// That single compare-and-set is what keeps two actors from both advancing
/// the same ride.
#[async_trait]
pub trait RideStore: Send + Sync {
    /// First driver in registration order, if any.
    async fn find_available_driver(&self) -> Result<Option<UserId>>;

    async fn get_ride(&self, ride_id: RideId) -> Result<Option<Ride>>;

    /// Apply `update` if the ride is currently in `expected`.
    /// Returns `false` when the ride is missing or its status moved on.
    async fn conditional_update_ride(
        &self,
        ride_id: RideId,
        expected: RideStatus,
        update: RideUpdate,
    ) -> Result<bool>;

    /// Unknown users are not drivers.
    async fn is_driver(&self, user_id: &UserId) -> Result<bool>;

    async fn create_ride(&self, rider_id: &UserId, pickup: &str, dropoff: &str) -> Result<Ride>;

    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>>;

    /// Rides where the user is the rider or the driver, newest first.
    async fn list_rides_for_user(&self, user_id: &UserId) -> Result<Vec<Ride>>;

    /// Requested rides with no driver yet and an id above `after`, oldest first.
    async fn list_pending_rides(&self, after: Option<RideId>, limit: i64) -> Result<Vec<Ride>>;
}

const RIDE_COLUMNS: &str =
    "id, rider_id, driver_id, pickup, dropoff, status, created_at, updated_at";

/// SQLite implementation of [`RideStore`].
#[derive(Debug, Clone)]
pub struct RideRepository {
    pool: SqlitePool,
}

impl RideRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a user record.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn upsert_user(&self, user: &NewUser) -> Result<User> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, email, is_driver)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                is_driver = excluded.is_driver
            "#,
        )
        .bind(user.id.as_str())
        .bind(&user.name)
        .bind(&user.email)
        .bind(user.is_driver)
        .execute(&self.pool)
        .await
        .context("upserting user")?;

        self.get_user(&user.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user not found after upsert: {}", user.id))
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            "SELECT id, name, email, is_driver FROM users ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing users")?;

        Ok(users)
    }
}

#[async_trait]
impl RideStore for RideRepository {
    async fn find_available_driver(&self) -> Result<Option<UserId>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT id FROM users WHERE is_driver = 1 ORDER BY rowid LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("selecting available driver")?;

        Ok(row.map(|(id,)| UserId::new(id)))
    }

    async fn get_ride(&self, ride_id: RideId) -> Result<Option<Ride>> {
        let ride = sqlx::query_as::<_, Ride>(&format!(
            "SELECT {RIDE_COLUMNS} FROM rides WHERE id = ?"
        ))
        .bind(ride_id.get())
        .fetch_optional(&self.pool)
        .await
        .context("fetching ride")?;

        Ok(ride)
    }

    #[instrument(skip(self, update), fields(to = %update.status))]
    async fn conditional_update_ride(
        &self,
        ride_id: RideId,
        expected: RideStatus,
        update: RideUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE rides
            SET status = ?,
                driver_id = COALESCE(?, driver_id),
                updated_at = datetime('now')
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.driver_id.as_ref().map(UserId::as_str))
        .bind(ride_id.get())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .context("updating ride status")?;

        let applied = result.rows_affected() == 1;
        debug!(applied, "conditional ride update");
        Ok(applied)
    }

    async fn is_driver(&self, user_id: &UserId) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT is_driver FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("checking driver flag")?;

        Ok(row.is_some_and(|(is_driver,)| is_driver))
    }

    #[instrument(skip(self, pickup, dropoff))]
    async fn create_ride(&self, rider_id: &UserId, pickup: &str, dropoff: &str) -> Result<Ride> {
        let result = sqlx::query(
            r#"
            INSERT INTO rides (rider_id, pickup, dropoff, status)
            VALUES (?, ?, ?, 'requested')
            "#,
        )
        .bind(rider_id.as_str())
        .bind(pickup)
        .bind(dropoff)
        .execute(&self.pool)
        .await
        .context("inserting ride")?;

        let ride_id = RideId::new(result.last_insert_rowid());
        self.get_ride(ride_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("ride not found after creation: {ride_id}"))
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, name, email, is_driver FROM users WHERE id = ?",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("fetching user")?;

        Ok(user)
    }

    async fn list_rides_for_user(&self, user_id: &UserId) -> Result<Vec<Ride>> {
        let rides = sqlx::query_as::<_, Ride>(&format!(
            "SELECT {RIDE_COLUMNS} FROM rides WHERE rider_id = ? OR driver_id = ? ORDER BY id DESC"
        ))
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("listing rides for user")?;

        Ok(rides)
    }

    async fn list_pending_rides(&self, after: Option<RideId>, limit: i64) -> Result<Vec<Ride>> {
        let rides = sqlx::query_as::<_, Ride>(&format!(
            "SELECT {RIDE_COLUMNS} FROM rides \
             WHERE status = 'requested' AND driver_id IS NULL AND id > ? \
             ORDER BY id LIMIT ?"
        ))
        .bind(after.map_or(0, RideId::get))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing pending rides")?;

        Ok(rides)
    }
}
