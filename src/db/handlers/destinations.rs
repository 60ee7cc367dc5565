//! Repository for `DeliveryDestination` rows.

use chrono::Utc;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::errors::{DbError, Result};
use crate::db::models::destinations::{Destination, DestinationConfig, DestinationCreateRequest, DestinationUpdateRequest};
use crate::types::{DestinationId, OrganizationId};

pub struct Destinations<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> Destinations<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    pub async fn create(&mut self, request: &DestinationCreateRequest) -> Result<Destination> {
        let kind = request.config.kind().as_str();
        let config = sqlx::types::Json(request.config.clone());

        let destination = sqlx::query_as::<_, Destination>(
            r#"
            INSERT INTO delivery_destinations (id, organization_id, label, kind, config)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.organization_id)
        .bind(&request.label)
        .bind(kind)
        .bind(config)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(destination)
    }

    pub async fn get_by_id(&mut self, id: DestinationId) -> Result<Option<Destination>> {
        let destination = sqlx::query_as::<_, Destination>("SELECT * FROM delivery_destinations WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;

        Ok(destination)
    }

    pub async fn find_by_org(&mut self, organization_id: OrganizationId) -> Result<Vec<Destination>> {
        let destinations = sqlx::query_as::<_, Destination>(
            "SELECT * FROM delivery_destinations WHERE organization_id = $1 ORDER BY created_at DESC",
        )
        .bind(organization_id)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(destinations)
    }

    pub async fn update(&mut self, id: DestinationId, request: &DestinationUpdateRequest) -> Result<Destination> {
        let config: Option<sqlx::types::Json<DestinationConfig>> = request.config.clone().map(sqlx::types::Json);

        let destination = sqlx::query_as::<_, Destination>(
            r#"
            UPDATE delivery_destinations
            SET
                label = COALESCE($2, label),
                config = COALESCE($3, config),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&request.label)
        .bind(config)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(destination)
    }

    /// Soft-disable; deletion is forbidden while active deliveries reference it
    ///, so this is the only supported removal path.
    pub async fn disable(&mut self, id: DestinationId, disabled_by: Option<Uuid>) -> Result<Destination> {
        let destination = sqlx::query_as::<_, Destination>(
            r#"
            UPDATE delivery_destinations
            SET disabled = true, disabled_at = now(), disabled_by = $2, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(disabled_by)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(destination)
    }

    /// Record that a destination was used, for the `count_usage`/`last_used_at` counters.
    pub async fn record_usage(&mut self, id: DestinationId) -> Result<()> {
        sqlx::query("UPDATE delivery_destinations SET count_usage = count_usage + 1, last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *self.conn)
            .await?;

        Ok(())
    }
}
