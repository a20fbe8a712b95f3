//! Facility directory backed by the household Postgres schema.

use super::{
    Camera, Directory, Domophone, Entrance, GatewayResult, House, MobileDevice, Watcher,
};
use crate::config::PostgresConfig;
use crate::event::DoorSide;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

const DOMOPHONE_COLUMNS: &str = "house_domophone_id, enabled, model, ip, name";

const CAMERA_COLUMNS: &str = "camera_id, enabled, url, frs, ip, name";

/// [`Directory`] over a Postgres connection pool.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    /// Connect a pool using `config`.
    pub async fn connect(config: &PostgresConfig) -> GatewayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await?;

        info!(max_connections = config.max_connections, "Connected to directory database");

        Ok(Self { pool })
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn domophone_by_ip(&self, ip: &str) -> GatewayResult<Option<Domophone>> {
        let query = format!("SELECT {DOMOPHONE_COLUMNS} FROM houses_domophones WHERE ip = $1");
        let domophone = sqlx::query_as::<_, Domophone>(&query)
            .bind(ip)
            .fetch_optional(&self.pool)
            .await?;
        Ok(domophone)
    }

    async fn domophone_by_id(&self, domophone_id: i32) -> GatewayResult<Option<Domophone>> {
        let query =
            format!("SELECT {DOMOPHONE_COLUMNS} FROM houses_domophones WHERE house_domophone_id = $1");
        let domophone = sqlx::query_as::<_, Domophone>(&query)
            .bind(domophone_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(domophone)
    }

    async fn entrance(
        &self,
        domophone_id: i32,
        side: DoorSide,
    ) -> GatewayResult<Option<Entrance>> {
        let entrance = sqlx::query_as::<_, Entrance>(
            "SELECT house_entrance_id, entrance, camera_id, house_domophone_id, domophone_output, address_house_id \
             FROM houses_entrances \
             LEFT JOIN houses_houses_entrances USING (house_entrance_id) \
             WHERE house_domophone_id = $1 AND domophone_output = $2 \
             LIMIT 1",
        )
        .bind(domophone_id)
        .bind(side.output())
        .fetch_optional(&self.pool)
        .await?;
        Ok(entrance)
    }

    async fn camera(&self, camera_id: i32) -> GatewayResult<Option<Camera>> {
        let query = format!("SELECT {CAMERA_COLUMNS} FROM cameras WHERE camera_id = $1");
        let camera = sqlx::query_as::<_, Camera>(&query)
            .bind(camera_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(camera)
    }

    async fn camera_by_ip(&self, ip: &str) -> GatewayResult<Option<Camera>> {
        let query = format!("SELECT {CAMERA_COLUMNS} FROM cameras WHERE ip = $1 LIMIT 1");
        let camera = sqlx::query_as::<_, Camera>(&query)
            .bind(ip)
            .fetch_optional(&self.pool)
            .await?;
        Ok(camera)
    }

    async fn flats_by_rfid(&self, key: &str) -> GatewayResult<Vec<i32>> {
        let flats: Vec<i32> = sqlx::query_scalar(
            "SELECT house_flat_id FROM houses_flats \
             WHERE house_flat_id IN (SELECT access_to FROM houses_rfids WHERE access_type = 2 AND rfid = $1)",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(flats)
    }

    async fn flats_by_code(&self, code: &str) -> GatewayResult<Vec<i32>> {
        let flats: Vec<i32> =
            sqlx::query_scalar("SELECT house_flat_id FROM houses_flats WHERE open_code = $1")
                .bind(code)
                .fetch_all(&self.pool)
                .await?;
        Ok(flats)
    }

    async fn flat_by_apartment(
        &self,
        apartment: i32,
        domophone_id: i32,
    ) -> GatewayResult<Option<i32>> {
        let flat: Option<i32> = sqlx::query_scalar(
            "SELECT house_flat_id FROM houses_entrances_flats \
             WHERE apartment = $1 AND house_entrance_id IN \
               (SELECT house_entrance_id FROM houses_entrances WHERE house_domophone_id = $2) \
             GROUP BY house_flat_id \
             LIMIT 1",
        )
        .bind(apartment)
        .bind(domophone_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(flat)
    }

    async fn flats_by_face_id(&self, face_id: &str, entrance_id: i32) -> GatewayResult<Vec<i32>> {
        let flats: Vec<i32> = sqlx::query_scalar(
            "SELECT hef.house_flat_id FROM houses_entrances_flats hef \
             JOIN frs_links_faces flf ON hef.house_flat_id = flf.flat_id \
             WHERE hef.house_entrance_id = $1 AND flf.face_id::text = $2",
        )
        .bind(entrance_id)
        .bind(face_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(flats)
    }

    async fn flats_by_phone(&self, domophone_id: i32, phone: &str) -> GatewayResult<Vec<i32>> {
        let flats: Vec<i32> = sqlx::query_scalar(
            "SELECT hef.house_flat_id FROM houses_entrances_flats hef \
             JOIN houses_entrances he ON he.house_entrance_id = hef.house_entrance_id \
             WHERE he.house_domophone_id = $1 AND EXISTS ( \
               SELECT 1 FROM houses_flats_subscribers hfs \
               JOIN houses_subscribers_mobile hsm ON hsm.house_subscriber_id = hfs.house_subscriber_id \
               WHERE hfs.house_flat_id = hef.house_flat_id AND hsm.id = $2) \
             GROUP BY hef.house_flat_id",
        )
        .bind(domophone_id)
        .bind(phone)
        .fetch_all(&self.pool)
        .await?;
        Ok(flats)
    }

    async fn watchers(&self, flat_id: i32) -> GatewayResult<Vec<Watcher>> {
        let watchers = sqlx::query_as::<_, Watcher>(
            "SELECT house_watcher_id, subscriber_device_id, house_flat_id, event_type, event_detail, comments \
             FROM houses_watchers WHERE house_flat_id = $1",
        )
        .bind(flat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(watchers)
    }

    async fn mobile_device(&self, device_id: i32) -> GatewayResult<Option<MobileDevice>> {
        let device = sqlx::query_as::<_, MobileDevice>(
            "SELECT subscriber_device_id, push_token, push_token_type, platform \
             FROM houses_subscribers_devices WHERE subscriber_device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    async fn house_by_entrance(&self, entrance_id: i32) -> GatewayResult<Option<House>> {
        let house = sqlx::query_as::<_, House>(
            "SELECT ah.address_house_id, ah.house_full FROM addresses_houses ah \
             JOIN houses_houses_entrances hhe ON hhe.address_house_id = ah.address_house_id \
             WHERE hhe.house_entrance_id = $1 \
             LIMIT 1",
        )
        .bind(entrance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(house)
    }

    async fn touch_rfid_last_seen(&self, key: &str, at: DateTime<Utc>) -> GatewayResult<()> {
        let result = sqlx::query("UPDATE houses_rfids SET last_seen = $1 WHERE rfid = $2")
            .bind(at.timestamp())
            .bind(key)
            .execute(&self.pool)
            .await?;

        debug!(rfid = %key, rows = result.rows_affected(), "RFID last seen updated");
        Ok(())
    }
}
