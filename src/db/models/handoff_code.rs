use chrono::{NaiveDateTime, TimeDelta, Utc};
use data_encoding::BASE64URL_NOPAD;

use super::{DeviceId, UserId};
use crate::crypto;
use crate::db::schema::handoff_codes;
use crate::CONFIG;

// Browser-to-device handoff codes. The code is what the browser shows and the
// device redeems; the poll token is a secret shared only with the device, so
// that polling by guessed device ids never reveals whether a code exists.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = handoff_codes)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(code))]
pub struct HandoffCode {
    pub code: String,
    pub poll_token: String,
    pub user_uuid: UserId,
    pub device_uuid: DeviceId,
    pub external_session_id: Option<String>,
    pub expires_at: NaiveDateTime,
    pub used: bool,
    pub used_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

/// Local methods
impl HandoffCode {
    pub fn new(
        user_uuid: UserId,
        device_uuid: DeviceId,
        poll_token: String,
        external_session_id: Option<String>,
    ) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            // 16 bytes of entropy for the visible code, 24 for the poll token.
            code: crypto::encode_random_bytes::<16>(BASE64URL_NOPAD),
            poll_token,
            user_uuid,
            device_uuid,
            external_session_id,
            expires_at: now + TimeDelta::seconds(CONFIG.handoff_code_ttl()),
            used: false,
            used_at: None,
            created_at: now,
        }
    }

    pub fn mint_poll_token() -> String {
        crypto::encode_random_bytes::<24>(BASE64URL_NOPAD)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now().naive_utc()
    }
}

use crate::api::{ApiResult, EmptyResult};
use crate::db::{DbConn, DbPool};
use crate::error::MapResult;

/// Database methods
impl HandoffCode {
    /// Persists this code after dropping any unused predecessors of the same
    /// device, so a stale code can never satisfy a later poll.
    pub async fn save_for_device(&self, conn: &DbConn) -> EmptyResult {
        Self::delete_unused_by_device(&self.device_uuid, conn).await?;

        db_run! { conn: {
            diesel::insert_into(handoff_codes::table)
                .values(&*self)
                .execute(conn)
                .map_res("Error saving handoff code")
        }}
    }

    /// Poll lookup by `(device, poll_token)`. A wrong poll token yields None,
    /// indistinguishable from "no code yet".
    pub async fn find_pending(device_uuid: &DeviceId, poll_token: &str, conn: &DbConn) -> Option<Self> {
        let code: Option<Self> = db_run! { conn: {
            handoff_codes::table
                .filter(handoff_codes::device_uuid.eq(device_uuid))
                .filter(handoff_codes::used.eq(false))
                .first::<Self>(conn)
                .ok()
        }};

        code.filter(|c| crypto::ct_eq(&c.poll_token, poll_token))
    }

    /// Single-use redemption at the device-token endpoint. The consuming
    /// device must be the one the code was created for.
    pub async fn consume(code: &str, device_uuid: &DeviceId, conn: &DbConn) -> ApiResult<Self> {
        let loaded: Option<Self> = db_run! { conn: {
            handoff_codes::table
                .filter(handoff_codes::code.eq(code))
                .first::<Self>(conn)
                .ok()
        }};
        let Some(handoff) = loaded else {
            err_code!("Invalid handoff code", "Unknown handoff code", 401)
        };

        if !crypto::ct_eq(&*handoff.device_uuid, &**device_uuid) {
            err_code!("Invalid handoff code", format!("Handoff code redeemed by device {device_uuid}, minted for {}", handoff.device_uuid), 401)
        }
        if handoff.is_expired() {
            err_code!("Invalid handoff code", "Handoff code has expired", 401)
        }

        let now = Utc::now().naive_utc();
        let updated: usize = db_run! { conn: {
            diesel::update(handoff_codes::table
                .filter(handoff_codes::code.eq(code))
                .filter(handoff_codes::used.eq(false)))
                .set((handoff_codes::used.eq(true), handoff_codes::used_at.eq(now)))
                .execute(conn)
                .unwrap_or(0)
        }};
        if updated == 0 {
            err_code!("Invalid handoff code", format!("Handoff code {code} was replayed"), 401)
        }

        Ok(handoff)
    }

    pub async fn delete_unused_by_device(device_uuid: &DeviceId, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(handoff_codes::table
                .filter(handoff_codes::device_uuid.eq(device_uuid))
                .filter(handoff_codes::used.eq(false)))
                .execute(conn)
                .map_res("Error deleting unused handoff codes")
        }}
    }

    pub async fn purge_expired(pool: DbPool) -> EmptyResult {
        debug!("Purging expired handoff codes");
        let conn = match pool.get().await {
            Ok(conn) => conn,
            Err(_) => err!("Failed to get DB connection while purging handoff codes"),
        };

        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::delete(handoff_codes::table.filter(handoff_codes::expires_at.le(now)))
                .execute(conn)
                .map_res("Error purging handoff codes")
        }}
    }
}
