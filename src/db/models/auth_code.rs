use chrono::{NaiveDateTime, TimeDelta, Utc};
use data_encoding::BASE64URL_NOPAD;
use derive_more::{AsRef, Deref, Display, From};
use diesel_derive_newtype::DieselNewType;

use macros::IdFromParam;

use super::{DeviceId, UserId};
use crate::auth::AuthMethod;
use crate::crypto;
use crate::db::schema::auth_codes;
use crate::CONFIG;

// Our own single-use authorization code, handed to the client at the end of
// `/oauth/callback` (or by a native magic-code verification) and redeemed at
// `/oauth/token`. Distinct from the broker's code, which never leaves the
// callback handler.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = auth_codes)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct AuthCode {
    pub uuid: AuthCodeId,
    pub user_uuid: UserId,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub challenge_method: String,
    pub scopes: Option<String>,
    pub auth_method: String,
    pub device_uuid: Option<DeviceId>,
    pub device_platform: Option<String>,
    pub expires_at: NaiveDateTime,
    pub used_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

/// Local methods
impl AuthCode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_uuid: UserId,
        client_id: String,
        redirect_uri: String,
        code_challenge: String,
        scopes: Option<String>,
        auth_method: AuthMethod,
        device_uuid: Option<DeviceId>,
        device_platform: Option<String>,
    ) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            // The code value doubles as the primary key, 32 random bytes.
            uuid: AuthCodeId(crypto::encode_random_bytes::<32>(BASE64URL_NOPAD)),
            user_uuid,
            client_id,
            redirect_uri,
            code_challenge,
            challenge_method: "S256".to_string(),
            scopes,
            auth_method: auth_method.to_string(),
            device_uuid,
            device_platform,
            expires_at: now + TimeDelta::seconds(CONFIG.auth_code_ttl()),
            used_at: None,
            created_at: now,
        }
    }
}

use crate::api::{ApiResult, EmptyResult};
use crate::db::{DbConn, DbPool};
use crate::error::MapResult;

/// Database methods
impl AuthCode {
    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(auth_codes::table)
                .values(&*self)
                .execute(conn)
                .map_res("Error saving authorization code")
        }}
    }

    /// Single-use consumption. The `used_at` column transitions null to now
    /// exactly once; the filter on null makes racing consumers lose with zero
    /// affected rows. A consumed code stays consumed even when the later
    /// redirect or PKCE check fails.
    pub async fn consume(code: &AuthCodeId, redirect_uri: &str, conn: &DbConn) -> ApiResult<Self> {
        let Some(auth_code) = Self::find_by_uuid(code, conn).await else {
            err_code!("Invalid authorization code", "Unknown authorization code", 401)
        };

        let now = Utc::now().naive_utc();
        if auth_code.expires_at <= now {
            err_code!("Invalid authorization code", format!("code_expired: authorization code {code} has expired"), 401)
        }

        let updated: usize = db_run! { conn: {
            diesel::update(auth_codes::table
                .filter(auth_codes::uuid.eq(code))
                .filter(auth_codes::used_at.is_null()))
                .set(auth_codes::used_at.eq(now))
                .execute(conn)
                .unwrap_or(0)
        }};
        if updated == 0 {
            err_code!("Invalid authorization code", format!("code_already_used: authorization code {code} was replayed"), 401)
        }

        if !crypto::ct_eq(&auth_code.redirect_uri, redirect_uri) {
            err_code!(
                "Invalid authorization code",
                format!("redirect_mismatch: expected {}, got {redirect_uri}", auth_code.redirect_uri),
                401
            )
        }

        Ok(auth_code)
    }

    pub async fn find_by_uuid(uuid: &AuthCodeId, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            auth_codes::table
                .filter(auth_codes::uuid.eq(uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn purge_expired(pool: DbPool) -> EmptyResult {
        debug!("Purging expired authorization codes");
        let conn = match pool.get().await {
            Ok(conn) => conn,
            Err(_) => err!("Failed to get DB connection while purging authorization codes"),
        };

        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::delete(auth_codes::table.filter(auth_codes::expires_at.le(now)))
                .execute(conn)
                .map_res("Error purging authorization codes")
        }}
    }
}

#[derive(
    Clone,
    Debug,
    AsRef,
    Deref,
    DieselNewType,
    Display,
    From,
    Hash,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    IdFromParam,
)]
#[deref(forward)]
#[from(forward)]
pub struct AuthCodeId(String);
