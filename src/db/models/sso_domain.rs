use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use diesel_derive_newtype::DieselNewType;

use macros::UuidFromParam;

use crate::auth::AuthMethod;
use crate::db::schema::{auth_connections, sso_domains};

// An enterprise connection registered at the broker, referenced by the SSO
// domain mapping below.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = auth_connections)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct AuthConnection {
    pub uuid: ConnectionId,
    pub broker_connection_id: String,
    pub protocol: String,
    pub enabled: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Local methods
impl AuthConnection {
    pub fn new(broker_connection_id: &str, protocol: AuthMethod) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid: ConnectionId(crate::util::get_uuid()),
            broker_connection_id: broker_connection_id.to_string(),
            protocol: protocol.to_string(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

use crate::api::EmptyResult;
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl AuthConnection {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(auth_connections::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving auth connection")
            }
            postgresql {
                diesel::insert_into(auth_connections::table)
                    .values(&*self)
                    .on_conflict(auth_connections::uuid)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving auth connection")
            }
        }
    }

    pub async fn find_enabled_by_uuid(uuid: &ConnectionId, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            auth_connections::table
                .filter(auth_connections::uuid.eq(uuid))
                .filter(auth_connections::enabled.eq(true))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_broker_id(broker_connection_id: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            auth_connections::table
                .filter(auth_connections::broker_connection_id.eq(broker_connection_id))
                .first::<Self>(conn)
                .ok()
        }}
    }
}

// Maps a lower-cased email domain to an enterprise connection, with an
// optional case-insensitive regex the full email must match.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = sso_domains)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(domain))]
pub struct SsoDomain {
    pub domain: String,
    pub connection_uuid: ConnectionId,
    pub email_pattern: Option<String>,
    pub enabled: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Local methods
impl SsoDomain {
    pub fn new(domain: &str, connection_uuid: ConnectionId) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            domain: domain.trim().to_lowercase(),
            connection_uuid,
            email_pattern: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Database methods
impl SsoDomain {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(sso_domains::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving SSO domain")
            }
            postgresql {
                diesel::insert_into(sso_domains::table)
                    .values(&*self)
                    .on_conflict(sso_domains::domain)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving SSO domain")
            }
        }
    }

    pub async fn find_enabled(domain: &str, conn: &DbConn) -> Option<Self> {
        let domain = domain.to_lowercase();
        db_run! { conn: {
            sso_domains::table
                .filter(sso_domains::domain.eq(domain))
                .filter(sso_domains::enabled.eq(true))
                .first::<Self>(conn)
                .ok()
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
    UuidFromParam,
)]
#[deref(forward)]
#[from(forward)]
pub struct ConnectionId(String);
