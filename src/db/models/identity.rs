use chrono::{NaiveDateTime, Utc};
use serde_json::Value;

use super::UserId;
use crate::auth::AuthMethod;
use crate::db::schema::identities;

// One row per `(provider, provider_subject)` pair; the subject is the stable
// id the broker reports for the user. Identities are never reassigned between
// users.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = identities)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct Identity {
    pub uuid: String,
    pub user_uuid: UserId,
    pub provider: String,
    pub provider_subject: String,
    pub email: Option<String>,
    pub attributes: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Local methods
impl Identity {
    pub fn new(user_uuid: UserId, provider: AuthMethod, provider_subject: &str) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid: crate::util::get_uuid(),
            user_uuid,
            provider: provider.to_string(),
            provider_subject: provider_subject.to_string(),
            email: None,
            attributes: "{}".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_attributes(&mut self, attributes: &Value) {
        self.attributes = attributes.to_string();
    }
}

use crate::api::{ApiResult, EmptyResult};
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl Identity {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                match diesel::replace_into(identities::table).values(&*self).execute(conn) {
                    Ok(_) => Ok(()),
                    // Record already exists and causes a Foreign Key Violation because replace_into() wants to delete the record first.
                    Err(diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::ForeignKeyViolation, _)) => {
                        diesel::update(identities::table)
                            .filter(identities::uuid.eq(&self.uuid))
                            .set(&*self)
                            .execute(conn)
                            .map_res("Error saving identity")
                    }
                    Err(e) => Err(e.into()),
                }.map_res("Error saving identity")
            }
            postgresql {
                diesel::insert_into(identities::table)
                    .values(&*self)
                    .on_conflict(identities::uuid)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving identity")
            }
        }
    }

    /// Upsert keyed by `(provider, provider_subject)`. An existing row gets a
    /// fresh email and attribute bag but keeps its user; a new row links the
    /// subject to `user_uuid`. Concurrent callbacks racing on the unique
    /// index converge on the first inserted row.
    pub async fn upsert(
        user_uuid: &UserId,
        provider: AuthMethod,
        provider_subject: &str,
        email: Option<&str>,
        attributes: Option<&Value>,
        conn: &DbConn,
    ) -> ApiResult<Self> {
        for attempt in 0..2 {
            if let Some(mut identity) = Self::find_by_provider_and_subject(provider, provider_subject, conn).await {
                if identity.user_uuid != *user_uuid {
                    warn!(
                        "Identity {}/{} belongs to user {}, not relinking to {}",
                        identity.provider, identity.provider_subject, identity.user_uuid, user_uuid
                    );
                }
                identity.email = email.map(str::to_lowercase);
                if let Some(attributes) = attributes {
                    identity.set_attributes(attributes);
                }
                identity.save(conn).await?;
                return Ok(identity);
            }

            let mut identity = Identity::new(user_uuid.clone(), provider, provider_subject);
            identity.email = email.map(str::to_lowercase);
            if let Some(attributes) = attributes {
                identity.set_attributes(attributes);
            }
            match identity.insert(conn).await {
                Ok(()) => return Ok(identity),
                // Unique-index race; retry the lookup once.
                Err(_) if attempt == 0 => continue,
                Err(e) => return Err(e),
            }
        }
        err!("Failed to upsert identity", format!("{provider}/{provider_subject}"))
    }

    async fn insert(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(identities::table)
                .values(&*self)
                .execute(conn)
                .map_res("Error creating identity")
        }}
    }

    pub async fn find_by_provider_and_subject(
        provider: AuthMethod,
        provider_subject: &str,
        conn: &DbConn,
    ) -> Option<Self> {
        let provider = provider.to_string();
        db_run! { conn: {
            identities::table
                .filter(identities::provider.eq(provider))
                .filter(identities::provider_subject.eq(provider_subject))
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Webhook deletion events only carry the broker subject, not a provider.
    pub async fn find_by_subject(provider_subject: &str, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            identities::table
                .filter(identities::provider_subject.eq(provider_subject))
                .load::<Self>(conn)
                .expect("Error loading identities")
        }}
    }
}
