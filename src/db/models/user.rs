use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use diesel_derive_newtype::DieselNewType;
use serde_json::Value;

use macros::UuidFromParam;

use crate::db::schema::users;

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = users)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct User {
    pub uuid: UserId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_admin: bool,
    pub organization: Option<String>,
    pub last_login_web_at: Option<NaiveDateTime>,
    pub last_login_app_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

/// Local methods
impl User {
    pub fn new(email: &str) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid: UserId(crate::util::get_uuid()),
            email: email.trim().to_lowercase(),
            first_name: None,
            last_name: None,
            is_admin: false,
            organization: None,
            last_login_web_at: None,
            last_login_app_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Fills name fields the broker knows and we don't. Existing values win,
    /// a profile can only add information.
    pub fn merge_profile_names(&mut self, first_name: Option<&str>, last_name: Option<&str>) -> bool {
        let mut changed = false;
        if self.first_name.is_none() {
            if let Some(first) = first_name.filter(|n| !n.trim().is_empty()) {
                self.first_name = Some(first.trim().to_string());
                changed = true;
            }
        }
        if self.last_name.is_none() {
            if let Some(last) = last_name.filter(|n| !n.trim().is_empty()) {
                self.last_name = Some(last.trim().to_string());
                changed = true;
            }
        }
        changed
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.uuid,
            "email": self.email,
            "firstName": self.first_name,
            "lastName": self.last_name,
            "isAdmin": self.is_admin,
            "organization": self.organization,
        })
    }
}

use crate::api::{ApiResult, EmptyResult};
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl User {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        if self.email.trim().is_empty() {
            err!("User email can't be empty")
        }

        self.updated_at = Utc::now().naive_utc();

        db_run! {conn:
            sqlite, mysql {
                match diesel::replace_into(users::table)
                    .values(&*self)
                    .execute(conn)
                {
                    Ok(_) => Ok(()),
                    // Record already exists and causes a Foreign Key Violation because replace_into() wants to delete the record first.
                    Err(diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::ForeignKeyViolation, _)) => {
                        diesel::update(users::table)
                            .filter(users::uuid.eq(&self.uuid))
                            .set(&*self)
                            .execute(conn)
                            .map_res("Error saving user")
                    }
                    Err(e) => Err(e.into()),
                }.map_res("Error saving user")
            }
            postgresql {
                diesel::insert_into(users::table)
                    .values(&*self)
                    .on_conflict(users::uuid)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving user")
            }
        }
    }

    /// Find-or-create by email, reactivating a soft-deleted row when one
    /// exists. Two concurrent callbacks for the same new address race on the
    /// unique email index; the loser retries its lookup and both resolve to
    /// the same row.
    pub async fn find_or_create_by_email(
        email: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
        conn: &DbConn,
    ) -> ApiResult<Self> {
        let email = email.trim().to_lowercase();

        if let Some(mut user) = Self::find_by_email_any(&email, conn).await {
            let reactivate = user.deleted_at.is_some();
            if reactivate {
                info!("Reactivating soft-deleted user {}", user.uuid);
                user.deleted_at = None;
            }
            if user.merge_profile_names(first_name, last_name) || reactivate {
                user.save(conn).await?;
            }
            return Ok(user);
        }

        let mut user = User::new(&email);
        user.merge_profile_names(first_name, last_name);
        match user.insert(conn).await {
            Ok(()) => Ok(user),
            // Lost the unique-index race, the row exists now.
            Err(_) => match Self::find_by_email_any(&email, conn).await {
                Some(user) => Ok(user),
                None => err!("Failed to create user", format!("email {email}")),
            },
        }
    }

    async fn insert(&self, conn: &DbConn) -> EmptyResult {
        db_run! {conn: {
            diesel::insert_into(users::table)
                .values(&*self)
                .execute(conn)
                .map_res("Error creating user")
        }}
    }

    pub async fn touch_login_web(&mut self, conn: &DbConn) -> EmptyResult {
        self.last_login_web_at = Some(Utc::now().naive_utc());
        self.save(conn).await
    }

    pub async fn touch_login_app(&mut self, conn: &DbConn) -> EmptyResult {
        self.last_login_app_at = Some(Utc::now().naive_utc());
        self.save(conn).await
    }

    /// Soft-deleted users are invisible to every read path except
    /// [`User::find_or_create_by_email`], which reactivates them.
    pub async fn find_by_uuid(uuid: &UserId, conn: &DbConn) -> Option<Self> {
        db_run! {conn: {
            users::table
                .filter(users::uuid.eq(uuid))
                .filter(users::deleted_at.is_null())
                .first::<Self>(conn)
                .ok()
        }}
    }

    async fn find_by_email_any(email: &str, conn: &DbConn) -> Option<Self> {
        let lower_email = email.trim().to_lowercase();
        db_run! {conn: {
            users::table
                .filter(users::email.eq(lower_email))
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
pub struct UserId(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_normalizes_email() {
        let user = User::new("  Someone@Example.COM ");
        assert_eq!(user.email, "someone@example.com");
        assert!(user.deleted_at.is_none());
        assert!(!user.is_admin);
    }

    #[test]
    fn test_merge_profile_names_only_fills_missing() {
        let mut user = User::new("a@b.c");
        assert!(user.merge_profile_names(Some("Ada"), None));
        assert_eq!(user.first_name.as_deref(), Some("Ada"));

        // A second profile must not overwrite what we already have.
        assert!(user.merge_profile_names(Some("Grace"), Some("Hopper")));
        assert_eq!(user.first_name.as_deref(), Some("Ada"));
        assert_eq!(user.last_name.as_deref(), Some("Hopper"));

        // Blank names never count as data.
        let mut user = User::new("a@b.c");
        assert!(!user.merge_profile_names(Some("  "), None));
        assert!(user.first_name.is_none());
    }
}
