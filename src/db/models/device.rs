use chrono::{NaiveDateTime, Utc};
use core::fmt;
use derive_more::{AsRef, Deref, Display, From};
use diesel_derive_newtype::DieselNewType;

use macros::IdFromParam;

use super::UserId;
use crate::db::schema::devices;

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = devices)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct Device {
    pub uuid: DeviceId,
    pub user_uuid: UserId,

    pub atype: i32,
    pub platform: Option<String>,
    pub app_version: Option<String>,
    pub os_version: Option<String>,

    pub is_active: bool,
    pub last_active_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Local methods
impl Device {
    pub fn new(uuid: DeviceId, user_uuid: UserId, atype: i32) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid,
            user_uuid,
            atype,
            platform: None,
            app_version: None,
            os_version: None,
            is_active: true,
            last_active_at: now,
            revoked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_web(&self) -> bool {
        self.atype == DeviceType::Web as i32
    }
}

use crate::api::{ApiResult, EmptyResult};
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl Device {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                match diesel::replace_into(devices::table).values(&*self).execute(conn) {
                    Ok(_) => Ok(()),
                    // Record already exists and causes a Foreign Key Violation because replace_into() wants to delete the record first.
                    Err(diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::ForeignKeyViolation, _)) => {
                        diesel::update(devices::table)
                            .filter(devices::uuid.eq(&self.uuid))
                            .set(&*self)
                            .execute(conn)
                            .map_res("Error saving device")
                    }
                    Err(e) => Err(e.into()),
                }.map_res("Error saving device")
            }
            postgresql {
                diesel::insert_into(devices::table)
                    .values(&*self)
                    .on_conflict(devices::uuid)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving device")
            }
        }
    }

    /// Insert-or-refresh for a login. A device id presented by a different
    /// user than its current owner is re-bound to the new user with a clean
    /// slate; the previous owner's sessions on it die with the rebind.
    pub async fn upsert(
        uuid: &DeviceId,
        user_uuid: &UserId,
        atype: i32,
        platform: Option<String>,
        app_version: Option<String>,
        os_version: Option<String>,
        conn: &DbConn,
    ) -> ApiResult<Self> {
        let mut device = match Self::find_by_uuid(uuid, conn).await {
            Some(existing) if existing.user_uuid == *user_uuid => existing,
            Some(existing) => {
                info!("Device {uuid} changed owner, revoking sessions of user {}", existing.user_uuid);
                super::Session::revoke_by_device(uuid, super::RevokeReason::NewSession, conn).await?;
                Self::new(uuid.clone(), user_uuid.clone(), atype)
            }
            None => Self::new(uuid.clone(), user_uuid.clone(), atype),
        };

        device.atype = atype;
        if platform.is_some() {
            device.platform = platform;
        }
        if app_version.is_some() {
            device.app_version = app_version;
        }
        if os_version.is_some() {
            device.os_version = os_version;
        }
        device.is_active = true;
        device.revoked_at = None;
        device.last_active_at = Utc::now().naive_utc();
        device.save(conn).await?;

        Ok(device)
    }

    pub async fn find_by_uuid(uuid: &DeviceId, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            devices::table
                .filter(devices::uuid.eq(uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Web = 0,
    Desktop = 1,
    Xr = 2,
    Mobile = 3,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Web => write!(f, "web"),
            DeviceType::Desktop => write!(f, "desktop"),
            DeviceType::Xr => write!(f, "xr"),
            DeviceType::Mobile => write!(f, "mobile"),
        }
    }
}

impl DeviceType {
    /// Maps the `device_platform` strings the clients send to a device type.
    pub fn from_platform(platform: &str) -> DeviceType {
        match platform.to_lowercase().as_str() {
            "windows" | "macos" | "linux" => DeviceType::Desktop,
            "quest" | "visionos" | "hololens" | "xr" => DeviceType::Xr,
            "ios" | "android" => DeviceType::Mobile,
            _ => DeviceType::Web,
        }
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
pub struct DeviceId(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_from_platform() {
        assert_eq!(DeviceType::from_platform("Quest") as i32, DeviceType::Xr as i32);
        assert_eq!(DeviceType::from_platform("windows") as i32, DeviceType::Desktop as i32);
        assert_eq!(DeviceType::from_platform("iOS") as i32, DeviceType::Mobile as i32);
        assert_eq!(DeviceType::from_platform("anything-else") as i32, DeviceType::Web as i32);
        assert_eq!(DeviceType::from_platform("quest").to_string(), "xr");
    }
}
