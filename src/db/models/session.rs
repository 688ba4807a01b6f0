use chrono::{NaiveDateTime, TimeDelta, Utc};
use core::fmt;
use derive_more::{AsRef, Deref, Display, From};
use diesel_derive_newtype::DieselNewType;

use macros::UuidFromParam;

use super::{DeviceId, UserId};
use crate::auth::{self, AuthMethod};
use crate::crypto;
use crate::db::schema::sessions;
use crate::CONFIG;

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = sessions)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct Session {
    pub uuid: SessionId,
    pub user_uuid: UserId,
    pub device_uuid: Option<DeviceId>,

    // Only a peppered digest of the refresh token is ever stored. All
    // rotations of one session share the family id; a token carrying the
    // right session id but a foreign family is treated as theft.
    pub refresh_token_hash: String,
    pub refresh_token_family: String,

    pub auth_method: String,
    pub remote_ip: Option<String>,
    pub user_agent: Option<String>,

    pub expires_at: NaiveDateTime,
    pub last_used_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub revoke_reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevokeReason {
    NewSession,
    Expired,
    RotationReuse,
    Logout,
    LogoutAll,
    AdminRevoked,
}

impl RevokeReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RevokeReason::NewSession => "new_session",
            RevokeReason::Expired => "expired",
            RevokeReason::RotationReuse => "rotation_reuse",
            RevokeReason::Logout => "logout",
            RevokeReason::LogoutAll => "logout_all",
            RevokeReason::AdminRevoked => "admin_revoked",
        }
    }
}

impl fmt::Display for RevokeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision of the rotation state machine, taken while the session row is
/// locked. Everything except `Rotate` rejects the presented token; the
/// variants differ in which rows get revoked before rejecting.
#[derive(Debug, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Session was revoked earlier; reject without side effects.
    Revoked,
    /// Session passed its absolute expiry; revoke it with reason `expired`.
    Expired,
    /// Family id does not match: the token was minted for another lineage.
    /// Revoke every live session on the device.
    FamilyMismatch,
    /// Family matches but the hash is stale: replay of an already-rotated
    /// token. Revoke this session.
    ReusedToken,
    /// Valid current token, rotate it.
    Rotate,
}

pub fn classify_rotation(
    revoked_at: Option<NaiveDateTime>,
    expires_at: NaiveDateTime,
    stored_family: &str,
    stored_hash: &str,
    presented_family: &str,
    presented_hash: &str,
    now: NaiveDateTime,
) -> RotationOutcome {
    if revoked_at.is_some() {
        return RotationOutcome::Revoked;
    }
    if expires_at <= now {
        return RotationOutcome::Expired;
    }
    if !crypto::ct_eq(stored_family, presented_family) {
        return RotationOutcome::FamilyMismatch;
    }
    if !crypto::ct_eq(stored_hash, presented_hash) {
        return RotationOutcome::ReusedToken;
    }
    RotationOutcome::Rotate
}

/// Local methods
impl Session {
    fn new(
        user_uuid: UserId,
        device_uuid: Option<DeviceId>,
        auth_method: AuthMethod,
        remote_ip: Option<String>,
        user_agent: Option<String>,
        refresh_token_family: String,
    ) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid: SessionId(crate::util::get_uuid()),
            user_uuid,
            device_uuid,
            refresh_token_hash: String::new(),
            refresh_token_family,
            auth_method: auth_method.to_string(),
            remote_ip,
            user_agent,
            expires_at: now + TimeDelta::seconds(CONFIG.refresh_token_ttl()),
            last_used_at: now,
            created_at: now,
            revoked_at: None,
            revoke_reason: None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

use crate::api::{ApiResult, EmptyResult};
use crate::db::{DbConn, DbPool};
use crate::error::{Error, MapResult};

// Applies the rotation decision inside the per-backend transactions, with the
// session row locked. Expanded once per database backend.
macro_rules! rotation_tx {
    ($conn:ident, $loaded:expr, $sid:expr, $family:expr, $presented:expr, $new_hash:expr, $ip:expr, $ua:expr, $now:expr) => {{
        let Some(mut session) = $loaded else {
            return Err(Error::new("Invalid refresh token", "Refresh token session does not exist").with_code(401));
        };
        match classify_rotation(
            session.revoked_at,
            session.expires_at,
            &session.refresh_token_family,
            &session.refresh_token_hash,
            $family,
            $presented,
            $now,
        ) {
            RotationOutcome::Revoked => {
                warn!("Rotation attempt on revoked session {}", $sid);
                Err(Error::new("Invalid refresh token", "Session is revoked").with_code(401))
            }
            RotationOutcome::Expired => {
                diesel::update(sessions::table
                    .filter(sessions::uuid.eq($sid))
                    .filter(sessions::revoked_at.is_null()))
                    .set((sessions::revoked_at.eq($now), sessions::revoke_reason.eq(RevokeReason::Expired.as_str())))
                    .execute($conn)?;
                Err(Error::new("Invalid refresh token", "Session is expired").with_code(401))
            }
            RotationOutcome::FamilyMismatch => {
                warn!("SECURITY: refresh token family mismatch on session {}, revoking device sessions", $sid);
                match &session.device_uuid {
                    Some(device_uuid) => {
                        diesel::update(sessions::table
                            .filter(sessions::device_uuid.eq(device_uuid))
                            .filter(sessions::revoked_at.is_null()))
                            .set((sessions::revoked_at.eq($now), sessions::revoke_reason.eq(RevokeReason::RotationReuse.as_str())))
                            .execute($conn)?;
                    }
                    None => {
                        diesel::update(sessions::table
                            .filter(sessions::uuid.eq($sid))
                            .filter(sessions::revoked_at.is_null()))
                            .set((sessions::revoked_at.eq($now), sessions::revoke_reason.eq(RevokeReason::RotationReuse.as_str())))
                            .execute($conn)?;
                    }
                }
                Err(Error::new("Invalid refresh token", "Refresh token family mismatch").with_code(401))
            }
            RotationOutcome::ReusedToken => {
                warn!("SECURITY: reuse of a rotated refresh token on session {}, revoking it", $sid);
                diesel::update(sessions::table
                    .filter(sessions::uuid.eq($sid))
                    .filter(sessions::revoked_at.is_null()))
                    .set((sessions::revoked_at.eq($now), sessions::revoke_reason.eq(RevokeReason::RotationReuse.as_str())))
                    .execute($conn)?;
                Err(Error::new("Invalid refresh token", "Rotated refresh token was presented again").with_code(401))
            }
            RotationOutcome::Rotate => {
                diesel::update(sessions::table.filter(sessions::uuid.eq($sid)))
                    .set((
                        sessions::refresh_token_hash.eq($new_hash),
                        sessions::last_used_at.eq($now),
                        sessions::remote_ip.eq($ip),
                        sessions::user_agent.eq($ua),
                    ))
                    .execute($conn)?;
                session.refresh_token_hash = $new_hash.to_string();
                session.last_used_at = $now;
                session.remote_ip = $ip.map(|v: &str| v.to_string());
                session.user_agent = $ua.map(|v: &str| v.to_string());
                Ok(session)
            }
        }
    }};
}

/// Database methods
impl Session {
    /// Creates a session for `(user, device)`, atomically revoking any prior
    /// live session of that pair. Returns the session and the only copy of
    /// its refresh token; the store keeps the peppered hash.
    pub async fn create(
        user_uuid: &UserId,
        device_uuid: Option<&DeviceId>,
        auth_method: AuthMethod,
        remote_ip: Option<String>,
        user_agent: Option<String>,
        conn: &DbConn,
    ) -> ApiResult<(Session, String)> {
        let mut session = Session::new(
            user_uuid.clone(),
            device_uuid.cloned(),
            auth_method,
            remote_ip,
            user_agent,
            crate::util::get_uuid(),
        );
        let refresh_token = auth::encode_refresh_token(&session.uuid, &session.refresh_token_family);
        session.refresh_token_hash = auth::hash_refresh_token(&refresh_token);

        let now = session.created_at;
        let s = &session;
        let res: EmptyResult = db_run! { conn:
            sqlite {
                conn.immediate_transaction(|conn| {
                    if let Some(device_uuid) = &s.device_uuid {
                        diesel::update(sessions::table
                            .filter(sessions::user_uuid.eq(&s.user_uuid))
                            .filter(sessions::device_uuid.eq(device_uuid))
                            .filter(sessions::revoked_at.is_null()))
                            .set((sessions::revoked_at.eq(now), sessions::revoke_reason.eq(RevokeReason::NewSession.as_str())))
                            .execute(conn)?;
                    }
                    diesel::insert_into(sessions::table).values(s).execute(conn)?;
                    Ok(())
                })
            }
            mysql, postgresql {
                conn.transaction(|conn| {
                    if let Some(device_uuid) = &s.device_uuid {
                        diesel::update(sessions::table
                            .filter(sessions::user_uuid.eq(&s.user_uuid))
                            .filter(sessions::device_uuid.eq(device_uuid))
                            .filter(sessions::revoked_at.is_null()))
                            .set((sessions::revoked_at.eq(now), sessions::revoke_reason.eq(RevokeReason::NewSession.as_str())))
                            .execute(conn)?;
                    }
                    diesel::insert_into(sessions::table).values(s).execute(conn)?;
                    Ok(())
                })
            }
        };
        res.map_res("Error creating session")?;

        Ok((session, refresh_token))
    }

    /// Refresh-token rotation. The stored hash is observed and rewritten
    /// under a row lock, so two racing rotations of the same token resolve to
    /// exactly one winner; the loser revokes the session as reuse.
    pub async fn rotate(
        presented_token: &str,
        remote_ip: Option<String>,
        user_agent: Option<String>,
        conn: &DbConn,
    ) -> ApiResult<(Session, String)> {
        let (sid, family) = auth::decode_refresh_token(presented_token)?;
        let presented_hash = auth::hash_refresh_token(presented_token);

        // Pre-mint the replacement; it only becomes valid if the transaction
        // commits the new hash.
        let new_token = auth::encode_refresh_token(&sid, &family);
        let new_hash = auth::hash_refresh_token(&new_token);

        let now = Utc::now().naive_utc();
        let sid_ref = &sid;
        let family_ref = family.as_str();
        let presented_ref = presented_hash.as_str();
        let new_hash_ref = new_hash.as_str();
        let ip_ref = remote_ip.as_deref();
        let ua_ref = user_agent.as_deref();

        let res: ApiResult<Session> = db_run! { conn:
            sqlite {
                // SQLite has no row locks; an immediate transaction takes the
                // write lock up front, which serializes racing rotations.
                conn.immediate_transaction(|conn| {
                    let loaded = sessions::table
                        .filter(sessions::uuid.eq(sid_ref))
                        .first::<Session>(conn)
                        .optional()?;
                    rotation_tx!(conn, loaded, sid_ref, family_ref, presented_ref, new_hash_ref, ip_ref, ua_ref, now)
                })
            }
            mysql, postgresql {
                conn.transaction(|conn| {
                    let loaded = sessions::table
                        .filter(sessions::uuid.eq(sid_ref))
                        .for_update()
                        .first::<Session>(conn)
                        .optional()?;
                    rotation_tx!(conn, loaded, sid_ref, family_ref, presented_ref, new_hash_ref, ip_ref, ua_ref, now)
                })
            }
        };

        Ok((res?, new_token))
    }

    /// Idempotent; a second revoke never changes the recorded reason.
    pub async fn revoke(uuid: &SessionId, reason: RevokeReason, conn: &DbConn) -> EmptyResult {
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(sessions::table
                .filter(sessions::uuid.eq(uuid))
                .filter(sessions::revoked_at.is_null()))
                .set((sessions::revoked_at.eq(now), sessions::revoke_reason.eq(reason.as_str())))
                .execute(conn)
                .map_res("Error revoking session")
        }}
    }

    pub async fn revoke_by_user(user_uuid: &UserId, reason: RevokeReason, conn: &DbConn) -> ApiResult<usize> {
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(sessions::table
                .filter(sessions::user_uuid.eq(user_uuid))
                .filter(sessions::revoked_at.is_null()))
                .set((sessions::revoked_at.eq(now), sessions::revoke_reason.eq(reason.as_str())))
                .execute(conn)
                .map_res("Error revoking user sessions")
        }}
    }

    pub async fn revoke_by_device(device_uuid: &DeviceId, reason: RevokeReason, conn: &DbConn) -> EmptyResult {
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(sessions::table
                .filter(sessions::device_uuid.eq(device_uuid))
                .filter(sessions::revoked_at.is_null()))
                .set((sessions::revoked_at.eq(now), sessions::revoke_reason.eq(reason.as_str())))
                .execute(conn)
                .map_res("Error revoking device sessions")
        }}
    }

    /// Returns the session iff it exists, is not revoked and not past its
    /// expiry, updating `last_used_at` on the way. An expired session is
    /// revoked with reason `expired` as a side effect.
    pub async fn find_valid(uuid: &SessionId, conn: &DbConn) -> Option<Self> {
        let mut session = Self::find_by_uuid(uuid, conn).await?;
        if session.is_revoked() {
            return None;
        }

        let now = Utc::now().naive_utc();
        if session.expires_at <= now {
            if let Err(e) = Self::revoke(uuid, RevokeReason::Expired, conn).await {
                warn!("Failed to revoke expired session {uuid}: {e:#?}");
            }
            return None;
        }

        session.last_used_at = now;
        let res: EmptyResult = db_run! { conn: {
            diesel::update(sessions::table.filter(sessions::uuid.eq(uuid)))
                .set(sessions::last_used_at.eq(now))
                .execute(conn)
                .map_res("Error updating session usage")
        }};
        if let Err(e) = res {
            warn!("Failed to update last_used_at of session {uuid}: {e:#?}");
        }

        Some(session)
    }

    pub async fn find_by_uuid(uuid: &SessionId, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            sessions::table
                .filter(sessions::uuid.eq(uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Lazily revokes sessions past their expiry, then deletes the ones that
    /// are both expired and revoked.
    pub async fn purge_expired(pool: DbPool) -> EmptyResult {
        debug!("Purging expired sessions");
        let conn = match pool.get().await {
            Ok(conn) => conn,
            Err(_) => err!("Failed to get DB connection while purging sessions"),
        };

        let now = Utc::now().naive_utc();
        let result: EmptyResult = db_run! { conn: {
            let revoke_result: Result<(), Error> = diesel::update(sessions::table
                .filter(sessions::expires_at.le(now))
                .filter(sessions::revoked_at.is_null()))
                .set((sessions::revoked_at.eq(now), sessions::revoke_reason.eq(RevokeReason::Expired.as_str())))
                .execute(conn)
                .map_res("Error revoking expired sessions");
            revoke_result?;

            diesel::delete(sessions::table
                .filter(sessions::expires_at.le(now))
                .filter(sessions::revoked_at.is_not_null()))
                .execute(conn)
                .map_res("Error purging expired sessions")
        }};
        result
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
pub struct SessionId(String);

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(offset_secs: i64) -> NaiveDateTime {
        chrono::DateTime::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap().naive_utc()
    }

    #[test]
    fn test_classify_revoked_wins_over_everything() {
        // A revoked session rejects even a perfectly matching token.
        let out = classify_rotation(Some(ts(-10)), ts(1000), "fam", "hash", "fam", "hash", ts(0));
        assert_eq!(out, RotationOutcome::Revoked);
    }

    #[test]
    fn test_classify_expired() {
        let out = classify_rotation(None, ts(0), "fam", "hash", "fam", "hash", ts(0));
        assert_eq!(out, RotationOutcome::Expired);
        let out = classify_rotation(None, ts(-1), "fam", "hash", "fam", "hash", ts(0));
        assert_eq!(out, RotationOutcome::Expired);
    }

    #[test]
    fn test_classify_family_mismatch_beats_hash_check() {
        // Wrong family is theft, even when the hash happens to match.
        let out = classify_rotation(None, ts(1000), "fam", "hash", "other", "hash", ts(0));
        assert_eq!(out, RotationOutcome::FamilyMismatch);
    }

    #[test]
    fn test_classify_reused_token() {
        let out = classify_rotation(None, ts(1000), "fam", "current-hash", "fam", "stale-hash", ts(0));
        assert_eq!(out, RotationOutcome::ReusedToken);
    }

    #[test]
    fn test_classify_rotate() {
        let out = classify_rotation(None, ts(1000), "fam", "hash", "fam", "hash", ts(0));
        assert_eq!(out, RotationOutcome::Rotate);
    }

    #[test]
    fn test_revoke_reason_tags() {
        assert_eq!(RevokeReason::NewSession.as_str(), "new_session");
        assert_eq!(RevokeReason::RotationReuse.as_str(), "rotation_reuse");
        assert_eq!(RevokeReason::Expired.to_string(), "expired");
    }
}
