use rocket::{serde::json::Json, Route};

use crate::{
    api::JsonResult,
    auth::{AuthTokens, ClientHeaders, Headers},
    db::{
        models::{RevokeReason, Session},
        DbConn,
    },
};

pub fn routes() -> Vec<Route> {
    routes![refresh, logout, logout_all]
}

#[derive(Debug, Deserialize)]
struct RefreshData {
    refresh_token: String,
}

#[post("/refresh", data = "<data>")]
async fn refresh(data: Json<RefreshData>, client_headers: ClientHeaders, conn: DbConn) -> JsonResult {
    let presented = data.into_inner().refresh_token;

    let (session, refresh_token) = Session::rotate(
        &presented,
        Some(client_headers.ip.ip.to_string()),
        client_headers.user_agent.clone(),
        &conn,
    )
    .await?;
    let tokens = AuthTokens::new(&session, refresh_token);

    Ok(Json(json!({
        "access_token": tokens.access_token,
        "expires_in": tokens.expires_in,
        "token_type": "Bearer",
        "refresh_token": tokens.refresh_token,
    })))
}

#[post("/logout")]
async fn logout(headers: Headers, conn: DbConn) -> JsonResult {
    Session::revoke(&headers.session.uuid, RevokeReason::Logout, &conn).await?;
    info!("User {} logged out session {} from {}", headers.user.email, headers.session.uuid, headers.ip.ip);

    Ok(Json(json!({ "success": true })))
}

#[post("/logout-all")]
async fn logout_all(headers: Headers, conn: DbConn) -> JsonResult {
    let revoked = Session::revoke_by_user(&headers.user.uuid, RevokeReason::LogoutAll, &conn).await?;
    info!("User {} revoked {revoked} session(s) from {}", headers.user.email, headers.ip.ip);

    Ok(Json(json!({
        "success": true,
        "sessionsRevoked": revoked,
    })))
}
