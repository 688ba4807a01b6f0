//
// Browser-to-device handoff: the app opens the system browser, the browser
// signs in and turns its session into a short-lived code, the app polls for
// it and redeems it for tokens. The poll token never appears in the deep link
// or the code; it only shields polling from device-id guessing.
//
use rocket::{response::Redirect, serde::json::Json, Route, State};
use url::Url;

use crate::{
    api::JsonResult,
    auth::{AuthMethod, AuthTokens, ClientHeaders},
    broker::IdentityBroker,
    db::{
        models::{Device, DeviceId, DeviceType, HandoffCode, Identity, Session, User},
        DbConn,
    },
    util, CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![initiate, login_trampoline, browser_callback, poll, device_token]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateData {
    device_id: DeviceId,
}

#[post("/handoff/initiate", data = "<data>")]
async fn initiate(data: Json<InitiateData>, conn: DbConn) -> JsonResult {
    let device_id = data.into_inner().device_id;

    // A stale pending code must never satisfy a poll that belongs to this
    // fresh attempt.
    HandoffCode::delete_unused_by_device(&device_id, &conn).await?;

    let poll_token = HandoffCode::mint_poll_token();

    let mut auth_url = match Url::parse(&format!("{}/login", CONFIG.domain())) {
        Ok(url) => url,
        Err(e) => err!("Invalid DOMAIN configured", format!("{e}")),
    };
    auth_url
        .query_pairs_mut()
        .append_pair("device_id", &device_id)
        .append_pair("poll_token", &poll_token);

    Ok(Json(json!({
        "authUrl": auth_url.as_str(),
        "deviceId": device_id,
        "pollToken": poll_token,
    })))
}

/// Trampoline into the web sign-in UI, forcing a fresh login and carrying the
/// handoff context along.
#[get("/login?<device_id>&<poll_token>")]
fn login_trampoline(device_id: DeviceId, poll_token: String) -> Redirect {
    let mut url = match Url::parse(&format!("{}/login", CONFIG.web_app_url())) {
        Ok(url) => url,
        Err(_) => return Redirect::found(CONFIG.web_app_url()),
    };
    url.query_pairs_mut()
        .append_pair("device_id", &device_id)
        .append_pair("poll_token", &poll_token)
        .append_pair("prompt", "login");

    Redirect::found(url.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowserCallbackData {
    session_token: String,
    device_id: DeviceId,
    poll_token: String,
}

#[post("/callback", data = "<data>")]
async fn browser_callback(
    data: Json<BrowserCallbackData>,
    broker: &State<Box<dyn IdentityBroker>>,
    conn: DbConn,
) -> JsonResult {
    let data = data.into_inner();

    let profile = match broker.verify_session(&data.session_token).await {
        Ok(profile) => profile,
        Err(e) if e.get_code() == 502 => return Err(e),
        Err(e) => return Err(e.with_code(401).with_oauth_code("invalid_session")),
    };

    let user = User::find_or_create_by_email(
        &profile.email,
        profile.first_name.as_deref(),
        profile.last_name.as_deref(),
        &conn,
    )
    .await?;
    let auth_method = AuthMethod::from_connection_type(&profile.connection_type);
    Identity::upsert(&user.uuid, auth_method, &profile.id, Some(&profile.email), Some(&profile.raw_attributes), &conn)
        .await?;

    // Replaces any unused code of this device, bound to the poll token the
    // app received at initiation.
    let handoff = HandoffCode::new(user.uuid.clone(), data.device_id, data.poll_token, None);
    handoff.save_for_device(&conn).await?;

    let scheme = CONFIG.custom_uri_schemes_vec().into_iter().next().unwrap_or_else(|| "app".to_string());

    Ok(Json(json!({
        "code": handoff.code,
        "deepLink": format!("{scheme}://auth/callback?code={}", handoff.code),
        "expiresAt": util::format_datetime(&handoff.expires_at),
    })))
}

#[get("/handoff/poll?<device_id>&<poll_token>")]
async fn poll(device_id: Option<DeviceId>, poll_token: Option<String>, conn: DbConn) -> JsonResult {
    let (Some(device_id), Some(poll_token)) = (device_id, poll_token) else {
        err_oauth!("invalid_request", "device_id and poll_token are required")
    };

    // A wrong poll token answers exactly like "nothing pending yet".
    let response = match HandoffCode::find_pending(&device_id, &poll_token, &conn).await {
        None => json!({ "status": "pending" }),
        Some(code) if code.is_expired() => json!({ "status": "expired" }),
        Some(code) => json!({ "status": "ready", "code": code.code }),
    };

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct DeviceTokenData {
    code: String,
    platform: Option<String>,
}

#[post("/device-token", data = "<data>")]
async fn device_token(data: Json<DeviceTokenData>, client_headers: ClientHeaders, conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let Some(device_id) = client_headers.device_id.clone() else {
        err_oauth!("invalid_request", "X-Device-ID header is required")
    };

    let handoff = HandoffCode::consume(&data.code, &device_id, &conn).await?;

    let Some(mut user) = User::find_by_uuid(&handoff.user_uuid, &conn).await else {
        err_code!("Invalid handoff code", "User of the handoff code no longer exists", 401)
    };

    let atype = data.platform.as_deref().map(DeviceType::from_platform).unwrap_or(DeviceType::Desktop);
    let device = Device::upsert(&device_id, &user.uuid, atype as i32, data.platform, None, None, &conn).await?;

    let (session, refresh_token) = Session::create(
        &user.uuid,
        Some(&device.uuid),
        AuthMethod::Sso,
        Some(client_headers.ip.ip.to_string()),
        client_headers.user_agent.clone(),
        &conn,
    )
    .await?;
    let tokens = AuthTokens::new(&session, refresh_token);

    user.touch_login_app(&conn).await?;

    let expires_at = chrono::Utc::now().naive_utc() + chrono::TimeDelta::seconds(tokens.expires_in);
    info!("Device {} of user {} completed the browser handoff", device.uuid, user.email);

    Ok(Json(json!({
        "access_token": tokens.access_token,
        "refresh_token": tokens.refresh_token,
        "expires_at": util::format_datetime(&expires_at),
        "user": user.to_json(),
    })))
}
