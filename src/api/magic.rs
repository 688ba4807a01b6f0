use email_address::EmailAddress;
use rocket::{serde::json::Json, Route, State};
use serde_json::Value;

use crate::{
    api::{is_valid_redirect_uri, JsonResult},
    auth::{AuthMethod, AuthTokens, ClientHeaders},
    broker::IdentityBroker,
    db::{
        models::{AuthCode, Device, DeviceId, DeviceType, Session, User},
        DbConn,
    },
    util, CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![request_code, verify_code]
}

#[derive(Debug, Deserialize)]
struct MagicAuthData {
    email: String,
}

#[post("/magic-auth", data = "<data>")]
async fn request_code(data: Json<MagicAuthData>, broker: &State<Box<dyn IdentityBroker>>) -> JsonResult {
    let email = data.into_inner().email.trim().to_lowercase();
    if !EmailAddress::is_valid(&email) {
        err_oauth!("invalid_email", "Malformed email address")
    }

    // The broker creates and emails the code, and owns rate limiting. The
    // response never reveals whether the address is known.
    broker.create_magic_auth(&email).await?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct MagicVerifyData {
    email: String,
    code: String,
    client_id: String,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    redirect_uri: Option<String>,
    device_id: Option<String>,
    device_platform: Option<String>,
}

#[post("/magic-auth/verify", data = "<data>")]
async fn verify_code(
    data: Json<MagicVerifyData>,
    client_headers: ClientHeaders,
    broker: &State<Box<dyn IdentityBroker>>,
    conn: DbConn,
) -> JsonResult {
    let data = data.into_inner();
    let email = data.email.trim().to_lowercase();

    if !EmailAddress::is_valid(&email) {
        err_oauth!("invalid_request", "Malformed email address")
    }
    if data.code.len() != 6 || !data.code.bytes().all(|b| b.is_ascii_digit()) {
        err_oauth!("invalid_request", "The code must be 6 digits")
    }
    if !CONFIG.is_allowed_client(&data.client_id) {
        err_oauth!("invalid_request", "Unknown client_id")
    }

    let magic_user = match broker
        .authenticate_with_magic_auth(
            &email,
            &data.code,
            Some(&client_headers.ip.ip.to_string()),
            client_headers.user_agent.as_deref(),
        )
        .await
    {
        Ok(user) => user,
        Err(e) if e.get_code() == 502 => return Err(e),
        Err(e) => return Err(e.with_oauth_code("invalid_code")),
    };

    let mut user = User::find_or_create_by_email(
        &magic_user.email,
        magic_user.first_name.as_deref(),
        magic_user.last_name.as_deref(),
        &conn,
    )
    .await?;

    // Native clients get an authorization code to redeem at /oauth/token with
    // their PKCE verifier; web clients get a session straight away.
    if CONFIG.is_native_client(&data.client_id) {
        let Some(code_challenge) = data.code_challenge else {
            err_oauth!("invalid_request", "code_challenge is required for this client")
        };
        if data.code_challenge_method.as_deref().unwrap_or("S256") != "S256" {
            err_oauth!("invalid_request", "code_challenge_method must be S256")
        }
        let Some(redirect_uri) = data.redirect_uri else {
            err_oauth!("invalid_request", "redirect_uri is required for this client")
        };
        if !is_valid_redirect_uri(&redirect_uri) {
            err_oauth!("invalid_request", "redirect_uri is not accepted for this deployment")
        }

        let auth_code = AuthCode::new(
            user.uuid.clone(),
            data.client_id,
            redirect_uri,
            code_challenge,
            None,
            AuthMethod::MagicLink,
            data.device_id.map(DeviceId::from),
            data.device_platform,
        );
        auth_code.save(&conn).await?;

        return Ok(Json(json!({ "code": auth_code.uuid })));
    }

    let device = match &data.device_id {
        Some(device_id) => {
            let atype = data.device_platform.as_deref().map(DeviceType::from_platform).unwrap_or(DeviceType::Web);
            Some(
                Device::upsert(
                    &DeviceId::from(device_id.as_str()),
                    &user.uuid,
                    atype as i32,
                    data.device_platform.clone(),
                    None,
                    None,
                    &conn,
                )
                .await?,
            )
        }
        None => None,
    };

    let (session, refresh_token) = Session::create(
        &user.uuid,
        device.as_ref().map(|d| &d.uuid),
        AuthMethod::MagicLink,
        Some(client_headers.ip.ip.to_string()),
        client_headers.user_agent.clone(),
        &conn,
    )
    .await?;
    let tokens = AuthTokens::new(&session, refresh_token);

    match device.as_ref().map(|d| d.is_web()) {
        Some(false) => user.touch_login_app(&conn).await?,
        _ => user.touch_login_web(&conn).await?,
    }

    info!("User {} logged in with a one-time email code", user.email);
    Ok(Json(magic_token_response(&tokens)))
}

fn magic_token_response(tokens: &AuthTokens) -> Value {
    let expires_at = chrono::Utc::now().naive_utc() + chrono::TimeDelta::seconds(tokens.expires_in);
    json!({
        "access_token": tokens.access_token,
        "refresh_token": tokens.refresh_token,
        "expires_at": util::format_datetime(&expires_at),
    })
}
