use email_address::EmailAddress;
use rocket::{form::Form, response::Redirect, serde::json::Json, Route, State};
use serde_json::Value;
use url::Url;

use crate::{
    api::{is_valid_redirect_uri, ApiResult, JsonResult},
    auth::{self, AuthMethod, AuthTokens, ClientHeaders, StateClaims},
    broker::{BrokerAuthorizeRequest, BrokerProfile, IdentityBroker},
    crypto,
    db::{
        models::{AuthCode, AuthCodeId, AuthConnection, ConnectionId, Device, DeviceId, DeviceType, Identity, Session, User},
        DbConn,
    },
    error::Error,
    sso::{self, SsoResolution},
    CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![authorize, callback, token, jwks]
}

#[allow(clippy::too_many_arguments)]
#[get("/authorize?<response_type>&<client_id>&<redirect_uri>&<code_challenge>&<code_challenge_method>&<state>&<login_hint>&<connection_id>&<provider>&<device_id>&<device_platform>")]
async fn authorize(
    response_type: Option<String>,
    client_id: Option<String>,
    redirect_uri: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    state: Option<String>,
    login_hint: Option<String>,
    connection_id: Option<String>,
    provider: Option<String>,
    device_id: Option<String>,
    device_platform: Option<String>,
    broker: &State<Box<dyn IdentityBroker>>,
    conn: DbConn,
) -> ApiResult<Redirect> {
    if response_type.as_deref() != Some("code") {
        err_oauth!("invalid_request", "response_type must be `code`")
    }
    let Some(client_id) = client_id else {
        err_oauth!("invalid_request", "client_id cannot be blank")
    };
    if !CONFIG.is_allowed_client(&client_id) {
        err_oauth!("unauthorized_client", "Unknown client_id")
    }
    let Some(redirect_uri) = redirect_uri else {
        err_oauth!("invalid_request", "redirect_uri cannot be blank")
    };
    if !is_valid_redirect_uri(&redirect_uri) {
        err_oauth!("invalid_redirect_uri", "redirect_uri is not accepted for this deployment")
    }
    let Some(code_challenge) = code_challenge else {
        err_oauth!("invalid_request", "code_challenge cannot be blank")
    };
    if code_challenge_method.as_deref() != Some("S256") {
        err_oauth!("invalid_request", "code_challenge_method must be S256")
    }
    let Some(state) = state else {
        err_oauth!("invalid_request", "state cannot be blank")
    };

    // Pick the broker connection: enterprise routing by login hint first,
    // then an explicit connection or provider, then the configured default.
    let login_hint_email = login_hint.clone().filter(|hint| EmailAddress::is_valid(hint));
    let (auth_method, broker_connection, broker_provider) =
        if let (Some(email), None, None) = (&login_hint_email, &connection_id, &provider) {
            match sso::resolve(email, &conn).await {
                SsoResolution::Enterprise {
                    connection,
                    domain,
                } => {
                    info!("Routing login hint to the enterprise connection of {domain}");
                    (AuthMethod::Sso, Some(connection.broker_connection_id), None)
                }
                SsoResolution::NonEnterprise => default_provider_route()?,
            }
        } else if let Some(connection_id) = &connection_id {
            match AuthConnection::find_enabled_by_uuid(&ConnectionId::from(connection_id.as_str()), &conn).await {
                Some(connection) => (
                    AuthMethod::from_tag(&connection.protocol).unwrap_or(AuthMethod::Sso),
                    Some(connection.broker_connection_id),
                    None,
                ),
                None => err_oauth!("invalid_request", "Unknown or disabled connection_id"),
            }
        } else if let Some(provider) = &provider {
            match AuthMethod::from_provider_param(provider).and_then(|m| m.broker_provider().map(|bp| (m, bp))) {
                Some((method, broker_provider)) => (method, None, Some(broker_provider.to_string())),
                None => err_oauth!("invalid_request", "Unknown provider"),
            }
        } else {
            default_provider_route()?
        };

    let claims = StateClaims {
        redirect_uri,
        code_challenge,
        client_id,
        auth_method,
        connection_id: broker_connection.clone(),
        device_id,
        device_platform,
        nonce: state,
    };
    let signed_state = auth::sign_state(&claims)?;

    let url = broker.authorization_url(&BrokerAuthorizeRequest {
        connection_id: broker_connection,
        provider: broker_provider,
        login_hint,
        state: signed_state,
        redirect_uri: format!("{}/oauth/callback", CONFIG.domain()),
        code_challenge: None,
        code_challenge_method: None,
    })?;

    Ok(Redirect::found(url.to_string()))
}

fn default_provider_route() -> ApiResult<(AuthMethod, Option<String>, Option<String>)> {
    let configured = CONFIG.default_provider();
    match configured.as_deref().and_then(AuthMethod::from_provider_param) {
        Some(method) => match method.broker_provider() {
            Some(broker_provider) => Ok((method, None, Some(broker_provider.to_string()))),
            None => Err(Error::new("No social providers are configured", "Default provider has no broker mapping")
                .with_oauth_code("no_providers_configured")),
        },
        None => Err(Error::new("No social providers are configured", "DEFAULT_PROVIDER is not set")
            .with_oauth_code("no_providers_configured")),
    }
}

#[get("/callback?<code>&<state>&<error>")]
async fn callback(
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    broker: &State<Box<dyn IdentityBroker>>,
    conn: DbConn,
) -> Redirect {
    // Without a verified state there is no trustworthy client redirect, so
    // tampering lands on the web login page instead.
    let Some(state) = state else {
        return login_error_redirect("invalid_state");
    };
    let claims = match auth::verify_state(&state) {
        Ok(claims) => claims,
        Err(_) => {
            warn!("SECURITY: /oauth/callback received a tampered or foreign state parameter");
            return login_error_redirect("invalid_state");
        }
    };

    if let Some(error) = error {
        info!("Broker denied the authorization: {error}");
        return client_error_redirect(&claims, "access_denied");
    }
    let Some(code) = code else {
        return client_error_redirect(&claims, "access_denied");
    };

    let profile = match broker.exchange_code(&code).await {
        Ok(profile) => profile,
        Err(e) => {
            error!("Failed to exchange the broker code: {e:#?}");
            return client_error_redirect(&claims, "access_denied");
        }
    };

    match issue_auth_code(&claims, profile, &conn).await {
        Ok(code) => {
            let Ok(mut url) = Url::parse(&claims.redirect_uri) else {
                return login_error_redirect("invalid_state");
            };
            // The caller's own `state` round-trips unchanged, preserving its
            // CSRF token.
            url.query_pairs_mut().append_pair("code", &code).append_pair("state", &claims.nonce);
            Redirect::found(url.to_string())
        }
        Err(e) => {
            error!("Failed to complete the brokered login: {e:#?}");
            client_error_redirect(&claims, "access_denied")
        }
    }
}

async fn issue_auth_code(claims: &StateClaims, profile: BrokerProfile, conn: &DbConn) -> ApiResult<String> {
    debug!(
        "Completing a login through connection {:?} ({})",
        profile.connection_id,
        profile.connection_type
    );
    let mut user = User::find_or_create_by_email(
        &profile.email,
        profile.first_name.as_deref(),
        profile.last_name.as_deref(),
        conn,
    )
    .await?;

    if user.organization.is_none() && profile.organization_id.is_some() {
        user.organization = profile.organization_id.clone();
        user.save(conn).await?;
    }

    let auth_method = if profile.connection_type.is_empty() {
        claims.auth_method
    } else {
        AuthMethod::from_connection_type(&profile.connection_type)
    };
    Identity::upsert(&user.uuid, auth_method, &profile.id, Some(&profile.email), Some(&profile.raw_attributes), conn)
        .await?;

    let auth_code = AuthCode::new(
        user.uuid.clone(),
        claims.client_id.clone(),
        claims.redirect_uri.clone(),
        claims.code_challenge.clone(),
        None,
        auth_method,
        claims.device_id.clone().map(DeviceId::from),
        claims.device_platform.clone(),
    );
    auth_code.save(conn).await?;

    Ok(auth_code.uuid.to_string())
}

fn login_error_redirect(error: &str) -> Redirect {
    Redirect::found(format!("{}/login?error={error}", CONFIG.web_app_url()))
}

fn client_error_redirect(claims: &StateClaims, error: &str) -> Redirect {
    match Url::parse(&claims.redirect_uri) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("error", error).append_pair("state", &claims.nonce);
            Redirect::found(url.to_string())
        }
        Err(_) => login_error_redirect(error),
    }
}

#[post("/token", data = "<data>")]
async fn token(data: Form<ConnectData>, client_headers: ClientHeaders, conn: DbConn) -> JsonResult {
    let data: ConnectData = data.into_inner();

    match data.grant_type.as_str() {
        "authorization_code" => {
            _check_is_some(&data.code, "code cannot be blank")?;
            _check_is_some(&data.redirect_uri, "redirect_uri cannot be blank")?;
            _check_is_some(&data.code_verifier, "code_verifier cannot be blank")?;

            _authorization_code_login(data, client_headers, conn).await
        }
        "refresh_token" => {
            _check_is_some(&data.refresh_token, "refresh_token cannot be blank")?;

            _refresh_login(data, client_headers, conn).await
        }
        t => err_oauth!("unsupported_grant_type", format!("Unsupported grant type {t}")),
    }
}

async fn _authorization_code_login(data: ConnectData, client_headers: ClientHeaders, conn: DbConn) -> JsonResult {
    let code = AuthCodeId::from(data.code.unwrap());
    let redirect_uri = data.redirect_uri.unwrap();
    let code_verifier = data.code_verifier.unwrap();

    let auth_code = AuthCode::consume(&code, &redirect_uri, &conn).await?;

    // The code is already consumed at this point; a failed verifier burns it.
    if !crypto::verify_code_challenge(&auth_code.code_challenge, &code_verifier) {
        err_code!("Invalid authorization code", "PKCE verification failed", 401)
    }

    let Some(mut user) = User::find_by_uuid(&auth_code.user_uuid, &conn).await else {
        err_code!("Invalid authorization code", "User of the authorization code no longer exists", 401)
    };

    let device = match &auth_code.device_uuid {
        Some(device_uuid) => {
            let atype =
                auth_code.device_platform.as_deref().map(DeviceType::from_platform).unwrap_or(DeviceType::Desktop);
            Some(
                Device::upsert(
                    device_uuid,
                    &user.uuid,
                    atype as i32,
                    auth_code.device_platform.clone(),
                    None,
                    None,
                    &conn,
                )
                .await?,
            )
        }
        None => None,
    };

    let auth_method = AuthMethod::from_tag(&auth_code.auth_method).unwrap_or(AuthMethod::Sso);
    let (session, refresh_token) = Session::create(
        &user.uuid,
        device.as_ref().map(|d| &d.uuid),
        auth_method,
        Some(client_headers.ip.ip.to_string()),
        client_headers.user_agent.clone(),
        &conn,
    )
    .await?;
    let tokens = AuthTokens::new(&session, refresh_token);

    if device.is_some() {
        user.touch_login_app(&conn).await?;
    } else {
        user.touch_login_web(&conn).await?;
    }

    info!("User {} obtained tokens via {auth_method}", user.email);
    Ok(Json(token_response(tokens)))
}

async fn _refresh_login(data: ConnectData, client_headers: ClientHeaders, conn: DbConn) -> JsonResult {
    let presented = data.refresh_token.unwrap();

    let (session, refresh_token) = Session::rotate(
        &presented,
        Some(client_headers.ip.ip.to_string()),
        client_headers.user_agent.clone(),
        &conn,
    )
    .await?;
    let tokens = AuthTokens::new(&session, refresh_token);

    Ok(Json(token_response(tokens)))
}

fn token_response(tokens: AuthTokens) -> Value {
    json!({
        "access_token": tokens.access_token,
        "expires_in": tokens.expires_in,
        "token_type": "Bearer",
        "refresh_token": tokens.refresh_token,
    })
}

fn _check_is_some<T>(value: &Option<T>, msg: &str) -> ApiResult<()> {
    if value.is_none() {
        err!(msg)
    }
    Ok(())
}

#[derive(Debug, Default, FromForm)]
struct ConnectData {
    grant_type: String, // authorization_code, refresh_token

    // Needed for grant_type="authorization_code"
    code: Option<String>,
    redirect_uri: Option<String>,
    code_verifier: Option<String>,

    // Needed for grant_type="refresh_token"
    refresh_token: Option<String>,

    #[allow(dead_code)]
    client_id: Option<String>,
}

#[get("/.well-known/jwks.json")]
fn jwks() -> Json<Value> {
    Json(auth::jwks())
}
