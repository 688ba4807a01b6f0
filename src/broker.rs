//
// Identity broker adapter
//
// The broker performs the actual user authentication (federated OAuth,
// enterprise SSO, passwordless email codes); this service only consumes its
// REST API. Everything the orchestrators need is behind the trait so tests
// can run against a stub.
//
use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use url::Url;

use crate::{
    api::{ApiResult, EmptyResult},
    crypto,
    error::Error,
    CONFIG,
};

#[derive(Debug, Default)]
pub struct BrokerAuthorizeRequest {
    /// Exactly one of `connection_id` or `provider` is set.
    pub connection_id: Option<String>,
    pub provider: Option<String>,
    pub login_hint: Option<String>,
    pub state: String,
    pub redirect_uri: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BrokerProfile {
    pub id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default)]
    pub raw_attributes: Value,
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_type: String,
    pub organization_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BrokerProfileResponse {
    profile: BrokerProfile,
}

#[derive(Debug, Deserialize)]
pub struct BrokerMagicUser {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BrokerMagicResponse {
    user: BrokerMagicUser,
}

#[rocket::async_trait]
pub trait IdentityBroker: Send + Sync {
    /// External URL the user is redirected to for authentication.
    fn authorization_url(&self, req: &BrokerAuthorizeRequest) -> ApiResult<Url>;

    /// Exchanges the broker's post-login code for the user profile.
    async fn exchange_code(&self, code: &str) -> ApiResult<BrokerProfile>;

    /// Validates a browser session token issued by the broker (handoff flow).
    async fn verify_session(&self, session_token: &str) -> ApiResult<BrokerProfile>;

    /// Asks the broker to create and email a one-time code.
    async fn create_magic_auth(&self, email: &str) -> EmptyResult;

    /// Verifies a one-time email code.
    async fn authenticate_with_magic_auth(
        &self,
        email: &str,
        code: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> ApiResult<BrokerMagicUser>;
}

pub struct HttpBroker {
    client: Client,
    api_base: String,
    client_id: String,
}

impl HttpBroker {
    pub fn from_config() -> Result<Self, Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, header::HeaderValue::from_static("Gatewarden"));

        let mut auth_value = header::HeaderValue::from_str(&format!("Bearer {}", CONFIG.broker_api_key()))
            .map_err(|e| Error::new("Invalid broker API key", e.to_string()))?;
        auth_value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth_value);

        let client = Client::builder()
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(CONFIG.broker_timeout()))
            .build()?;

        Ok(Self {
            client,
            api_base: CONFIG.broker_api_base().trim_end_matches('/').to_string(),
            client_id: CONFIG.broker_client_id(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }
}

// A failed or timed-out broker call never mutates local state; it surfaces as
// a transient 502 the caller may retry.
fn upstream_err(e: reqwest::Error) -> Error {
    Error::from(e).with_msg("Identity broker unavailable").with_code(502)
}

async fn rejected_or_upstream(resp: reqwest::Response, usr_msg: &str, rejected_code: u16) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if status.is_client_error() {
        Error::new(usr_msg, format!("Broker rejected the request ({status}): {body}")).with_code(rejected_code)
    } else {
        Error::new("Identity broker unavailable", format!("Broker error ({status}): {body}")).with_code(502)
    }
}

#[rocket::async_trait]
impl IdentityBroker for HttpBroker {
    fn authorization_url(&self, req: &BrokerAuthorizeRequest) -> ApiResult<Url> {
        if req.connection_id.is_none() && req.provider.is_none() {
            err!("Neither connection nor provider was selected")
        }

        let mut url = match Url::parse(&self.endpoint("/sso/authorize")) {
            Ok(url) => url,
            Err(e) => err!("Invalid broker authorize URL", format!("{e}")),
        };

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", &req.redirect_uri);
            query.append_pair("state", &req.state);
            if let Some(connection_id) = &req.connection_id {
                query.append_pair("connection", connection_id);
            } else if let Some(provider) = &req.provider {
                query.append_pair("provider", provider);
            }
            if let Some(login_hint) = &req.login_hint {
                query.append_pair("login_hint", login_hint);
            }
            if let Some(code_challenge) = &req.code_challenge {
                query.append_pair("code_challenge", code_challenge);
                query.append_pair(
                    "code_challenge_method",
                    req.code_challenge_method.as_deref().unwrap_or("S256"),
                );
            }
        }

        Ok(url)
    }

    async fn exchange_code(&self, code: &str) -> ApiResult<BrokerProfile> {
        let resp = self
            .client
            .post(self.endpoint("/sso/token"))
            .json(&json!({
                "grant_type": "authorization_code",
                "client_id": self.client_id,
                "code": code,
            }))
            .send()
            .await
            .map_err(upstream_err)?;

        if !resp.status().is_success() {
            return Err(rejected_or_upstream(resp, "Code exchange rejected", 401).await);
        }

        let parsed: BrokerProfileResponse = resp.json().await.map_err(upstream_err)?;
        Ok(parsed.profile)
    }

    async fn verify_session(&self, session_token: &str) -> ApiResult<BrokerProfile> {
        let resp = self
            .client
            .post(self.endpoint("/sessions/verify"))
            .json(&json!({
                "client_id": self.client_id,
                "session_token": session_token,
            }))
            .send()
            .await
            .map_err(upstream_err)?;

        if !resp.status().is_success() {
            return Err(rejected_or_upstream(resp, "Invalid session", 401).await);
        }

        let parsed: BrokerProfileResponse = resp.json().await.map_err(upstream_err)?;
        Ok(parsed.profile)
    }

    async fn create_magic_auth(&self, email: &str) -> EmptyResult {
        let resp = self
            .client
            .post(self.endpoint("/magic-auth"))
            .json(&json!({
                "client_id": self.client_id,
                "email": email,
            }))
            .send()
            .await
            .map_err(upstream_err)?;

        // 429 included: the broker owns rate limiting, we stay generic.
        if resp.status().is_server_error() {
            return Err(rejected_or_upstream(resp, "Identity broker unavailable", 502).await);
        }
        if !resp.status().is_success() && resp.status() != StatusCode::TOO_MANY_REQUESTS {
            let status = resp.status();
            warn!("Broker rejected magic-auth creation ({status})");
        }
        Ok(())
    }

    async fn authenticate_with_magic_auth(
        &self,
        email: &str,
        code: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> ApiResult<BrokerMagicUser> {
        let resp = self
            .client
            .post(self.endpoint("/magic-auth/authenticate"))
            .json(&json!({
                "client_id": self.client_id,
                "email": email,
                "code": code,
                "ip_address": ip,
                "user_agent": user_agent,
            }))
            .send()
            .await
            .map_err(upstream_err)?;

        if !resp.status().is_success() {
            return Err(rejected_or_upstream(resp, "Invalid code", 400).await);
        }

        let parsed: BrokerMagicResponse = resp.json().await.map_err(upstream_err)?;
        Ok(parsed.user)
    }
}

//
// Webhook signatures: `t=<unix>,v1=<hex>`, HMAC-SHA256 over `t "." rawBody`.
//
const WEBHOOK_TOLERANCE_SECS: i64 = 300;

pub fn verify_webhook_signature(
    secret: &str,
    raw_body: &[u8],
    signature_header: &str,
    now: i64,
) -> Result<Value, Error> {
    let invalid = |log: &str| Error::new("Invalid webhook signature", log.to_string()).with_oauth_code("signature_invalid");

    if secret.is_empty() {
        return Err(invalid("No webhook secret configured"));
    }

    let mut timestamp: Option<i64> = None;
    let mut signature: Option<&str> = None;
    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signature = Some(value),
            _ => {}
        }
    }
    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return Err(invalid("Malformed signature header"));
    };

    if (now - timestamp).abs() > WEBHOOK_TOLERANCE_SECS {
        return Err(invalid("Webhook timestamp outside the tolerance window"));
    }

    let mut signed_payload = Vec::with_capacity(raw_body.len() + 12);
    signed_payload.extend_from_slice(timestamp.to_string().as_bytes());
    signed_payload.push(b'.');
    signed_payload.extend_from_slice(raw_body);

    let expected = data_encoding::HEXLOWER.encode(&crypto::hmac_sign(secret, &signed_payload));
    if !crypto::ct_eq(&expected, signature.to_lowercase()) {
        return Err(invalid("Webhook signature mismatch"));
    }

    serde_json::from_slice(raw_body).map_err(|_| invalid("Webhook body is not valid JSON"))
}
