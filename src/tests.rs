// Full-flow tests against a bundled SQLite database and a stubbed identity
// broker. The configuration is process-global, so all tests share one
// environment, one Rocket instance and one database; every test works on its
// own users and devices.

use once_cell::sync::Lazy;
use rocket::http::{ContentType, Header, Status};
use rocket::local::asynchronous::{Client, LocalResponse};
use serde_json::Value;
use tokio::sync::OnceCell;
use url::Url;

use crate::api::{ApiResult, EmptyResult};
use crate::auth::{self, AuthMethod};
use crate::broker::{BrokerAuthorizeRequest, BrokerMagicUser, BrokerProfile, IdentityBroker};
use crate::crypto;
use crate::db::models::{AuthConnection, Device, DeviceId, DeviceType, Identity, RevokeReason, Session, SsoDomain, User};
use crate::db::{DbConn, DbPool};
use crate::error::Error;
use crate::{build_rocket, CONFIG};

// RFC 7636 appendix B test vector.
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
const WEBHOOK_SECRET: &str = "whsec_unit_test";

static TEST_ENV: Lazy<tempfile::TempDir> = Lazy::new(|| {
    let dir = tempfile::tempdir().expect("failed to create a temp data folder");
    let path = dir.path().to_string_lossy().into_owned();

    std::env::set_var("DATA_FOLDER", &path);
    std::env::set_var("DATABASE_URL", format!("{path}/test.sqlite3"));
    std::env::set_var("TOKEN_HMAC_SECRET", "unit-test-hmac-secret-0123456789abcdef");
    std::env::set_var("REFRESH_TOKEN_PEPPER", "unit-test-pepper-0123456789abcdef");
    std::env::set_var("DOMAIN", "http://localhost:8000");
    std::env::set_var("DEFAULT_PROVIDER", "google");
    std::env::set_var("BROKER_WEBHOOK_SECRET", WEBHOOK_SECRET);
    std::env::set_var("WEB_REDIRECT_URIS", "https://dash.example.com/oauth/done");

    dir
});

static CLIENT: OnceCell<Client> = OnceCell::const_new();

async fn client() -> &'static Client {
    CLIENT
        .get_or_init(|| async {
            Lazy::force(&TEST_ENV);
            Lazy::force(&CONFIG);
            auth::initialize_keys().expect("failed to initialize the RSA keys");

            let pool = DbPool::from_config().expect("failed to create the test database");
            let broker_client: Box<dyn IdentityBroker> = Box::new(StubBroker);

            Client::untracked(build_rocket(pool, broker_client)).await.expect("valid rocket instance")
        })
        .await
}

async fn conn() -> DbConn {
    client().await.rocket().state::<DbPool>().unwrap().get().await.expect("db connection")
}

//
// Stub broker: accepts one fixed code, session token and email code.
//
struct StubBroker;

fn stub_profile(email: &str, subject: &str) -> BrokerProfile {
    BrokerProfile {
        id: subject.to_string(),
        email: email.to_string(),
        first_name: Some("Test".to_string()),
        last_name: Some("User".to_string()),
        raw_attributes: json!({"locale": "en"}),
        connection_id: None,
        connection_type: "GoogleOAuth".to_string(),
        organization_id: None,
    }
}

#[rocket::async_trait]
impl IdentityBroker for StubBroker {
    fn authorization_url(&self, req: &BrokerAuthorizeRequest) -> ApiResult<Url> {
        let mut url = Url::parse("https://broker.test/authorize").unwrap();
        url.query_pairs_mut().append_pair("state", &req.state);
        if let Some(connection) = &req.connection_id {
            url.query_pairs_mut().append_pair("connection", connection);
        }
        if let Some(provider) = &req.provider {
            url.query_pairs_mut().append_pair("provider", provider);
        }
        Ok(url)
    }

    async fn exchange_code(&self, code: &str) -> ApiResult<BrokerProfile> {
        if code == "broker-code-good" {
            Ok(stub_profile("tester@example.com", "subj_oauth"))
        } else {
            Err(Error::new("Code exchange rejected", "stub rejects this code").with_code(401))
        }
    }

    async fn verify_session(&self, session_token: &str) -> ApiResult<BrokerProfile> {
        if session_token == "sess-token-good" {
            Ok(stub_profile("handoff@example.com", "subj_handoff"))
        } else {
            Err(Error::new("Invalid session", "stub rejects this session token").with_code(401))
        }
    }

    async fn create_magic_auth(&self, _email: &str) -> EmptyResult {
        Ok(())
    }

    async fn authenticate_with_magic_auth(
        &self,
        email: &str,
        code: &str,
        _ip: Option<&str>,
        _user_agent: Option<&str>,
    ) -> ApiResult<BrokerMagicUser> {
        if code == "424242" {
            Ok(BrokerMagicUser {
                email: email.to_string(),
                first_name: None,
                last_name: None,
            })
        } else {
            Err(Error::new("Invalid code", "stub rejects this code"))
        }
    }
}

//
// Small request helpers
//
fn urlenc(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn query_param(location: &str, name: &str) -> Option<String> {
    let url = Url::parse(location).ok()?;
    url.query_pairs().find(|(k, _)| k == name).map(|(_, v)| v.into_owned())
}

async fn json_body(res: LocalResponse<'_>) -> Value {
    res.into_json::<Value>().await.expect("JSON response body")
}

async fn post_json(path: &str, body: Value) -> LocalResponse<'static> {
    client().await.post(path.to_string()).header(ContentType::JSON).body(body.to_string()).dispatch().await
}

/// Drives /oauth/authorize + /oauth/callback and returns our freshly minted
/// authorization code, asserting the S1 redirect contract along the way.
async fn obtain_auth_code(client_redirect: &str, nonce: &str) -> String {
    let client = client().await;

    let uri = format!(
        "/oauth/authorize?response_type=code&client_id=app-web&redirect_uri={}&code_challenge={CHALLENGE}&code_challenge_method=S256&state={nonce}",
        urlenc(client_redirect)
    );
    let res = client.get(uri).dispatch().await;
    assert_eq!(res.status(), Status::Found);
    let location = res.headers().get_one("Location").unwrap().to_string();
    assert!(location.starts_with("https://broker.test/authorize"), "unexpected broker redirect: {location}");
    let signed_state = query_param(&location, "state").unwrap();

    let res = client
        .get(format!("/oauth/callback?code=broker-code-good&state={}", urlenc(&signed_state)))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Found);
    let location = res.headers().get_one("Location").unwrap().to_string();
    assert!(location.starts_with(client_redirect), "unexpected client redirect: {location}");
    assert_eq!(query_param(&location, "state").as_deref(), Some(nonce));

    query_param(&location, "code").expect("authorization code in the redirect")
}

async fn redeem_code(code: &str, redirect_uri: &str, verifier: &str) -> (Status, Value) {
    let body = format!(
        "grant_type=authorization_code&code={}&redirect_uri={}&code_verifier={}",
        urlenc(code),
        urlenc(redirect_uri),
        urlenc(verifier)
    );
    let res = client().await.post("/oauth/token").header(ContentType::Form).body(body).dispatch().await;
    let status = res.status();
    (status, json_body(res).await)
}

async fn refresh_via_http(token: &str) -> (Status, Option<String>) {
    let res = post_json("/refresh", json!({ "refresh_token": token })).await;
    let status = res.status();
    let body = json_body(res).await;
    (status, body["refresh_token"].as_str().map(str::to_string))
}

//
// S1: the full PKCE code flow.
//
#[tokio::test(flavor = "multi_thread")]
async fn oauth_code_flow_happy_path() {
    let redirect = "http://127.0.0.1:54321/callback";
    let code = obtain_auth_code(redirect, "XYZ").await;

    let (status, tokens) = redeem_code(&code, redirect, VERIFIER).await;
    assert_eq!(status, Status::Ok);
    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["expires_in"], 600);
    assert!(tokens["refresh_token"].as_str().is_some());

    let claims = auth::decode_access_token(tokens["access_token"].as_str().unwrap()).unwrap();
    assert_eq!(claims.exp - claims.iat, 600);

    let conn = conn().await;
    let user = User::find_or_create_by_email("tester@example.com", None, None, &conn).await.expect("user was persisted");
    assert_eq!(claims.sub, user.uuid);
    assert_eq!(user.first_name.as_deref(), Some("Test"));

    // The identity row is keyed by the broker subject and protocol.
    let identity = Identity::find_by_provider_and_subject(AuthMethod::OidcGoogle, "subj_oauth", &conn)
        .await
        .expect("identity was persisted");
    assert_eq!(identity.user_uuid, user.uuid);

    // At-most-once: replaying the consumed code is rejected.
    let (status, body) = redeem_code(&code, redirect, VERIFIER).await;
    assert_eq!(status, Status::Unauthorized);
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_code_redemption_has_one_winner() {
    let redirect = "http://127.0.0.1:54321/callback";
    let code = obtain_auth_code(redirect, "nonce-race").await;

    let (r1, r2) = tokio::join!(redeem_code(&code, redirect, VERIFIER), redeem_code(&code, redirect, VERIFIER));
    let statuses = [r1.0, r2.0];
    assert_eq!(statuses.iter().filter(|s| **s == Status::Ok).count(), 1, "exactly one consumer must win: {statuses:?}");
    assert_eq!(statuses.iter().filter(|s| **s == Status::Unauthorized).count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn access_token_under_foreign_key_id_is_rejected() {
    let _ = client().await; // forces key initialization

    // The header names a key id we never published; verification must fail
    // before any signature check.
    let header = data_encoding::BASE64URL_NOPAD.encode(br#"{"alg":"RS256","typ":"JWT","kid":"retired-key"}"#);
    let token = format!("{header}.e30.AAAA");
    assert!(auth::decode_access_token(&token).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn oauth_authorize_input_validation() {
    let client = client().await;

    // Bad response_type.
    let res = client
        .get(format!(
            "/oauth/authorize?response_type=token&client_id=app-web&redirect_uri={}&code_challenge={CHALLENGE}&code_challenge_method=S256&state=s",
            urlenc("http://127.0.0.1/callback")
        ))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);

    // Unknown client.
    let res = client
        .get(format!(
            "/oauth/authorize?response_type=code&client_id=evil&redirect_uri={}&code_challenge={CHALLENGE}&code_challenge_method=S256&state=s",
            urlenc("http://127.0.0.1/callback")
        ))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);
    assert_eq!(json_body(res).await["error"], "unauthorized_client");

    // Rejected redirect.
    let res = client
        .get(format!(
            "/oauth/authorize?response_type=code&client_id=app-web&redirect_uri={}&code_challenge={CHALLENGE}&code_challenge_method=S256&state=s",
            urlenc("https://evil.example.com/callback")
        ))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);
    assert_eq!(json_body(res).await["error"], "invalid_redirect_uri");

    // Plain PKCE is not accepted.
    let res = client
        .get(format!(
            "/oauth/authorize?response_type=code&client_id=app-web&redirect_uri={}&code_challenge={CHALLENGE}&code_challenge_method=plain&state=s",
            urlenc("http://127.0.0.1/callback")
        ))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);

    // Unsupported grant type at the token endpoint.
    let res = client
        .post("/oauth/token")
        .header(ContentType::Form)
        .body("grant_type=client_credentials")
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);
    assert_eq!(json_body(res).await["error"], "unsupported_grant_type");
}

//
// S5: a tampered state never reaches the broker exchange and creates nothing.
//
#[tokio::test(flavor = "multi_thread")]
async fn oauth_callback_rejects_tampered_state() {
    let client = client().await;

    let res = client
        .get(format!(
            "/oauth/authorize?response_type=code&client_id=app-web&redirect_uri={}&code_challenge={CHALLENGE}&code_challenge_method=S256&state=XYZ",
            urlenc("http://127.0.0.1:54321/callback")
        ))
        .dispatch()
        .await;
    let location = res.headers().get_one("Location").unwrap().to_string();
    let signed_state = query_param(&location, "state").unwrap();

    // Flip one character of the signed state.
    let mut chars: Vec<char> = signed_state.chars().collect();
    chars[3] = if chars[3] == 'A' { 'B' } else { 'A' };
    let tampered: String = chars.into_iter().collect();

    let res = client
        .get(format!("/oauth/callback?code=broker-code-good&state={}", urlenc(&tampered)))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Found);
    let location = res.headers().get_one("Location").unwrap().to_string();
    assert!(location.contains("error=invalid_state"), "expected invalid_state, got {location}");
}

#[tokio::test(flavor = "multi_thread")]
async fn oauth_token_wrong_verifier_burns_the_code() {
    let redirect = "http://127.0.0.1:54321/callback";
    let code = obtain_auth_code(redirect, "nonce-pkce").await;

    let (status, body) = redeem_code(&code, redirect, "wrong-verifier-wrong-verifier-wrong-vfy").await;
    assert_eq!(status, Status::Unauthorized);
    assert_eq!(body["error"], "invalid_grant");

    // The failed verifier consumed the code; the right verifier cannot save it.
    let (status, _) = redeem_code(&code, redirect, VERIFIER).await;
    assert_eq!(status, Status::Unauthorized);
}

#[tokio::test(flavor = "multi_thread")]
async fn oauth_token_redirect_mismatch() {
    let redirect = "http://127.0.0.1:54321/callback";
    let code = obtain_auth_code(redirect, "nonce-redirect").await;

    let (status, body) = redeem_code(&code, "http://127.0.0.1:9/callback", VERIFIER).await;
    assert_eq!(status, Status::Unauthorized);
    assert_eq!(body["error"], "invalid_grant");
}

//
// S4: enterprise routing by login hint, with parent-domain fallback and the
// email-pattern filter on the exact domain.
//
#[tokio::test(flavor = "multi_thread")]
async fn enterprise_login_hint_routing() {
    let client = client().await;
    let conn = conn().await;

    let mut connection = AuthConnection::new("conn_nyu", AuthMethod::Sso);
    connection.save(&conn).await.unwrap();
    let mut domain = SsoDomain::new("nyu.edu", connection.uuid.clone());
    domain.email_pattern = Some(r"^[a-z]{2,3}[0-9]{4}@nyu\.edu$".to_string());
    domain.save(&conn).await.unwrap();
    drop(conn);

    let authorize_uri = |hint: &str| {
        format!(
            "/oauth/authorize?response_type=code&client_id=app-web&redirect_uri={}&code_challenge={CHALLENGE}&code_challenge_method=S256&state=s4&login_hint={}",
            urlenc("http://127.0.0.1:54321/callback"),
            urlenc(hint)
        )
    };

    // Matching pattern: routed to the enterprise connection.
    let res = client.get(authorize_uri("ab1234@nyu.edu")).dispatch().await;
    assert_eq!(res.status(), Status::Found);
    let location = res.headers().get_one("Location").unwrap().to_string();
    assert_eq!(query_param(&location, "connection").as_deref(), Some("conn_nyu"));

    // Pattern mismatch on the exact domain: back to the default provider.
    let res = client.get(authorize_uri("guest@nyu.edu")).dispatch().await;
    let location = res.headers().get_one("Location").unwrap().to_string();
    assert_eq!(query_param(&location, "connection"), None);
    assert_eq!(query_param(&location, "provider").as_deref(), Some("GoogleOAuth"));

    // Subdomain routes through the parent-domain mapping.
    let res = client.get(authorize_uri("ab1234@stern.nyu.edu")).dispatch().await;
    let location = res.headers().get_one("Location").unwrap().to_string();
    assert_eq!(query_param(&location, "connection").as_deref(), Some("conn_nyu"));

    // A malformed hint is just ignored.
    let res = client.get(authorize_uri("not-an-email")).dispatch().await;
    let location = res.headers().get_one("Location").unwrap().to_string();
    assert_eq!(query_param(&location, "provider").as_deref(), Some("GoogleOAuth"));
}

//
// S2: concurrent rotations of one refresh token have exactly one winner, and
// the loser kills the session for good.
//
#[tokio::test(flavor = "multi_thread")]
async fn refresh_rotation_reuse_detection() {
    let _ = client().await;
    let conn1 = conn().await;

    let user = User::find_or_create_by_email("rotate@example.com", None, None, &conn1).await.unwrap();
    let (session, refresh_token) =
        Session::create(&user.uuid, None, AuthMethod::MagicLink, None, None, &conn1).await.unwrap();
    drop(conn1);

    let (r1, r2) = tokio::join!(refresh_via_http(&refresh_token), refresh_via_http(&refresh_token));

    let statuses = [r1.0, r2.0];
    assert_eq!(statuses.iter().filter(|s| **s == Status::Ok).count(), 1, "exactly one rotation must win: {statuses:?}");
    assert_eq!(statuses.iter().filter(|s| **s == Status::Unauthorized).count(), 1);

    // The loser revoked the session, so even the winner's new token is dead.
    let winner_token = if r1.0 == Status::Ok { r1.1 } else { r2.1 }.unwrap();
    let (status, _) = refresh_via_http(&winner_token).await;
    assert_eq!(status, Status::Unauthorized);

    let conn2 = conn().await;
    let session = Session::find_by_uuid(&session.uuid, &conn2).await.unwrap();
    assert!(session.is_revoked());
    assert_eq!(session.revoke_reason.as_deref(), Some("rotation_reuse"));
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_rotation_sequential_reuse() {
    let _ = client().await;
    let conn = conn().await;

    let user = User::find_or_create_by_email("reuse@example.com", None, None, &conn).await.unwrap();
    let (_, original_token) =
        Session::create(&user.uuid, None, AuthMethod::MagicLink, None, None, &conn).await.unwrap();
    drop(conn);

    let (status, rotated) = refresh_via_http(&original_token).await;
    assert_eq!(status, Status::Ok);
    let rotated = rotated.unwrap();

    // Replay of the rotated-away token revokes the session...
    let (status, _) = refresh_via_http(&original_token).await;
    assert_eq!(status, Status::Unauthorized);

    // ...taking the legitimate successor down with it.
    let (status, _) = refresh_via_http(&rotated).await;
    assert_eq!(status, Status::Unauthorized);
}

#[tokio::test(flavor = "multi_thread")]
async fn garbage_refresh_token_is_rejected() {
    let _ = client().await;
    let (status, _) = refresh_via_http("definitely-not-a-token").await;
    assert_eq!(status, Status::Unauthorized);
}

//
// Session supersede: one live session per (user, device).
//
#[tokio::test(flavor = "multi_thread")]
async fn new_session_supersedes_prior_for_same_device() {
    let _ = client().await;
    let conn = conn().await;

    let user = User::find_or_create_by_email("supersede@example.com", None, None, &conn).await.unwrap();
    let device =
        Device::upsert(&DeviceId::from("dev-supersede"), &user.uuid, DeviceType::Desktop as i32, None, None, None, &conn)
            .await
            .unwrap();

    let (first, _) =
        Session::create(&user.uuid, Some(&device.uuid), AuthMethod::Sso, None, None, &conn).await.unwrap();
    let (second, _) =
        Session::create(&user.uuid, Some(&device.uuid), AuthMethod::Sso, None, None, &conn).await.unwrap();

    let first = Session::find_by_uuid(&first.uuid, &conn).await.unwrap();
    assert!(first.is_revoked());
    assert_eq!(first.revoke_reason.as_deref(), Some("new_session"));
    assert!(Session::find_valid(&first.uuid, &conn).await.is_none());

    let second = Session::find_by_uuid(&second.uuid, &conn).await.unwrap();
    assert!(!second.is_revoked());

    // Revocation reason is first-writer-wins.
    Session::revoke(&first.uuid, RevokeReason::LogoutAll, &conn).await.unwrap();
    let first = Session::find_by_uuid(&first.uuid, &conn).await.unwrap();
    assert_eq!(first.revoke_reason.as_deref(), Some("new_session"));
}

//
// S3: browser-to-device handoff.
//
#[tokio::test(flavor = "multi_thread")]
async fn handoff_flow() {
    let client = client().await;

    let res = post_json("/handoff/initiate", json!({ "deviceId": "dev-abc" })).await;
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res).await;
    let poll_token = body["pollToken"].as_str().unwrap().to_string();
    let auth_url = body["authUrl"].as_str().unwrap();
    assert!(auth_url.contains("device_id=dev-abc"));
    assert!(auth_url.contains("poll_token="));

    // Nothing to collect yet; a wrong poll token looks exactly the same.
    let res = client.get(format!("/handoff/poll?device_id=dev-abc&poll_token={poll_token}")).dispatch().await;
    assert_eq!(json_body(res).await["status"], "pending");
    let res = client.get("/handoff/poll?device_id=dev-abc&poll_token=WRONG").dispatch().await;
    assert_eq!(json_body(res).await["status"], "pending");

    // An invalid browser session is a 401.
    let res = post_json(
        "/callback",
        json!({ "sessionToken": "sess-token-bad", "deviceId": "dev-abc", "pollToken": poll_token }),
    )
    .await;
    assert_eq!(res.status(), Status::Unauthorized);

    // The browser finishes its login and trades the session for a code.
    let res = post_json(
        "/callback",
        json!({ "sessionToken": "sess-token-good", "deviceId": "dev-abc", "pollToken": poll_token }),
    )
    .await;
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res).await;
    let code = body["code"].as_str().unwrap().to_string();
    assert!(body["deepLink"].as_str().unwrap().contains(&code));
    assert!(!body["deepLink"].as_str().unwrap().contains(&poll_token), "poll token must not leak into the deep link");

    // Wrong poll token still reads as pending even though a code exists.
    let res = client.get("/handoff/poll?device_id=dev-abc&poll_token=WRONG").dispatch().await;
    assert_eq!(json_body(res).await["status"], "pending");

    let res = client.get(format!("/handoff/poll?device_id=dev-abc&poll_token={poll_token}")).dispatch().await;
    let body = json_body(res).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["code"].as_str().unwrap(), code);

    // A foreign device cannot redeem the code.
    let res = client
        .post("/device-token")
        .header(ContentType::JSON)
        .header(Header::new("X-Device-ID", "dev-other"))
        .body(json!({ "code": code, "platform": "quest" }).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client
        .post("/device-token")
        .header(ContentType::JSON)
        .header(Header::new("X-Device-ID", "dev-abc"))
        .body(json!({ "code": code, "platform": "quest" }).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res).await;
    assert!(body["access_token"].as_str().is_some());
    assert!(body["refresh_token"].as_str().is_some());
    assert_eq!(body["user"]["email"], "handoff@example.com");

    let claims = auth::decode_access_token(body["access_token"].as_str().unwrap()).unwrap();
    assert_eq!(claims.did, "dev-abc");

    // Single use.
    let res = client
        .post("/device-token")
        .header(ContentType::JSON)
        .header(Header::new("X-Device-ID", "dev-abc"))
        .body(json!({ "code": code }).to_string())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Unauthorized);
}

#[tokio::test(flavor = "multi_thread")]
async fn handoff_initiate_clears_stale_codes() {
    let client = client().await;

    let res = post_json("/handoff/initiate", json!({ "deviceId": "dev-stale" })).await;
    let poll_token = json_body(res).await["pollToken"].as_str().unwrap().to_string();

    let res = post_json(
        "/callback",
        json!({ "sessionToken": "sess-token-good", "deviceId": "dev-stale", "pollToken": poll_token }),
    )
    .await;
    assert_eq!(res.status(), Status::Ok);

    // Starting over deletes the pending code; the old poll token goes dark.
    let res = post_json("/handoff/initiate", json!({ "deviceId": "dev-stale" })).await;
    assert_eq!(res.status(), Status::Ok);
    let res = client.get(format!("/handoff/poll?device_id=dev-stale&poll_token={poll_token}")).dispatch().await;
    assert_eq!(json_body(res).await["status"], "pending");
}

//
// S6: magic codes, native and web branches.
//
#[tokio::test(flavor = "multi_thread")]
async fn magic_code_native_client_gets_auth_code() {
    let res = post_json("/magic-auth", json!({ "email": "magic@example.com" })).await;
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(json_body(res).await["success"], true);

    // Malformed email is the only enumeration-free rejection.
    let res = post_json("/magic-auth", json!({ "email": "not-an-email" })).await;
    assert_eq!(res.status(), Status::BadRequest);

    let verify = |code: &str| {
        json!({
            "email": "magic@example.com",
            "code": code,
            "client_id": "app-desktop",
            "code_challenge": CHALLENGE,
            "redirect_uri": "app://auth/callback",
            "device_id": "dev-magic",
            "device_platform": "windows",
        })
    };

    // Wrong code: generic rejection.
    let res = post_json("/magic-auth/verify", verify("000000")).await;
    assert_eq!(res.status(), Status::BadRequest);
    assert_eq!(json_body(res).await["error"], "invalid_code");

    // Non-numeric code is rejected before the broker sees it.
    let res = post_json("/magic-auth/verify", verify("12345x")).await;
    assert_eq!(res.status(), Status::BadRequest);

    // Valid code: a native client receives an authorization code.
    let res = post_json("/magic-auth/verify", verify("424242")).await;
    assert_eq!(res.status(), Status::Ok);
    let code = json_body(res).await["code"].as_str().unwrap().to_string();

    // The code redeems with the matching verifier and redirect.
    let (status, tokens) = redeem_code(&code, "app://auth/callback", VERIFIER).await;
    assert_eq!(status, Status::Ok);
    let claims = auth::decode_access_token(tokens["access_token"].as_str().unwrap()).unwrap();
    assert_eq!(claims.did, "dev-magic");

    // A second code with a wrong verifier is rejected.
    let res = post_json("/magic-auth/verify", verify("424242")).await;
    let code = json_body(res).await["code"].as_str().unwrap().to_string();
    let (status, _) = redeem_code(&code, "app://auth/callback", "not-the-right-verifier-not-the-right").await;
    assert_eq!(status, Status::Unauthorized);

    // Native clients must send a PKCE challenge.
    let mut missing = verify("424242");
    missing.as_object_mut().unwrap().remove("code_challenge");
    let res = post_json("/magic-auth/verify", missing).await;
    assert_eq!(res.status(), Status::BadRequest);
}

#[tokio::test(flavor = "multi_thread")]
async fn magic_code_web_client_gets_session() {
    let res = post_json(
        "/magic-auth/verify",
        json!({
            "email": "magic-web@example.com",
            "code": "424242",
            "client_id": "app-web",
        }),
    )
    .await;
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res).await;
    assert!(body["access_token"].as_str().is_some());
    assert!(body["refresh_token"].as_str().is_some());
    assert!(body["expires_at"].as_str().is_some());

    let conn = conn().await;
    let user = User::find_or_create_by_email("magic-web@example.com", None, None, &conn).await.unwrap();
    assert!(user.last_login_web_at.is_some());
}

//
// Bearer-guarded session endpoints.
//
#[tokio::test(flavor = "multi_thread")]
async fn logout_and_logout_all() {
    let client = client().await;
    let conn1 = conn().await;

    let user = User::find_or_create_by_email("logout@example.com", None, None, &conn1).await.unwrap();
    let (session_a, _) = Session::create(&user.uuid, None, AuthMethod::MagicLink, None, None, &conn1).await.unwrap();
    let (session_b, _) = Session::create(&user.uuid, None, AuthMethod::MagicLink, None, None, &conn1).await.unwrap();
    let (access_a, _) = auth::generate_access_token(&session_a);
    let (access_b, _) = auth::generate_access_token(&session_b);
    drop(conn1);

    // No token, no logout.
    let res = client.post("/logout").dispatch().await;
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client.post("/logout").header(Header::new("Authorization", format!("Bearer {access_a}"))).dispatch().await;
    assert_eq!(res.status(), Status::Ok);

    // The revoked session fails the guard from now on.
    let res = client.post("/logout").header(Header::new("Authorization", format!("Bearer {access_a}"))).dispatch().await;
    assert_eq!(res.status(), Status::Unauthorized);

    let res =
        client.post("/logout-all").header(Header::new("Authorization", format!("Bearer {access_b}"))).dispatch().await;
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res).await;
    assert_eq!(body["success"], true);
    assert!(body["sessionsRevoked"].as_i64().unwrap() >= 1);

    let conn2 = conn().await;
    let session_b = Session::find_by_uuid(&session_b.uuid, &conn2).await.unwrap();
    assert_eq!(session_b.revoke_reason.as_deref(), Some("logout_all"));
}

//
// Webhooks: signature window and deletion mapping.
//
fn sign_webhook(body: &str, timestamp: i64) -> String {
    let mut payload = timestamp.to_string().into_bytes();
    payload.push(b'.');
    payload.extend_from_slice(body.as_bytes());
    format!("t={timestamp},v1={}", data_encoding::HEXLOWER.encode(&crypto::hmac_sign(WEBHOOK_SECRET, &payload)))
}

#[tokio::test(flavor = "multi_thread")]
async fn webhook_revokes_sessions_of_deleted_user() {
    let client = client().await;
    let conn1 = conn().await;

    let user = User::find_or_create_by_email("webhooked@example.com", None, None, &conn1).await.unwrap();
    Identity::upsert(&user.uuid, AuthMethod::OidcGoogle, "subj_webhook", Some("webhooked@example.com"), None, &conn1)
        .await
        .unwrap();
    let (session, _) = Session::create(&user.uuid, None, AuthMethod::OidcGoogle, None, None, &conn1).await.unwrap();
    drop(conn1);

    let body = json!({ "event": "user.deleted", "data": { "id": "subj_webhook" } }).to_string();

    // Bad signature first: rejected, nothing happens.
    let res = client
        .post("/webhooks/identity")
        .header(Header::new("X-Identity-Signature", "t=1,v1=00"))
        .body(body.clone())
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);
    assert_eq!(json_body(res).await["error"], "signature_invalid");

    let conn2 = conn().await;
    assert!(!Session::find_by_uuid(&session.uuid, &conn2).await.unwrap().is_revoked());
    drop(conn2);

    // Correctly signed: the mapped user's sessions are revoked.
    let signature = sign_webhook(&body, chrono::Utc::now().timestamp());
    let res = client
        .post("/webhooks/identity")
        .header(Header::new("X-Identity-Signature", signature))
        .body(body)
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(json_body(res).await["received"], true);

    let conn3 = conn().await;
    let session = Session::find_by_uuid(&session.uuid, &conn3).await.unwrap();
    assert!(session.is_revoked());
    assert_eq!(session.revoke_reason.as_deref(), Some("admin_revoked"));
}

#[tokio::test(flavor = "multi_thread")]
async fn alive_endpoint() {
    let client = client().await;
    let res = client.get("/alive").dispatch().await;
    assert_eq!(res.status(), Status::Ok);
}
