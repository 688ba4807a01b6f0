mod handoff;
mod magic;
mod oauth;
mod sessions;
mod webhooks;

use rocket::serde::json::Json;
use rocket::{Catcher, Route};
use serde_json::Value;

pub use crate::api::{
    handoff::routes as handoff_routes,
    magic::routes as magic_routes,
    oauth::routes as oauth_routes,
    sessions::routes as sessions_routes,
    webhooks::routes as webhooks_routes,
};
use crate::CONFIG;

// Type aliases for API methods results
pub type ApiResult<T> = Result<T, crate::error::Error>;
pub type JsonResult = ApiResult<Json<Value>>;
pub type EmptyResult = ApiResult<()>;

pub fn web_routes() -> Vec<Route> {
    routes![alive]
}

#[get("/alive")]
fn alive() -> Json<String> {
    Json(crate::util::format_datetime(&chrono::Utc::now().naive_utc()))
}

pub fn catchers() -> Vec<Catcher> {
    catchers![bad_request, unauthorized, unprocessable, not_found, internal_error]
}

#[catch(400)]
fn bad_request() -> Json<Value> {
    Json(json!({"error": "invalid_request", "error_description": "Bad request"}))
}

#[catch(401)]
fn unauthorized() -> Json<Value> {
    Json(json!({"error": "unauthorized", "error_description": "Authentication required"}))
}

// Rocket answers undecodable bodies with 422; our error contract is 400.
#[catch(422)]
fn unprocessable() -> crate::error::Error {
    crate::error::Error::new("Malformed request body", "Failed to decode the request body")
}

#[catch(404)]
fn not_found() -> Json<Value> {
    Json(json!({"error": "not_found", "error_description": "The requested resource does not exist"}))
}

#[catch(500)]
fn internal_error() -> Json<Value> {
    Json(json!({"error": "server_error", "error_description": "Internal error"}))
}

/// Redirect-URI acceptance for the code grant: loopback http on any port with
/// path `/callback`, the fixed native paths of every configured custom
/// scheme, and explicit entries of the web allowlist.
pub fn is_valid_redirect_uri(uri: &str) -> bool {
    redirect_uri_allowed(uri, &CONFIG.custom_uri_schemes_vec(), &CONFIG.web_redirect_uris_vec())
}

fn redirect_uri_allowed(uri: &str, custom_schemes: &[String], web_allowlist: &[String]) -> bool {
    if web_allowlist.iter().any(|allowed| allowed == uri) {
        return true;
    }

    for scheme in custom_schemes {
        if uri == format!("{scheme}://callback")
            || uri == format!("{scheme}://auth/callback")
            || uri == format!("{scheme}://oauth/callback")
        {
            return true;
        }
    }

    let Ok(parsed) = url::Url::parse(uri) else {
        return false;
    };
    parsed.scheme() == "http"
        && matches!(parsed.host_str(), Some("127.0.0.1" | "localhost" | "[::1]"))
        && parsed.path() == "/callback"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schemes() -> Vec<String> {
        vec!["app".to_string()]
    }

    #[test]
    fn test_loopback_redirects_any_port() {
        for uri in [
            "http://127.0.0.1:54321/callback",
            "http://127.0.0.1/callback",
            "http://localhost:8123/callback",
            "http://[::1]:9999/callback",
        ] {
            assert!(redirect_uri_allowed(uri, &schemes(), &[]), "{uri} should be accepted");
        }
    }

    #[test]
    fn test_loopback_redirects_rejected_variants() {
        for uri in [
            "https://127.0.0.1:54321/callback", // https is not a loopback grant
            "http://127.0.0.1:54321/other",
            "http://192.168.1.4:54321/callback", // not loopback
            "http://evil.example.com/callback",
            "not a url",
        ] {
            assert!(!redirect_uri_allowed(uri, &schemes(), &[]), "{uri} should be rejected");
        }
    }

    #[test]
    fn test_custom_scheme_redirects() {
        for uri in ["app://callback", "app://auth/callback", "app://oauth/callback"] {
            assert!(redirect_uri_allowed(uri, &schemes(), &[]), "{uri} should be accepted");
        }
        assert!(!redirect_uri_allowed("app://elsewhere", &schemes(), &[]));
        assert!(!redirect_uri_allowed("other://callback", &schemes(), &[]));
    }

    #[test]
    fn test_web_allowlist_is_exact_match() {
        let allow = vec!["https://dash.example.com/oauth/done".to_string()];
        assert!(redirect_uri_allowed("https://dash.example.com/oauth/done", &schemes(), &allow));
        assert!(!redirect_uri_allowed("https://dash.example.com/oauth/done/extra", &schemes(), &allow));
        assert!(!redirect_uri_allowed("https://dash.example.com/", &schemes(), &allow));
    }
}
