use chrono::Utc;
use rocket::{
    request::{FromRequest, Outcome, Request},
    serde::json::Json,
    Route,
};

use crate::{
    api::JsonResult,
    broker::verify_webhook_signature,
    db::{
        models::{Identity, RevokeReason, Session},
        DbConn,
    },
    CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![identity_webhook]
}

/// The raw signature header; verification needs the unparsed body bytes, so
/// the handler receives the body as a plain string. A missing header becomes
/// an empty signature, which fails verification like any other bad one.
pub struct WebhookSignature(String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WebhookSignature {
    type Error = &'static str;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let signature = req.headers().get_one("X-Identity-Signature").unwrap_or_default().to_string();
        Outcome::Success(WebhookSignature(signature))
    }
}

#[post("/webhooks/identity", data = "<body>")]
async fn identity_webhook(body: String, signature: WebhookSignature, conn: DbConn) -> JsonResult {
    let event = verify_webhook_signature(
        &CONFIG.broker_webhook_secret(),
        body.as_bytes(),
        &signature.0,
        Utc::now().timestamp(),
    )
    .map_err(|e| {
        warn!("SECURITY: rejected identity webhook with a bad signature");
        e
    })?;

    let event_type = event["event"].as_str().unwrap_or_default();
    match event_type {
        "user.deleted" => {
            let Some(subject) = event["data"]["id"].as_str() else {
                warn!("user.deleted webhook without a user id");
                return Ok(Json(json!({ "received": true })));
            };

            // The broker subject is persisted on the identity row, so the
            // deletion can be mapped back to a local user. Sessions die here;
            // removing the user row itself stays an administrative action.
            let identities = Identity::find_by_subject(subject, &conn).await;
            if identities.is_empty() {
                info!("user.deleted webhook for unknown subject {subject}");
            }
            for identity in identities {
                let revoked = Session::revoke_by_user(&identity.user_uuid, RevokeReason::AdminRevoked, &conn).await?;
                info!("Revoked {revoked} session(s) of user {} after a user.deleted webhook", identity.user_uuid);
            }
        }
        other => {
            debug!("Ignoring identity webhook event `{other}`");
        }
    }

    Ok(Json(json!({ "received": true })))
}
