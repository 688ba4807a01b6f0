//
// SSO domain resolution
//
use regex::RegexBuilder;

use crate::api::EmptyResult;
use crate::auth::AuthMethod;
use crate::db::models::{AuthConnection, SsoDomain};
use crate::db::DbConn;
use crate::CONFIG;

#[derive(Debug, Deserialize)]
struct DomainMapping {
    domain: String,
    connection: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    email_pattern: Option<String>,
}

/// Applies the `SSO_DOMAINS` mappings at startup. There is no admin surface
/// for the domain table; deployments declare their enterprise domains in the
/// environment and this keeps the rows in line with it.
pub async fn sync_domain_mappings(conn: &DbConn) -> EmptyResult {
    let raw = CONFIG.sso_domains();
    if raw.trim().is_empty() {
        return Ok(());
    }

    let mappings: Vec<DomainMapping> = serde_json::from_str(&raw)?;
    for mapping in mappings {
        let connection = match AuthConnection::find_by_broker_id(&mapping.connection, conn).await {
            Some(connection) => connection,
            None => {
                let protocol = mapping.protocol.as_deref().and_then(AuthMethod::from_tag).unwrap_or(AuthMethod::Sso);
                let mut connection = AuthConnection::new(&mapping.connection, protocol);
                connection.save(conn).await?;
                connection
            }
        };

        let mut domain = SsoDomain::new(&mapping.domain, connection.uuid.clone());
        domain.email_pattern = mapping.email_pattern;
        domain.save(conn).await?;
        info!("Mapped SSO domain {} to connection {}", domain.domain, connection.broker_connection_id);
    }

    Ok(())
}

pub enum SsoResolution {
    Enterprise {
        connection: AuthConnection,
        domain: String,
    },
    NonEnterprise,
}

/// Maps an email to an enterprise broker connection. The domain is matched
/// exactly first, then by stripping leading labels (`stern.nyu.edu` →
/// `nyu.edu`), never querying the bare TLD. Reads only; holds no state.
pub async fn resolve(email: &str, conn: &DbConn) -> SsoResolution {
    let email = email.trim().to_lowercase();
    let Some(domain) = email_domain(&email) else {
        return SsoResolution::NonEnterprise;
    };

    for (idx, candidate) in domain_candidates(domain).iter().enumerate() {
        let Some(sso_domain) = SsoDomain::find_enabled(candidate, conn).await else {
            continue;
        };

        // The email pattern constrains addresses of the mapped domain itself;
        // subdomain fallback matches route on the domain alone.
        let exact = idx == 0;
        if exact && !email_matches_pattern(sso_domain.email_pattern.as_deref(), &email) {
            debug!("SSO domain {candidate} matched but the email pattern rejected {email}");
            return SsoResolution::NonEnterprise;
        }

        let Some(connection) = AuthConnection::find_enabled_by_uuid(&sso_domain.connection_uuid, conn).await else {
            warn!("SSO domain {candidate} references a missing or disabled connection");
            return SsoResolution::NonEnterprise;
        };

        return SsoResolution::Enterprise {
            connection,
            domain: sso_domain.domain,
        };
    }

    SsoResolution::NonEnterprise
}

fn email_domain(email: &str) -> Option<&str> {
    let (local, domain) = email.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(domain)
}

/// `a.b.c` yields `["a.b.c", "b.c"]`; the bare TLD is never a candidate.
fn domain_candidates(domain: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut rest = domain;
    while rest.matches('.').count() >= 1 {
        candidates.push(rest.to_string());
        match rest.split_once('.') {
            Some((_, parent)) => rest = parent,
            None => break,
        }
    }
    candidates
}

/// A set pattern must match the full email, case-insensitively. A pattern
/// that fails to compile is ignored, as if none were set.
fn email_matches_pattern(pattern: Option<&str>, email: &str) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };

    match RegexBuilder::new(&format!("^(?:{pattern})$")).case_insensitive(true).build() {
        Ok(re) => re.is_match(email),
        Err(e) => {
            warn!("Ignoring unparseable SSO email pattern `{pattern}`: {e}");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_domain() {
        assert_eq!(email_domain("user@example.com"), Some("example.com"));
        assert_eq!(email_domain("weird@user@example.com"), Some("example.com"));
        assert_eq!(email_domain("no-at-sign"), None);
        assert_eq!(email_domain("@example.com"), None);
        assert_eq!(email_domain("user@"), None);
    }

    #[test]
    fn test_domain_candidates_strip_leading_labels() {
        assert_eq!(domain_candidates("stern.nyu.edu"), vec!["stern.nyu.edu", "nyu.edu"]);
        assert_eq!(domain_candidates("a.b.c"), vec!["a.b.c", "b.c"]);
        assert_eq!(domain_candidates("nyu.edu"), vec!["nyu.edu"]);
        // A bare TLD is never queried.
        assert_eq!(domain_candidates("localhost"), Vec::<String>::new());
    }

    #[test]
    fn test_email_pattern_full_match_case_insensitive() {
        let pattern = Some(r"^[a-z]{2,3}[0-9]{4}@nyu\.edu$");
        assert!(email_matches_pattern(pattern, "ab1234@nyu.edu"));
        assert!(email_matches_pattern(pattern, "AB1234@NYU.EDU"));
        assert!(!email_matches_pattern(pattern, "guest@nyu.edu"));
        // Substring matches are not enough, the full email must match.
        assert!(!email_matches_pattern(Some("ab1234"), "ab1234@nyu.edu"));
    }

    #[test]
    fn test_email_pattern_unparseable_is_ignored() {
        assert!(email_matches_pattern(Some("(unclosed"), "anyone@anywhere.edu"));
        assert!(email_matches_pattern(None, "anyone@anywhere.edu"));
    }
}
