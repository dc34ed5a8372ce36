//! Trusted-header caller identity and the shared secret guarding the tick
//! endpoints.
//!
//! Authentication itself happens upstream; this layer only reads what the
//! authenticating proxy asserted.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use tenantry_kernel::{CallerIdentity, CallerRole, DeploymentMode, KernelError};

pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const CALLER_ROLE_HEADER: &str = "x-caller-role";
pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Missing role means manager.
pub fn caller_identity(headers: &HeaderMap) -> Result<CallerIdentity, KernelError> {
    let id = header(headers, CALLER_ID_HEADER)
        .ok_or_else(|| KernelError::Unauthorized(format!("missing {} header", CALLER_ID_HEADER)))?;
    let role = match header(headers, CALLER_ROLE_HEADER).map(str::to_ascii_lowercase) {
        None => CallerRole::Manager,
        Some(raw) if raw == "manager" => CallerRole::Manager,
        Some(raw) if raw == "admin" => CallerRole::Admin,
        Some(other) => {
            return Err(KernelError::Unauthorized(format!(
                "unknown caller role '{}'",
                other
            )))
        }
    };
    Ok(CallerIdentity {
        id: id.to_string(),
        role,
    })
}

fn presented_secret(headers: &HeaderMap) -> Option<&str> {
    header(headers, CRON_SECRET_HEADER).or_else(|| {
        header(headers, "authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
    })
}

fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Secrets are compared as SHA-256 digests. With no configured secret,
/// development lets everything through and production refuses everything.
pub fn verify_shared_secret(
    headers: &HeaderMap,
    configured: Option<&str>,
    mode: DeploymentMode,
) -> Result<(), KernelError> {
    let Some(expected) = configured else {
        if mode.is_production() {
            return Err(KernelError::Misconfigured(
                "shared secret is not configured".into(),
            ));
        }
        tracing::debug!("shared_secret_skipped_development");
        return Ok(());
    };
    match presented_secret(headers) {
        Some(presented) if digest(presented) == digest(expected) => Ok(()),
        Some(_) => Err(KernelError::Unauthorized("invalid shared secret".into())),
        None => Err(KernelError::Unauthorized("missing shared secret".into())),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn caller_identity_reads_trusted_headers() {
        let caller = caller_identity(&headers(&[("x-caller-id", "mgr-1")])).unwrap();
        assert_eq!(caller, CallerIdentity::manager("mgr-1"));

        let admin =
            caller_identity(&headers(&[("x-caller-id", "ops"), ("x-caller-role", "ADMIN")]))
                .unwrap();
        assert!(admin.is_admin());

        assert!(matches!(
            caller_identity(&HeaderMap::new()),
            Err(KernelError::Unauthorized(_))
        ));
        assert!(matches!(
            caller_identity(&headers(&[("x-caller-id", "x"), ("x-caller-role", "root")])),
            Err(KernelError::Unauthorized(_))
        ));
    }

    #[test]
    fn shared_secret_accepts_header_or_bearer() {
        let prod = DeploymentMode::Production;
        assert!(verify_shared_secret(&headers(&[("x-cron-secret", "s3")]), Some("s3"), prod).is_ok());
        assert!(verify_shared_secret(
            &headers(&[("authorization", "Bearer s3")]),
            Some("s3"),
            prod
        )
        .is_ok());
        assert!(matches!(
            verify_shared_secret(&headers(&[("x-cron-secret", "nope")]), Some("s3"), prod),
            Err(KernelError::Unauthorized(_))
        ));
        assert!(matches!(
            verify_shared_secret(&HeaderMap::new(), Some("s3"), prod),
            Err(KernelError::Unauthorized(_))
        ));
    }

    #[test]
    fn missing_secret_fails_closed_in_production_only() {
        assert!(matches!(
            verify_shared_secret(&HeaderMap::new(), None, DeploymentMode::Production),
            Err(KernelError::Misconfigured(_))
        ));
        assert!(verify_shared_secret(&HeaderMap::new(), None, DeploymentMode::Development).is_ok());
    }
}
