use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::audit_log::{AuditLogger, ClientInfo};
use super::credential::{hash_secret, Credential};
use super::endpoints::EndpointRegistry;
use super::rate_limit::{window_key, RateLimiter};
use super::validator::{AuthFailure, CredentialValidator};
use crate::connector::store::SettingsStore;

pub const INSECURE_TRANSPORT_WARNING: &str = "Connection is not encrypted. Use HTTPS.";

/// Why a request was refused. Display text is safe to return to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenyReason {
    #[error("The LLM connector is currently disabled.")]
    ConnectorDisabled,
    #[error("API key is required.")]
    MissingCredential,
    #[error("Invalid API key.")]
    InvalidCredential,
    #[error("Invalid API key.")]
    Revoked,
    #[error("Invalid API key.")]
    Expired,
    #[error("This endpoint is not enabled.")]
    EndpointNotAllowed { slug: String },
    #[error("Rate limit exceeded.")]
    RateLimitExceeded { retry_after: Option<Duration> },
    #[error("The connector is temporarily unavailable.")]
    StoreUnavailable,
}

impl DenyReason {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ConnectorDisabled | Self::EndpointNotAllowed { .. } => 403,
            Self::MissingCredential | Self::InvalidCredential | Self::Revoked | Self::Expired => 401,
            Self::RateLimitExceeded { .. } => 429,
            Self::StoreUnavailable => 503,
        }
    }

    /// Coarse wire code. Revoked and expired keys are indistinguishable from
    /// unknown ones here.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectorDisabled => "connector_disabled",
            Self::MissingCredential => "missing_api_key",
            Self::InvalidCredential | Self::Revoked | Self::Expired => "invalid_api_key",
            Self::EndpointNotAllowed { .. } => "endpoint_not_allowed",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl From<AuthFailure> for DenyReason {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::MissingCredential => Self::MissingCredential,
            AuthFailure::InvalidCredential => Self::InvalidCredential,
            AuthFailure::Revoked => Self::Revoked,
            AuthFailure::Expired => Self::Expired,
        }
    }
}

/// What the router knows about one inbound request.
#[derive(Debug, Clone)]
pub struct AuthRequest<'a> {
    pub raw_secret: Option<&'a str>,
    pub route: &'a str,
    pub transport_is_encrypted: bool,
    pub client: &'a ClientInfo,
}

/// A successful authorization.
#[derive(Debug, Clone)]
pub struct Grant {
    pub credential: Credential,
    pub slug: Option<String>,
    /// Non-blocking notices for the response, e.g. insecure transport.
    pub warnings: Vec<String>,
    /// Advisory; enforced by the endpoint implementations.
    pub read_only: bool,
    /// `log_requests` of the snapshot this decision used.
    pub log_requests: bool,
}

pub type AuthorizationResult = Result<Grant, DenyReason>;

/// Ordered request authorization: enabled, transport, credential, endpoint, rate.
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    store: Arc<dyn SettingsStore>,
    registry: EndpointRegistry,
    limiter: RateLimiter,
    audit: AuditLogger,
}

impl AuthorizationGate {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        registry: EndpointRegistry,
        limiter: RateLimiter,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            registry,
            limiter,
            audit,
        }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.store
    }

    pub async fn authorize(&self, req: &AuthRequest<'_>) -> AuthorizationResult {
        let settings = match self.store.snapshot() {
            Ok(s) => s,
            Err(e) => {
                error!(target: "audit", event = "store_unavailable", route = req.route, error = %e, "settings read failed; denying");
                return Err(DenyReason::StoreUnavailable);
            }
        };
        let audit = self.audit.for_request(settings.log_requests, req.client);
        let no_params = json!({});
        let presented = req.raw_secret.filter(|s| !s.is_empty());

        if !settings.enabled {
            warn!(target: "audit", event = "connector_disabled", route = req.route);
            if let Some(raw) = presented {
                audit.record(&hash_secret(raw), "connector_disabled", &no_params, 403);
            }
            return Err(DenyReason::ConnectorDisabled);
        }

        let mut warnings = Vec::new();
        if !req.transport_is_encrypted {
            warnings.push(INSECURE_TRANSPORT_WARNING.to_string());
        }

        let validator = CredentialValidator::new(&settings.credentials);
        let credential = match validator.validate(presented) {
            Ok(c) => c,
            Err(AuthFailure::MissingCredential) => {
                warn!(target: "audit", event = "auth_failure", reason = "missing", route = req.route, ip = %req.client.address);
                return Err(DenyReason::MissingCredential);
            }
            Err(failure) => {
                let presented_hash = hash_secret(presented.unwrap_or_default());
                warn!(target: "audit", event = "auth_failure", reason = %failure, route = req.route, ip = %req.client.address);
                audit.record(&presented_hash, "auth_failed", &no_params, 401);
                return Err(failure.into());
            }
        };

        let slug = self.registry.slug_for(req.route);
        if let Some(slug) = slug {
            if !settings.is_endpoint_allowed(slug) {
                warn!(target: "audit", event = "endpoint_denied", credential_id = %credential.id, slug);
                audit.record(&credential.secret_hash, &format!("{slug}_denied"), &no_params, 403);
                return Err(DenyReason::EndpointNotAllowed {
                    slug: slug.to_string(),
                });
            }
        }

        let key = window_key(&credential.secret_hash);
        if !self.limiter.allow(key, settings.rate_limit_per_hour).await {
            let retry_after = self.limiter.retry_after(key).await;
            warn!(target: "audit", event = "rate_limited", credential_id = %credential.id, route = req.route);
            audit.record(&credential.secret_hash, "rate_limited", &no_params, 429);
            return Err(DenyReason::RateLimitExceeded { retry_after });
        }

        debug!(target: "audit", event = "authorized", credential_id = %credential.id, route = req.route);
        Ok(Grant {
            credential: credential.clone(),
            slug: slug.map(str::to_string),
            warnings,
            read_only: settings.read_only_mode,
            log_requests: settings.log_requests,
        })
    }

    /// Record the final status of an authorized call once the handler has run.
    pub fn record_completion(
        &self,
        grant: &Grant,
        client: &ClientInfo,
        label: &str,
        metadata: &Value,
        status: u16,
    ) {
        self.audit
            .for_request(grant.log_requests, client)
            .record(&grant.credential.secret_hash, label, metadata, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::config::Settings;
    use crate::connector::store::MemorySettingsStore;
    use crate::security::audit_log::{AuditRecord, AuditSink, MemoryAuditSink};
    use anyhow::{anyhow, Result};

    #[derive(Debug)]
    struct BrokenStore;

    #[derive(Debug)]
    struct FailingSink;

    impl AuditSink for FailingSink {
        fn append(&self, _record: AuditRecord) -> Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    impl SettingsStore for BrokenStore {
        fn snapshot(&self) -> Result<Arc<Settings>> {
            Err(anyhow!("database gone"))
        }
    }

    fn settings() -> Settings {
        let (mut cred, _) = Credential::issue("bot", None);
        cred.secret_hash = hash_secret("abc");
        Settings {
            enabled: true,
            credentials: vec![cred],
            ..Settings::default()
        }
    }

    fn gate(store: Arc<dyn SettingsStore>) -> (AuthorizationGate, MemoryAuditSink) {
        let sink = MemoryAuditSink::new();
        let gate = AuthorizationGate::new(
            store,
            EndpointRegistry::default(),
            RateLimiter::new_per_hour(),
            AuditLogger::new(Arc::new(sink.clone())),
        );
        (gate, sink)
    }

    fn request<'a>(secret: Option<&'a str>, route: &'a str, client: &'a ClientInfo) -> AuthRequest<'a> {
        AuthRequest {
            raw_secret: secret,
            route,
            transport_is_encrypted: true,
            client,
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(DenyReason::ConnectorDisabled.status_code(), 403);
        assert_eq!(DenyReason::MissingCredential.status_code(), 401);
        assert_eq!(DenyReason::Revoked.status_code(), 401);
        assert_eq!(DenyReason::EndpointNotAllowed { slug: "x".into() }.status_code(), 403);
        assert_eq!(DenyReason::RateLimitExceeded { retry_after: None }.status_code(), 429);
        assert_eq!(DenyReason::StoreUnavailable.status_code(), 503);
    }

    #[test]
    fn test_revoked_and_expired_look_invalid_on_the_wire() {
        assert_eq!(DenyReason::Revoked.code(), DenyReason::InvalidCredential.code());
        assert_eq!(DenyReason::Expired.to_string(), DenyReason::InvalidCredential.to_string());
    }

    #[tokio::test]
    async fn test_allow_carries_read_only_and_slug() {
        let (gate, sink) = gate(Arc::new(MemorySettingsStore::new(settings())));
        let client = ClientInfo::default();
        let grant = gate.authorize(&request(Some("abc"), "site-info", &client)).await.unwrap();
        assert_eq!(grant.slug.as_deref(), Some("site_info"));
        assert!(grant.read_only);
        assert!(grant.warnings.is_empty());
        // Success is recorded by the router, not here.
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_insecure_transport_warns_but_allows() {
        let (gate, _) = gate(Arc::new(MemorySettingsStore::new(settings())));
        let client = ClientInfo::default();
        let mut req = request(Some("abc"), "site-info", &client);
        req.transport_is_encrypted = false;
        let grant = gate.authorize(&req).await.unwrap();
        assert_eq!(grant.warnings, vec![INSECURE_TRANSPORT_WARNING.to_string()]);
    }

    #[tokio::test]
    async fn test_missing_credential_not_audited() {
        let (gate, sink) = gate(Arc::new(MemorySettingsStore::new(settings())));
        let client = ClientInfo::default();
        let err = gate.authorize(&request(None, "site-info", &client)).await.unwrap_err();
        assert_eq!(err, DenyReason::MissingCredential);
        let err = gate.authorize(&request(Some(""), "site-info", &client)).await.unwrap_err();
        assert_eq!(err, DenyReason::MissingCredential);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_credential_audited_with_presented_hash() {
        let (gate, sink) = gate(Arc::new(MemorySettingsStore::new(settings())));
        let client = ClientInfo::default();
        let err = gate.authorize(&request(Some("xyz"), "site-info", &client)).await.unwrap_err();
        assert_eq!(err, DenyReason::InvalidCredential);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint, "auth_failed");
        assert_eq!(records[0].credential_hash, hash_secret("xyz"));
        assert_eq!(records[0].response_code, 401);
    }

    #[tokio::test]
    async fn test_unmapped_route_skips_allowlist() {
        let mut s = settings();
        s.allowed_endpoints.clear();
        let (gate, _) = gate(Arc::new(MemorySettingsStore::new(s)));
        let client = ClientInfo::default();
        let grant = gate.authorize(&request(Some("abc"), "custom", &client)).await.unwrap();
        assert_eq!(grant.slug, None);
        let err = gate.authorize(&request(Some("abc"), "themes", &client)).await.unwrap_err();
        assert_eq!(err, DenyReason::EndpointNotAllowed { slug: "theme_list".into() });
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let (gate, sink) = gate(Arc::new(BrokenStore));
        let client = ClientInfo::default();
        let err = gate.authorize(&request(Some("abc"), "site-info", &client)).await.unwrap_err();
        assert_eq!(err, DenyReason::StoreUnavailable);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_log_requests_off_suppresses_records() {
        let mut s = settings();
        s.log_requests = false;
        let (gate, sink) = gate(Arc::new(MemorySettingsStore::new(s)));
        let client = ClientInfo::default();
        gate.authorize(&request(Some("xyz"), "site-info", &client)).await.unwrap_err();
        let grant = gate.authorize(&request(Some("abc"), "site-info", &client)).await.unwrap();
        gate.record_completion(&grant, &client, "site_info", &json!({}), 200);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_record_completion() {
        let (gate, sink) = gate(Arc::new(MemorySettingsStore::new(settings())));
        let client = ClientInfo {
            address: "198.51.100.4".into(),
            agent: "claude".into(),
        };
        let grant = gate.authorize(&request(Some("abc"), "site-info", &client)).await.unwrap();
        gate.record_completion(&grant, &client, "site_info", &json!({"q": "1"}), 200);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].credential_hash, hash_secret("abc"));
        assert_eq!(records[0].response_code, 200);
        assert_eq!(records[0].ip_address, "198.51.100.4");
    }

    #[tokio::test]
    async fn test_audit_failure_never_changes_decision() {
        let mut s = settings();
        s.rate_limit_per_hour = 1;
        let gate = AuthorizationGate::new(
            Arc::new(MemorySettingsStore::new(s)),
            EndpointRegistry::default(),
            RateLimiter::new_per_hour(),
            AuditLogger::new(Arc::new(FailingSink)),
        );
        let client = ClientInfo::default();

        let grant = gate.authorize(&request(Some("abc"), "site-info", &client)).await.unwrap();
        gate.record_completion(&grant, &client, "site_info", &json!({}), 200);

        let err = gate.authorize(&request(Some("xyz"), "site-info", &client)).await.unwrap_err();
        assert_eq!(err, DenyReason::InvalidCredential);
        let err = gate.authorize(&request(Some("abc"), "site-info", &client)).await.unwrap_err();
        assert!(matches!(err, DenyReason::RateLimitExceeded { .. }));
    }
}
