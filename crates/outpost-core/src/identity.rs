//! Identity & Policy Store - sender identities, verification and DKIM tokens

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use outpost_common::config::VerificationConfig;
use outpost_common::types::{EmailAddress, IdentityKind, VerificationStatus};
use outpost_common::{EntityKind, Error, Result};
use outpost_storage::{Identity, IdentityRepository};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;
use tracing::{debug, error, info, warn};

/// Number of DKIM tokens issued per domain
const DKIM_TOKEN_COUNT: usize = 3;

/// Result of looking for a domain's verification record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationCheck {
    Verified,
    NotFound,
    /// The lookup itself failed; the status is unknown
    LookupFailed(String),
}

/// Confirms that a domain publishes its verification token
#[async_trait]
pub trait VerificationChecker: Send + Sync {
    async fn check_domain(&self, domain: &str, token: &str) -> VerificationCheck;
}

/// Looks for the token in a TXT record at `<prefix>.<domain>`
pub struct DnsVerificationChecker {
    resolver: TokioAsyncResolver,
    prefix: String,
}

impl DnsVerificationChecker {
    pub fn new(prefix: impl Into<String>) -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            resolver,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl VerificationChecker for DnsVerificationChecker {
    async fn check_domain(&self, domain: &str, token: &str) -> VerificationCheck {
        let name = format!("{}.{}", self.prefix, domain);

        match self.resolver.txt_lookup(name.as_str()).await {
            Ok(lookup) => {
                let found = lookup.iter().any(|record| {
                    let txt = record
                        .txt_data()
                        .iter()
                        .map(|d| String::from_utf8_lossy(d))
                        .collect::<String>();
                    txt.trim() == token
                });
                debug!(domain, record = %name, found, "Verification record lookup");
                if found {
                    VerificationCheck::Verified
                } else {
                    VerificationCheck::NotFound
                }
            }
            Err(e) => {
                if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    VerificationCheck::NotFound
                } else {
                    VerificationCheck::LookupFailed(e.to_string())
                }
            }
        }
    }
}

/// Verification and DKIM state of one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationAttributes {
    pub verification_status: VerificationStatus,
    pub verification_token: Option<String>,
    pub dkim_enabled: bool,
    pub dkim_tokens: Vec<String>,
}

impl From<&Identity> for VerificationAttributes {
    fn from(identity: &Identity) -> Self {
        Self {
            verification_status: identity.status,
            verification_token: identity.verification_token.clone(),
            dkim_enabled: identity.dkim_enabled,
            dkim_tokens: identity.dkim_tokens.clone(),
        }
    }
}

/// Owns identity lifecycle; statuses change only through verification
pub struct IdentityStore {
    repo: Arc<dyn IdentityRepository>,
    checker: Arc<dyn VerificationChecker>,
    config: VerificationConfig,
}

impl IdentityStore {
    pub fn new(
        repo: Arc<dyn IdentityRepository>,
        checker: Arc<dyn VerificationChecker>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            repo,
            checker,
            config,
        }
    }

    /// Register an email address; it stays `Pending` until confirmed
    pub async fn verify_email(&self, address: &str) -> Result<Identity> {
        let email = EmailAddress::parse(address)
            .ok_or_else(|| Error::InvalidParameter(format!("invalid email address: {}", address)))?;
        let identity = self
            .repo
            .create(Identity::pending(
                &email.normalized(),
                IdentityKind::EmailAddress,
                Some(confirmation_token()),
            ))
            .await?;
        info!(identity = %identity.value, "Email identity verification started");
        Ok(identity)
    }

    /// Confirm an email identity with the token sent to the mailbox
    pub async fn confirm_email(&self, address: &str, token: &str) -> Result<Identity> {
        let identity = self.require(address).await?;
        if identity.kind != IdentityKind::EmailAddress {
            return Err(Error::InvalidParameter(format!(
                "{} is not an email address identity",
                identity.value
            )));
        }
        if identity.is_verified() {
            return Ok(identity);
        }
        if identity.verification_token.as_deref() != Some(token) {
            return Err(Error::InvalidParameter("verification token does not match".into()));
        }

        let identity = self
            .repo
            .set_status(&identity.value, VerificationStatus::Success)
            .await?;
        info!(identity = %identity.value, "Email identity verified");
        Ok(identity)
    }

    /// Register a domain and return the TXT token that proves control of it
    pub async fn verify_domain(&self, domain: &str) -> Result<String> {
        let domain = validate_domain(domain)?;
        let mut raw = [0u8; 32];
        rand::rng().fill(&mut raw);
        let token = BASE64.encode(raw);

        self.repo
            .create(Identity::pending(&domain, IdentityKind::Domain, Some(token.clone())))
            .await?;
        info!(
            identity = %domain,
            record = %format!("{}.{}", self.config.txt_record_prefix, domain),
            "Domain identity verification started"
        );
        Ok(token)
    }

    /// DKIM tokens for a domain, generated on first request
    pub async fn verify_domain_dkim(&self, domain: &str) -> Result<Vec<String>> {
        let identity = self.require(domain).await?;
        if identity.kind != IdentityKind::Domain {
            return Err(Error::InvalidParameter(format!(
                "{} is not a domain identity",
                identity.value
            )));
        }
        if !identity.dkim_tokens.is_empty() {
            return Ok(identity.dkim_tokens);
        }

        let tokens: Vec<String> = (0..DKIM_TOKEN_COUNT).map(|_| dkim_token()).collect();
        let identity = self.repo.set_dkim_tokens(&identity.value, tokens).await?;
        info!(identity = %identity.value, "DKIM tokens generated");
        Ok(identity.dkim_tokens)
    }

    /// Toggle DKIM signing; enabling needs tokens on the (owning) domain
    pub async fn set_dkim_enabled(&self, value: &str, enabled: bool) -> Result<Identity> {
        let identity = self.require(value).await?;

        if enabled {
            let has_tokens = match identity.kind {
                IdentityKind::Domain => !identity.dkim_tokens.is_empty(),
                IdentityKind::EmailAddress => {
                    let domain = identity.value.rsplit_once('@').map(|(_, d)| d).unwrap_or("");
                    self.repo
                        .get(domain)
                        .await?
                        .map(|d| !d.dkim_tokens.is_empty())
                        .unwrap_or(false)
                }
            };
            if !has_tokens {
                return Err(Error::InvalidParameter(format!(
                    "DKIM tokens have not been generated for {}",
                    identity.value
                )));
            }
        }

        self.repo.set_dkim_enabled(&identity.value, enabled).await
    }

    /// Attributes of each known identity among `values`; unknown ones are omitted
    pub async fn verification_attributes(
        &self,
        values: &[String],
    ) -> Result<BTreeMap<String, VerificationAttributes>> {
        let mut attributes = BTreeMap::new();
        for value in values {
            if let Some(identity) = self.repo.get(&value.to_lowercase()).await? {
                attributes.insert(identity.value.clone(), VerificationAttributes::from(&identity));
            }
        }
        Ok(attributes)
    }

    pub async fn list(&self, kind: Option<IdentityKind>) -> Result<Vec<String>> {
        Ok(self
            .repo
            .list(kind)
            .await?
            .into_iter()
            .map(|i| i.value)
            .collect())
    }

    /// Remove an identity. Cascading to in-flight messages is the caller's job.
    pub async fn delete(&self, value: &str) -> Result<Identity> {
        let identity = self.repo.delete(&value.to_lowercase()).await?;
        info!(identity = %identity.value, "Identity deleted");
        Ok(identity)
    }

    /// Identities that could authorize `sender`: the address and its domain
    pub async fn sender_identities(&self, sender: &EmailAddress) -> Result<Vec<Identity>> {
        let mut identities = Vec::with_capacity(2);
        if let Some(identity) = self.repo.get(&sender.normalized()).await? {
            identities.push(identity);
        }
        if let Some(identity) = self.repo.get(&sender.domain).await? {
            identities.push(identity);
        }
        Ok(identities)
    }

    /// Whether a verified identity currently covers `sender`
    pub async fn authorizes(&self, sender: &str) -> Result<bool> {
        let Some(address) = EmailAddress::parse(sender) else {
            return Ok(false);
        };
        let normalized = address.normalized();
        Ok(self
            .sender_identities(&address)
            .await?
            .iter()
            .any(|identity| identity.is_verified() && identity.covers(&normalized)))
    }

    pub async fn verified(&self) -> Result<Vec<Identity>> {
        self.repo.list_by_status(VerificationStatus::Success).await
    }

    /// One verification pass over unverified identities; returns how many changed
    pub async fn poll_once(&self) -> Result<usize> {
        let mut candidates = self.repo.list_by_status(VerificationStatus::Pending).await?;
        candidates.extend(
            self.repo
                .list_by_status(VerificationStatus::TemporaryFailure)
                .await?,
        );

        let expiry = Duration::hours(self.config.pending_expiry_hours);
        let now = Utc::now();
        let mut changed = 0;

        for identity in candidates {
            let expired = now - identity.created_at > expiry;
            let next = match identity.kind {
                IdentityKind::EmailAddress => expired.then_some(VerificationStatus::Failed),
                IdentityKind::Domain => {
                    let Some(token) = identity.verification_token.as_deref() else {
                        continue;
                    };
                    match self.checker.check_domain(&identity.value, token).await {
                        VerificationCheck::Verified => Some(VerificationStatus::Success),
                        _ if expired => Some(VerificationStatus::Failed),
                        VerificationCheck::NotFound => None,
                        VerificationCheck::LookupFailed(reason) => {
                            warn!(identity = %identity.value, "Verification lookup failed: {}", reason);
                            Some(VerificationStatus::TemporaryFailure)
                        }
                    }
                }
            };

            if let Some(status) = next.filter(|s| *s != identity.status) {
                match self.repo.set_status(&identity.value, status).await {
                    Ok(_) => {
                        info!(identity = %identity.value, %status, "Identity verification status changed");
                        changed += 1;
                    }
                    Err(e) => {
                        warn!(identity = %identity.value, "Failed to record verification status: {}", e);
                    }
                }
            }
        }

        Ok(changed)
    }

    /// Run the verification poller until shutdown
    pub async fn run_poller(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(std::time::Duration::from_secs(
            self.config.poll_interval_secs.max(1),
        ));

        info!(
            "Verification poller started (interval: {}s)",
            self.config.poll_interval_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(0) => {}
                        Ok(changed) => debug!(changed, "Verification pass complete"),
                        Err(e) => error!("Verification pass failed: {}", e),
                    }
                }
            }
        }

        info!("Verification poller stopped");
    }

    async fn require(&self, value: &str) -> Result<Identity> {
        self.repo
            .get(&value.to_lowercase())
            .await?
            .ok_or_else(|| Error::does_not_exist(EntityKind::Identity, value))
    }
}

/// Token mailed to an address owner
fn confirmation_token() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Lower-case hex, usable as a DNS label
fn dkim_token() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill(&mut raw);
    hex::encode(raw)
}

pub(crate) fn validate_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().to_lowercase();
    let labels: Vec<&str> = domain.split('.').collect();
    let valid = labels.len() >= 2
        && labels.iter().all(|l| {
            !l.is_empty()
                && l.len() <= 63
                && !l.starts_with('-')
                && !l.ends_with('-')
                && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !valid {
        return Err(Error::InvalidParameter(format!("invalid domain: {}", domain)));
    }
    Ok(domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_storage::memory::MemoryIdentityRepository;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    /// Answers from a fixed table; unknown domains are NotFound
    #[derive(Default)]
    struct StaticChecker {
        answers: Mutex<HashMap<String, VerificationCheck>>,
    }

    impl StaticChecker {
        fn answer(&self, domain: &str, check: VerificationCheck) {
            self.answers.lock().insert(domain.to_string(), check);
        }
    }

    #[async_trait]
    impl VerificationChecker for StaticChecker {
        async fn check_domain(&self, domain: &str, _token: &str) -> VerificationCheck {
            self.answers
                .lock()
                .get(domain)
                .cloned()
                .unwrap_or(VerificationCheck::NotFound)
        }
    }

    fn store() -> (IdentityStore, Arc<StaticChecker>) {
        let checker = Arc::new(StaticChecker::default());
        let store = IdentityStore::new(
            Arc::new(MemoryIdentityRepository::new()),
            checker.clone(),
            VerificationConfig::default(),
        );
        (store, checker)
    }

    #[tokio::test]
    async fn test_email_verification_flow() {
        let (store, _) = store();
        let identity = store.verify_email("Sender@Example.com").await.unwrap();
        assert_eq!(identity.value, "sender@example.com");
        assert_eq!(identity.status, VerificationStatus::Pending);

        let err = store.verify_email("sender@example.com").await.unwrap_err();
        assert_eq!(err.code(), "IdentityAlreadyExists");

        assert!(store.confirm_email("sender@example.com", "wrong").await.is_err());

        let token = identity.verification_token.unwrap();
        let confirmed = store.confirm_email("SENDER@example.com", &token).await.unwrap();
        assert!(confirmed.is_verified());
    }

    #[tokio::test]
    async fn test_domain_verified_by_poller() {
        let (store, checker) = store();
        let token = store.verify_domain("Example.COM").await.unwrap();
        assert!(!token.is_empty());

        assert_eq!(store.poll_once().await.unwrap(), 0);

        checker.answer("example.com", VerificationCheck::LookupFailed("SERVFAIL".into()));
        assert_eq!(store.poll_once().await.unwrap(), 1);
        let attrs = store
            .verification_attributes(&["example.com".to_string()])
            .await
            .unwrap();
        assert_eq!(
            attrs["example.com"].verification_status,
            VerificationStatus::TemporaryFailure
        );

        checker.answer("example.com", VerificationCheck::Verified);
        assert_eq!(store.poll_once().await.unwrap(), 1);
        let attrs = store
            .verification_attributes(&["example.com".to_string(), "unknown.org".to_string()])
            .await
            .unwrap();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs["example.com"].verification_status, VerificationStatus::Success);
    }

    #[tokio::test]
    async fn test_expired_pending_identity_fails() {
        let checker = Arc::new(StaticChecker::default());
        let store = IdentityStore::new(
            Arc::new(MemoryIdentityRepository::new()),
            checker,
            VerificationConfig {
                pending_expiry_hours: -1,
                ..Default::default()
            },
        );
        store.verify_email("late@example.com").await.unwrap();
        store.verify_domain("late.example").await.unwrap();

        assert_eq!(store.poll_once().await.unwrap(), 2);
        let attrs = store
            .verification_attributes(&["late@example.com".to_string(), "late.example".to_string()])
            .await
            .unwrap();
        assert!(attrs
            .values()
            .all(|a| a.verification_status == VerificationStatus::Failed));
    }

    #[tokio::test]
    async fn test_dkim_tokens_are_stable() {
        let (store, _) = store();
        store.verify_domain("example.com").await.unwrap();

        let err = store.set_dkim_enabled("example.com", true).await.unwrap_err();
        assert_eq!(err.code(), "InvalidParameterValue");

        let tokens = store.verify_domain_dkim("example.com").await.unwrap();
        assert_eq!(tokens.len(), DKIM_TOKEN_COUNT);
        assert_eq!(store.verify_domain_dkim("example.com").await.unwrap(), tokens);

        let identity = store.set_dkim_enabled("example.com", true).await.unwrap();
        assert!(identity.dkim_enabled);

        let err = store.verify_domain_dkim("missing.com").await.unwrap_err();
        assert_eq!(err.code(), "IdentityDoesNotExist");
    }

    #[tokio::test]
    async fn test_sender_identities() {
        let (store, checker) = store();
        store.verify_domain("example.com").await.unwrap();
        store.verify_email("ops@example.com").await.unwrap();
        checker.answer("example.com", VerificationCheck::Verified);
        store.poll_once().await.unwrap();

        let sender = EmailAddress::parse("Ops@Example.com").unwrap();
        let identities = store.sender_identities(&sender).await.unwrap();
        assert_eq!(identities.len(), 2);
        assert!(identities.iter().any(|i| i.is_verified() && i.covers("ops@example.com")));

        assert!(store.authorizes("anyone@example.com").await.unwrap());
        assert!(!store.authorizes("anyone@other.org").await.unwrap());
        assert!(!store.authorizes("not an address").await.unwrap());
        store.delete("example.com").await.unwrap();
        assert!(!store.authorizes("anyone@example.com").await.unwrap());

        assert_eq!(store.list(None).await.unwrap(), vec!["ops@example.com"]);
        assert!(store
            .list(Some(IdentityKind::Domain))
            .await
            .unwrap()
            .is_empty());
    }

    /// Memory repository whose status writes fail for one identity
    struct FlakyRepository {
        inner: MemoryIdentityRepository,
        broken: String,
    }

    #[async_trait]
    impl IdentityRepository for FlakyRepository {
        async fn create(&self, identity: Identity) -> Result<Identity> {
            self.inner.create(identity).await
        }
        async fn get(&self, value: &str) -> Result<Option<Identity>> {
            self.inner.get(value).await
        }
        async fn list(&self, kind: Option<IdentityKind>) -> Result<Vec<Identity>> {
            self.inner.list(kind).await
        }
        async fn list_by_status(&self, status: VerificationStatus) -> Result<Vec<Identity>> {
            self.inner.list_by_status(status).await
        }
        async fn set_status(&self, value: &str, status: VerificationStatus) -> Result<Identity> {
            if value == self.broken {
                return Err(Error::does_not_exist(EntityKind::Identity, value));
            }
            self.inner.set_status(value, status).await
        }
        async fn set_dkim_tokens(&self, value: &str, tokens: Vec<String>) -> Result<Identity> {
            self.inner.set_dkim_tokens(value, tokens).await
        }
        async fn set_dkim_enabled(&self, value: &str, enabled: bool) -> Result<Identity> {
            self.inner.set_dkim_enabled(value, enabled).await
        }
        async fn delete(&self, value: &str) -> Result<Identity> {
            self.inner.delete(value).await
        }
    }

    #[tokio::test]
    async fn test_failed_status_write_does_not_stop_the_pass() {
        let checker = Arc::new(StaticChecker::default());
        let store = IdentityStore::new(
            Arc::new(FlakyRepository {
                inner: MemoryIdentityRepository::new(),
                broken: "a.example".into(),
            }),
            checker.clone(),
            VerificationConfig::default(),
        );
        store.verify_domain("a.example").await.unwrap();
        store.verify_domain("b.example").await.unwrap();
        checker.answer("a.example", VerificationCheck::Verified);
        checker.answer("b.example", VerificationCheck::Verified);

        assert_eq!(store.poll_once().await.unwrap(), 1);
        let attrs = store
            .verification_attributes(&["a.example".to_string(), "b.example".to_string()])
            .await
            .unwrap();
        assert_eq!(attrs["a.example"].verification_status, VerificationStatus::Pending);
        assert_eq!(attrs["b.example"].verification_status, VerificationStatus::Success);
    }

    #[test]
    fn test_tokens() {
        let token = confirmation_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, confirmation_token());

        let dkim = dkim_token();
        assert_eq!(dkim.len(), 32);
        assert!(dkim.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_validate_domain() {
        assert_eq!(validate_domain(" Mail.Example.com ").unwrap(), "mail.example.com");
        assert!(validate_domain("localhost").is_err());
        assert!(validate_domain("bad..example.com").is_err());
        assert!(validate_domain("-bad.example.com").is_err());
        assert!(validate_domain("spa ce.com").is_err());
    }
}
