//! Service-to-service authentication: certificates, signatures, ACLs.
//!
//! Each service gets an Ed25519 key pair with a bounded validity window.
//! Requests are signed with the private key and verified against the
//! stored public key; access-control entries allow or deny calls between
//! service pairs. The sign/verify contract is cryptographically real but
//! is not bound to any transport handshake; an implementation targeting
//! real mTLS should treat this module as a pluggable identity provider.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A per-service identity with its key pair.
#[derive(Debug)]
struct ServiceCertificate {
    service_name: String,
    signing_key: SigningKey,
    issued_at_ms: u64,
    expires_at_ms: u64,
    rotation_scheduled: bool,
}

impl ServiceCertificate {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Public view of a certificate. Never carries the private key.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateInfo {
    pub service_id: String,
    pub service_name: String,
    /// Base64-encoded Ed25519 public key.
    pub public_key: String,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
    pub rotation_scheduled: bool,
}

/// An allow/deny entry between a calling and a called service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclEntry {
    /// Calling service.
    pub source: String,
    /// Called service.
    pub target: String,
    /// Whether the pair is allowed at all.
    pub allowed: bool,
    /// Granted permissions. Empty means all permissions.
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl AclEntry {
    /// Creates an allow entry.
    pub fn allow(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            allowed: true,
            permissions: Vec::new(),
        }
    }

    /// Creates a deny entry.
    pub fn deny(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            allowed: false,
            permissions: Vec::new(),
        }
    }

    /// Grants a named permission.
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }
}

/// Statistics about authentication activity.
#[derive(Debug, Clone, Serialize)]
pub struct AuthStats {
    pub certificates_issued: u64,
    pub certificates_rotated: u64,
    pub rotation_flags: u64,
    pub requests_signed: u64,
    pub sign_failures: u64,
    pub requests_verified: u64,
    pub verification_failures: u64,
    pub expired_rejections: u64,
    pub acl_denials: u64,
    pub certificates: usize,
    pub acl_entries: usize,
}

/// Authenticator holding certificates and the ACL table.
///
/// ACL entries are keyed by the `(source, target)` pair.
pub struct ServiceAuthenticator {
    certificates: DashMap<String, ServiceCertificate>,
    acls: DashMap<(String, String), AclEntry>,
    validity: Duration,
    certificates_issued: AtomicU64,
    certificates_rotated: AtomicU64,
    rotation_flags: AtomicU64,
    requests_signed: AtomicU64,
    sign_failures: AtomicU64,
    requests_verified: AtomicU64,
    verification_failures: AtomicU64,
    expired_rejections: AtomicU64,
    acl_denials: AtomicU64,
}

impl ServiceAuthenticator {
    /// Creates an authenticator issuing certificates with the given validity.
    pub fn new(validity: Duration) -> Self {
        Self {
            certificates: DashMap::new(),
            acls: DashMap::new(),
            validity,
            certificates_issued: AtomicU64::new(0),
            certificates_rotated: AtomicU64::new(0),
            rotation_flags: AtomicU64::new(0),
            requests_signed: AtomicU64::new(0),
            sign_failures: AtomicU64::new(0),
            requests_verified: AtomicU64::new(0),
            verification_failures: AtomicU64::new(0),
            expired_rejections: AtomicU64::new(0),
            acl_denials: AtomicU64::new(0),
        }
    }

    /// Creates an authenticator with the default 90-day validity window.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(90 * 86_400))
    }

    fn fresh_key() -> SigningKey {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        SigningKey::from_bytes(&seed)
    }

    fn info_for(&self, service_id: &str, cert: &ServiceCertificate) -> CertificateInfo {
        CertificateInfo {
            service_id: service_id.to_string(),
            service_name: cert.service_name.clone(),
            public_key: BASE64.encode(cert.signing_key.verifying_key().as_bytes()),
            issued_at_ms: cert.issued_at_ms,
            expires_at_ms: cert.expires_at_ms,
            rotation_scheduled: cert.rotation_scheduled,
        }
    }

    /// Issues a certificate for a service, replacing any existing one.
    pub fn issue_certificate(
        &self,
        service_id: impl Into<String>,
        service_name: impl Into<String>,
    ) -> CertificateInfo {
        let service_id = service_id.into();
        let now = epoch_ms();
        let cert = ServiceCertificate {
            service_name: service_name.into(),
            signing_key: Self::fresh_key(),
            issued_at_ms: now,
            expires_at_ms: now + self.validity.as_millis() as u64,
            rotation_scheduled: false,
        };

        info!(
            service = %cert.service_name,
            service_id = %service_id,
            expires_at_ms = cert.expires_at_ms,
            "certificate issued"
        );

        let info = self.info_for(&service_id, &cert);
        self.certificates.insert(service_id, cert);
        self.certificates_issued.fetch_add(1, Ordering::Relaxed);
        info
    }

    /// Rotates a service's key pair, resetting the validity window.
    ///
    /// Returns `None` if the service has no certificate.
    pub fn rotate_certificate(&self, service_id: &str) -> Option<CertificateInfo> {
        let mut cert = self.certificates.get_mut(service_id)?;
        let now = epoch_ms();

        cert.signing_key = Self::fresh_key();
        cert.issued_at_ms = now;
        cert.expires_at_ms = now + self.validity.as_millis() as u64;
        cert.rotation_scheduled = false;
        self.certificates_rotated.fetch_add(1, Ordering::Relaxed);

        info!(service_id = %service_id, "certificate rotated");
        Some(self.info_for(service_id, &cert))
    }

    /// Signs a payload with a service's private key.
    ///
    /// Returns `None` if the service has no certificate or it expired.
    pub fn sign_request(&self, service_id: &str, payload: &[u8]) -> Option<String> {
        let Some(cert) = self.certificates.get(service_id) else {
            self.sign_failures.fetch_add(1, Ordering::Relaxed);
            debug!(service_id = %service_id, "sign failed: no certificate");
            return None;
        };

        if cert.is_expired(epoch_ms()) {
            self.sign_failures.fetch_add(1, Ordering::Relaxed);
            self.expired_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(service_id = %service_id, "sign failed: certificate expired");
            return None;
        }

        let signature = cert.signing_key.sign(payload);
        self.requests_signed.fetch_add(1, Ordering::Relaxed);
        Some(BASE64.encode(signature.to_bytes()))
    }

    /// Verifies a payload signature made by the source service.
    ///
    /// Expired certificates always fail verification.
    pub fn verify_request(&self, source_service_id: &str, payload: &[u8], signature: &str) -> bool {
        let Some(cert) = self.certificates.get(source_service_id) else {
            self.verification_failures.fetch_add(1, Ordering::Relaxed);
            debug!(service_id = %source_service_id, "verify failed: no certificate");
            return false;
        };

        if cert.is_expired(epoch_ms()) {
            self.verification_failures.fetch_add(1, Ordering::Relaxed);
            self.expired_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(service_id = %source_service_id, "verify failed: certificate expired");
            return false;
        }

        let Ok(sig_bytes) = BASE64.decode(signature) else {
            self.verification_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let Ok(signature) = Signature::from_slice(&sig_bytes) else {
            self.verification_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let ok = cert
            .signing_key
            .verifying_key()
            .verify(payload, &signature)
            .is_ok();

        if ok {
            self.requests_verified.fetch_add(1, Ordering::Relaxed);
        } else {
            self.verification_failures.fetch_add(1, Ordering::Relaxed);
            debug!(service_id = %source_service_id, "verify failed: bad signature");
        }

        ok
    }

    /// Adds or replaces an ACL entry.
    pub fn add_acl(&self, entry: AclEntry) {
        debug!(
            source = %entry.source,
            target = %entry.target,
            allowed = entry.allowed,
            "acl entry added"
        );
        self.acls
            .insert((entry.source.clone(), entry.target.clone()), entry);
    }

    /// Removes an ACL entry. Returns `false` if absent.
    pub fn remove_acl(&self, source: &str, target: &str) -> bool {
        self.acls
            .remove(&(source.to_string(), target.to_string()))
            .is_some()
    }

    /// Checks whether a source may call a target.
    ///
    /// Default-allow: a pair without an entry is permitted. An entry
    /// denies when its allow flag is false, or when a named permission is
    /// requested and the entry's non-empty permission list omits it.
    pub fn check_acl(&self, source: &str, target: &str, permission: Option<&str>) -> bool {
        let key = (source.to_string(), target.to_string());
        let Some(entry) = self.acls.get(&key) else {
            return true;
        };

        let allowed = entry.allowed
            && match permission {
                Some(p) => entry.permissions.is_empty() || entry.permissions.iter().any(|x| x == p),
                None => true,
            };

        if !allowed {
            self.acl_denials.fetch_add(1, Ordering::Relaxed);
            debug!(
                source = %source,
                target = %target,
                permission = permission.unwrap_or("-"),
                "acl denied"
            );
        }

        allowed
    }

    /// Verifies a signed request and checks the ACL in one step.
    pub fn authenticate_request(
        &self,
        source_service_id: &str,
        target_service: &str,
        payload: &[u8],
        signature: &str,
        permission: Option<&str>,
    ) -> bool {
        self.verify_request(source_service_id, payload, signature)
            && self.check_acl(source_service_id, target_service, permission)
    }

    /// Flags certificates expiring within the threshold for rotation.
    ///
    /// Does not rotate anything; rotation stays a caller-triggered
    /// action. Returns the number of newly flagged certificates.
    pub fn scan_rotations(&self, threshold: Duration) -> usize {
        let now = epoch_ms();
        let threshold_ms = threshold.as_millis() as u64;
        let mut flagged = 0;

        for mut entry in self.certificates.iter_mut() {
            let cert = entry.value_mut();
            if !cert.rotation_scheduled && cert.expires_at_ms.saturating_sub(now) <= threshold_ms {
                cert.rotation_scheduled = true;
                flagged += 1;
                self.rotation_flags.fetch_add(1, Ordering::Relaxed);
                warn!(
                    service = %cert.service_name,
                    expires_at_ms = cert.expires_at_ms,
                    "certificate flagged for rotation"
                );
            }
        }

        flagged
    }

    /// Returns the public view of a service's certificate.
    pub fn certificate_info(&self, service_id: &str) -> Option<CertificateInfo> {
        self.certificates
            .get(service_id)
            .map(|cert| self.info_for(service_id, &cert))
    }

    /// Returns authentication statistics.
    pub fn stats(&self) -> AuthStats {
        AuthStats {
            certificates_issued: self.certificates_issued.load(Ordering::Relaxed),
            certificates_rotated: self.certificates_rotated.load(Ordering::Relaxed),
            rotation_flags: self.rotation_flags.load(Ordering::Relaxed),
            requests_signed: self.requests_signed.load(Ordering::Relaxed),
            sign_failures: self.sign_failures.load(Ordering::Relaxed),
            requests_verified: self.requests_verified.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
            expired_rejections: self.expired_rejections.load(Ordering::Relaxed),
            acl_denials: self.acl_denials.load(Ordering::Relaxed),
            certificates: self.certificates.len(),
            acl_entries: self.acls.len(),
        }
    }

    /// Resets activity counters. Certificates and ACLs are untouched.
    pub fn reset_stats(&self) {
        self.certificates_issued.store(0, Ordering::Relaxed);
        self.certificates_rotated.store(0, Ordering::Relaxed);
        self.rotation_flags.store(0, Ordering::Relaxed);
        self.requests_signed.store(0, Ordering::Relaxed);
        self.sign_failures.store(0, Ordering::Relaxed);
        self.requests_verified.store(0, Ordering::Relaxed);
        self.verification_failures.store(0, Ordering::Relaxed);
        self.expired_rejections.store(0, Ordering::Relaxed);
        self.acl_denials.store(0, Ordering::Relaxed);
    }
}

impl Default for ServiceAuthenticator {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_certificate() {
        let auth = ServiceAuthenticator::with_defaults();
        let info = auth.issue_certificate("payments", "payments");

        assert_eq!(info.service_id, "payments");
        assert!(!info.public_key.is_empty());
        assert!(info.expires_at_ms > info.issued_at_ms);
        assert!(!info.rotation_scheduled);
        assert_eq!(auth.stats().certificates_issued, 1);
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let auth = ServiceAuthenticator::with_defaults();
        auth.issue_certificate("payments", "payments");

        let signature = auth.sign_request("payments", b"charge:42").unwrap();
        assert!(auth.verify_request("payments", b"charge:42", &signature));

        // Tampered payload fails.
        assert!(!auth.verify_request("payments", b"charge:43", &signature));
        assert_eq!(auth.stats().verification_failures, 1);
    }

    #[test]
    fn test_sign_without_certificate() {
        let auth = ServiceAuthenticator::with_defaults();
        assert!(auth.sign_request("ghost", b"payload").is_none());
        assert!(!auth.verify_request("ghost", b"payload", "c2ln"));
        assert_eq!(auth.stats().sign_failures, 1);
    }

    #[test]
    fn test_expired_certificate_rejected() {
        let auth = ServiceAuthenticator::new(Duration::ZERO);
        auth.issue_certificate("payments", "payments");

        assert!(auth.sign_request("payments", b"payload").is_none());
        assert!(!auth.verify_request("payments", b"payload", "c2ln"));

        let stats = auth.stats();
        assert!(stats.expired_rejections >= 2);
    }

    #[test]
    fn test_verify_rejects_garbage_signature() {
        let auth = ServiceAuthenticator::with_defaults();
        auth.issue_certificate("payments", "payments");

        assert!(!auth.verify_request("payments", b"payload", "not base64!!"));
        assert!(!auth.verify_request("payments", b"payload", "c2hvcnQ="));
    }

    #[test]
    fn test_rotate_certificate() {
        let auth = ServiceAuthenticator::with_defaults();
        let before = auth.issue_certificate("payments", "payments");

        auth.scan_rotations(Duration::from_secs(91 * 86_400));
        assert!(auth.certificate_info("payments").unwrap().rotation_scheduled);

        let after = auth.rotate_certificate("payments").unwrap();
        assert_ne!(before.public_key, after.public_key);
        assert!(!after.rotation_scheduled);

        assert!(auth.rotate_certificate("ghost").is_none());
    }

    #[test]
    fn test_rotation_scan_flags_once() {
        let auth = ServiceAuthenticator::new(Duration::from_secs(86_400));
        auth.issue_certificate("payments", "payments");
        auth.issue_certificate("orders", "orders");

        let flagged = auth.scan_rotations(Duration::from_secs(7 * 86_400));
        assert_eq!(flagged, 2);

        // Already flagged certificates are not re-counted.
        assert_eq!(auth.scan_rotations(Duration::from_secs(7 * 86_400)), 0);
        assert_eq!(auth.stats().rotation_flags, 2);
    }

    #[test]
    fn test_rotation_scan_ignores_distant_expiry() {
        let auth = ServiceAuthenticator::with_defaults();
        auth.issue_certificate("payments", "payments");

        assert_eq!(auth.scan_rotations(Duration::from_secs(7 * 86_400)), 0);
    }

    #[test]
    fn test_acl_default_allow_and_explicit_deny() {
        let auth = ServiceAuthenticator::with_defaults();

        assert!(auth.check_acl("checkout", "payments", None));

        auth.add_acl(AclEntry::deny("checkout", "payments"));
        assert!(!auth.check_acl("checkout", "payments", None));
        assert_eq!(auth.stats().acl_denials, 1);

        assert!(auth.remove_acl("checkout", "payments"));
        assert!(auth.check_acl("checkout", "payments", None));
        assert!(!auth.remove_acl("checkout", "payments"));
    }

    #[test]
    fn test_acl_permissions() {
        let auth = ServiceAuthenticator::with_defaults();
        auth.add_acl(AclEntry::allow("checkout", "payments").with_permission("charge"));

        assert!(auth.check_acl("checkout", "payments", None));
        assert!(auth.check_acl("checkout", "payments", Some("charge")));
        assert!(!auth.check_acl("checkout", "payments", Some("refund")));

        // Empty permission list grants everything.
        auth.add_acl(AclEntry::allow("checkout", "orders"));
        assert!(auth.check_acl("checkout", "orders", Some("anything")));
    }

    #[test]
    fn test_authenticate_request_composes() {
        let auth = ServiceAuthenticator::with_defaults();
        auth.issue_certificate("checkout", "checkout");

        let signature = auth.sign_request("checkout", b"payload").unwrap();
        assert!(auth.authenticate_request("checkout", "payments", b"payload", &signature, None));

        auth.add_acl(AclEntry::deny("checkout", "payments"));
        assert!(!auth.authenticate_request("checkout", "payments", b"payload", &signature, None));
    }
}
