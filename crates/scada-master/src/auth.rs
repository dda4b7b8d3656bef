//! ---
//! scada_section: "06-security-access-control"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use scada_common::{ErrorKind, ServiceError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

const MAX_FAILURES: u32 = 5;
const FAILURE_WINDOW_MINUTES: i64 = 15;
const LOCKOUT_MINUTES: i64 = 15;

/// Operator role. Every user carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only access.
    Viewer,
    /// Viewer plus alarm acknowledgement and SBO control.
    Operator,
    /// Operator plus isolation and the security console.
    Engineer,
    /// Engineer plus user management, blocking, and the audit log.
    Admin,
}

/// Operations gated by the permission matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Read the grid overview.
    ReadGrid,
    /// Read node records and telemetry.
    ReadNodes,
    /// Read alarms.
    ReadAlarms,
    /// Read historian-backed telemetry queries.
    ReadHistorian,
    /// Acknowledge an alarm.
    AcknowledgeAlarm,
    /// SBO select/operate/cancel.
    ControlBreaker,
    /// Isolate a node.
    IsolateNode,
    /// View the security console.
    ViewSecurity,
    /// Manage user accounts.
    ManageUsers,
    /// Block a client address grid-wide.
    BlockIp,
    /// View the audit log.
    ViewAudit,
}

impl Role {
    /// Fixed role→permission matrix.
    pub fn permissions(self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Role::Viewer => &[ReadGrid, ReadNodes, ReadAlarms, ReadHistorian],
            Role::Operator => &[
                ReadGrid,
                ReadNodes,
                ReadAlarms,
                ReadHistorian,
                AcknowledgeAlarm,
                ControlBreaker,
            ],
            Role::Engineer => &[
                ReadGrid,
                ReadNodes,
                ReadAlarms,
                ReadHistorian,
                AcknowledgeAlarm,
                ControlBreaker,
                IsolateNode,
                ViewSecurity,
            ],
            Role::Admin => &[
                ReadGrid,
                ReadNodes,
                ReadAlarms,
                ReadHistorian,
                AcknowledgeAlarm,
                ControlBreaker,
                IsolateNode,
                ViewSecurity,
                ManageUsers,
                BlockIp,
                ViewAudit,
            ],
        }
    }

    /// Whether the role grants the permission.
    pub fn allows(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Engineer => "engineer",
            Role::Admin => "admin",
        }
    }
}

/// Claims carried inside a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Username.
    pub sub: String,
    /// Role at issue time.
    pub role: Role,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Response body for a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The signed bearer token.
    pub access_token: String,
    /// Always `bearer`.
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

struct UserAccount {
    username: String,
    role: Role,
    salt: [u8; 16],
    password_hash: String,
    failures: Vec<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
}

fn hash_password(salt: &[u8; 16], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

impl UserAccount {
    fn new(username: &str, password: &str, role: Role) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let password_hash = hash_password(&salt, password);
        Self {
            username: username.to_string(),
            role,
            salt,
            password_hash,
            failures: Vec::new(),
            locked_until: None,
        }
    }
}

/// Token issuance and the authorisation gate.
///
/// Passwords are held only as salted SHA-256 digests (one 16-byte random
/// salt per user); plaintext is never stored. Tokens are
/// `base64url(claims).base64url(hmac_sha256(secret, claims))`.
pub struct AuthService {
    users: RwLock<HashMap<String, UserAccount>>,
    secret: Vec<u8>,
    lifetime: Duration,
}

impl AuthService {
    /// Create an empty service.
    pub fn new(secret: &str, lifetime: Duration) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            secret: secret.as_bytes().to_vec(),
            lifetime,
        }
    }

    /// Create the service with the standard seeded operator accounts.
    pub fn with_default_users(secret: &str, lifetime: Duration) -> Self {
        let service = Self::new(secret, lifetime);
        service.upsert_user("admin", "scada@2024", Role::Admin);
        service.upsert_user("operator1", "ops@2024", Role::Operator);
        service.upsert_user("engineer1", "eng@2024", Role::Engineer);
        service.upsert_user("viewer1", "view@2024", Role::Viewer);
        service
    }

    /// Create or replace a user account.
    pub fn upsert_user(&self, username: &str, password: &str, role: Role) {
        self.users
            .write()
            .insert(username.to_string(), UserAccount::new(username, password, role));
    }

    /// Verify credentials and issue a token.
    ///
    /// Five consecutive failures within fifteen minutes lock the account for
    /// fifteen minutes; attempts while locked fail without touching the
    /// counter window.
    pub fn login(&self, username: &str, password: &str) -> Result<TokenResponse, ServiceError> {
        let now = Utc::now();
        let mut users = self.users.write();
        let Some(user) = users.get_mut(username) else {
            return Err(ServiceError::new(ErrorKind::AuthFailure, "invalid credentials"));
        };

        if let Some(until) = user.locked_until {
            if now < until {
                warn!(username, "login attempt on locked account");
                return Err(ServiceError::new(
                    ErrorKind::AuthFailure,
                    "account temporarily locked",
                ));
            }
            user.locked_until = None;
            user.failures.clear();
        }

        if hash_password(&user.salt, password) != user.password_hash {
            let window_start = now - chrono::Duration::minutes(FAILURE_WINDOW_MINUTES);
            user.failures.retain(|at| *at >= window_start);
            user.failures.push(now);
            if user.failures.len() as u32 >= MAX_FAILURES {
                user.locked_until = Some(now + chrono::Duration::minutes(LOCKOUT_MINUTES));
                user.failures.clear();
                warn!(username, "account locked after repeated failures");
            }
            return Err(ServiceError::new(ErrorKind::AuthFailure, "invalid credentials"));
        }

        user.failures.clear();
        let claims = Claims {
            sub: user.username.clone(),
            role: user.role,
            iat: now.timestamp(),
            exp: now.timestamp() + self.lifetime.as_secs() as i64,
        };
        let token = self.sign(&claims)?;
        info!(username, role = user.role.as_str(), "token issued");
        Ok(TokenResponse {
            access_token: token,
            token_type: "bearer".to_string(),
            expires_in: self.lifetime.as_secs(),
        })
    }

    fn sign(&self, claims: &Claims) -> Result<String, ServiceError> {
        let payload = serde_json::to_vec(claims)
            .map_err(|_| ServiceError::new(ErrorKind::Internal, "claims serialization failed"))?;
        let payload_b64 = B64.encode(payload);
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| ServiceError::new(ErrorKind::Internal, "invalid signing key"))?;
        mac.update(payload_b64.as_bytes());
        let signature = B64.encode(mac.finalize().into_bytes());
        Ok(format!("{payload_b64}.{signature}"))
    }

    /// Verify a bearer token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, ServiceError> {
        let auth_failure = || ServiceError::new(ErrorKind::AuthFailure, "invalid or expired token");
        let (payload_b64, signature_b64) = token.split_once('.').ok_or_else(auth_failure)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| ServiceError::new(ErrorKind::Internal, "invalid signing key"))?;
        mac.update(payload_b64.as_bytes());
        let signature = B64.decode(signature_b64).map_err(|_| auth_failure())?;
        mac.verify_slice(&signature).map_err(|_| auth_failure())?;

        let payload = B64.decode(payload_b64).map_err(|_| auth_failure())?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| auth_failure())?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(auth_failure());
        }
        Ok(claims)
    }

    /// The authorisation gate wrapping every mutating call: verify the token,
    /// then check the role grants the permission.
    pub fn authorise(&self, token: &str, permission: Permission) -> Result<Claims, ServiceError> {
        let claims = self.verify(token)?;
        if !claims.role.allows(permission) {
            warn!(user = %claims.sub, role = claims.role.as_str(), ?permission, "permission denied");
            return Err(ServiceError::new(
                ErrorKind::PermissionDenied,
                "insufficient role for operation",
            ));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::with_default_users("test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn login_issues_verifiable_token() {
        let service = service();
        let token = service.login("admin", "scada@2024").unwrap();
        assert_eq!(token.token_type, "bearer");
        assert_eq!(token.expires_in, 3600);

        let claims = service.verify(&token.access_token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.role, Role::Admin);
    }

    #[test]
    fn wrong_password_fails_and_locks_after_five() {
        let service = service();
        for _ in 0..5 {
            assert!(service.login("operator1", "wrong").is_err());
        }
        // Correct password now fails too: the account is locked.
        let err = service.login("operator1", "ops@2024").unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthFailure);
        assert!(err.message.contains("locked"));
    }

    #[test]
    fn failures_below_threshold_do_not_lock() {
        let service = service();
        for _ in 0..4 {
            assert!(service.login("viewer1", "wrong").is_err());
        }
        assert!(service.login("viewer1", "view@2024").is_ok());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let service = service();
        let token = service.login("viewer1", "view@2024").unwrap().access_token;
        let mut forged = token.clone();
        forged.replace_range(0..2, "zz");
        assert!(service.verify(&forged).is_err());

        // Re-signing with another secret fails verification here.
        let other = AuthService::with_default_users("other-secret", Duration::from_secs(3600));
        let foreign = other.login("viewer1", "view@2024").unwrap().access_token;
        assert!(service.verify(&foreign).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let service = AuthService::with_default_users("test-secret", Duration::from_secs(0));
        let token = service.login("admin", "scada@2024").unwrap().access_token;
        assert!(service.verify(&token).is_err());
    }

    #[test]
    fn permission_matrix_matches_the_specification_table() {
        use Permission::*;
        assert!(Role::Viewer.allows(ReadGrid));
        assert!(!Role::Viewer.allows(AcknowledgeAlarm));
        assert!(!Role::Viewer.allows(ControlBreaker));

        assert!(Role::Operator.allows(AcknowledgeAlarm));
        assert!(Role::Operator.allows(ControlBreaker));
        assert!(!Role::Operator.allows(IsolateNode));
        assert!(!Role::Operator.allows(ViewSecurity));

        assert!(Role::Engineer.allows(IsolateNode));
        assert!(Role::Engineer.allows(ViewSecurity));
        assert!(!Role::Engineer.allows(BlockIp));
        assert!(!Role::Engineer.allows(ViewAudit));

        assert!(Role::Admin.allows(ManageUsers));
        assert!(Role::Admin.allows(BlockIp));
        assert!(Role::Admin.allows(ViewAudit));
    }

    #[test]
    fn authorise_distinguishes_auth_failure_from_denial() {
        let service = service();
        let viewer = service.login("viewer1", "view@2024").unwrap().access_token;

        let denied = service
            .authorise(&viewer, Permission::ControlBreaker)
            .unwrap_err();
        assert_eq!(denied.kind, ErrorKind::PermissionDenied);

        let bad = service
            .authorise("not-a-token", Permission::ReadGrid)
            .unwrap_err();
        assert_eq!(bad.kind, ErrorKind::AuthFailure);
    }
}
