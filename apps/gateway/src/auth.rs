//! Account registration and signed-session authentication.
//!
//! Passwords are bcrypt-hashed off the async runtime. Sessions are
//! HMAC-SHA256-signed claim tokens, carried either in the `dw_session`
//! cookie or as a bearer token. Admins are provisioned out of band via
//! the configured email allowlist, checked at registration time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::jobs::persist_json_state;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE_NAME: &str = "dw_session";
pub const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

/// The authenticated caller, as recovered from a verified session token.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub subject_id: String,
    pub email: String,
    pub role: Role,
}

impl AuthSession {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Public projection of an account; never carries the password hash.
#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub id: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    id: String,
    email: String,
    password_hash: String,
    role: Role,
    created_at: DateTime<Utc>,
}

impl UserRecord {
    fn view(&self) -> UserView {
        UserView {
            id: self.id.clone(),
            email: self.email.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("email is not valid")]
    InvalidEmail,

    #[error("password must be at least {MIN_PASSWORD_LENGTH} characters")]
    PasswordTooShort,

    #[error("an account with this email already exists")]
    EmailTaken,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("session token is missing or malformed")]
    TokenInvalid,

    #[error("session token has expired")]
    TokenExpired,

    #[error("password hashing failed: {message}")]
    Hashing { message: String },

    #[error("{message}")]
    Persistence { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    email: String,
    role: Role,
    exp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AuthState {
    /// Keyed by normalized (lowercased) email.
    users: HashMap<String, UserRecord>,
}

#[derive(Clone)]
pub struct AuthService {
    state: Arc<RwLock<AuthState>>,
    path: Option<PathBuf>,
    signing_key: Vec<u8>,
    session_ttl_seconds: u64,
    bcrypt_cost: u32,
    admin_emails: Vec<String>,
}

impl AuthService {
    pub fn from_config(config: &Config) -> Self {
        let path = config.auth_store_path.clone();
        let state = load_state(path.as_deref());
        Self {
            state: Arc::new(RwLock::new(state)),
            path,
            signing_key: config.session_signing_key.as_bytes().to_vec(),
            session_ttl_seconds: config.session_ttl_seconds,
            bcrypt_cost: config.bcrypt_cost,
            admin_emails: config.admin_emails.clone(),
        }
    }

    /// Creates an account. The role is decided here, once: emails on the
    /// admin allowlist become admins, everyone else a regular user.
    pub async fn register(&self, email: &str, password: &str) -> Result<UserView, AuthError> {
        let email = normalize_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AuthError::PasswordTooShort);
        }

        {
            let state = self.state.read().await;
            if state.users.contains_key(&email) {
                return Err(AuthError::EmailTaken);
            }
        }

        let password = password.to_string();
        let cost = self.bcrypt_cost;
        let password_hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|error| AuthError::Hashing {
                message: error.to_string(),
            })?
            .map_err(|error| AuthError::Hashing {
                message: error.to_string(),
            })?;

        let role = if self.admin_emails.contains(&email) {
            Role::Admin
        } else {
            Role::User
        };

        let record = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.clone(),
            password_hash,
            role,
            created_at: Utc::now(),
        };
        let view = record.view();

        let snapshot = {
            let mut state = self.state.write().await;
            // Re-check under the write lock; two concurrent registrations
            // for the same email must not both succeed.
            if state.users.contains_key(&email) {
                return Err(AuthError::EmailTaken);
            }
            state.users.insert(email, record);
            state.clone()
        };
        self.persist(&snapshot).await?;

        tracing::info!(
            target: "datawash.auth",
            user_id = %view.id,
            role = view.role.as_str(),
            "account registered",
        );

        Ok(view)
    }

    /// Verifies credentials and issues a fresh session token.
    pub async fn login(&self, email: &str, password: &str) -> Result<(UserView, String), AuthError> {
        let email = normalize_email(email).map_err(|_| AuthError::InvalidCredentials)?;

        let record = {
            let state = self.state.read().await;
            state
                .users
                .get(&email)
                .cloned()
                .ok_or(AuthError::InvalidCredentials)?
        };

        let password = password.to_string();
        let hash = record.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|error| AuthError::Hashing {
                message: error.to_string(),
            })?
            .map_err(|error| AuthError::Hashing {
                message: error.to_string(),
            })?;

        if !verified {
            return Err(AuthError::InvalidCredentials);
        }

        let token = self.issue_token(&record)?;
        Ok((record.view(), token))
    }

    fn issue_token(&self, record: &UserRecord) -> Result<String, AuthError> {
        let claims = SessionClaims {
            sub: record.id.clone(),
            email: record.email.clone(),
            role: record.role,
            exp: Utc::now().timestamp() + self.session_ttl_seconds as i64,
        };
        let encoded = serde_json::to_vec(&claims).map_err(|error| AuthError::Persistence {
            message: format!("failed to encode session claims: {error}"),
        })?;
        let claims_b64 = URL_SAFE_NO_PAD.encode(encoded);
        let signature = self.sign(claims_b64.as_bytes())?;
        Ok(format!("{claims_b64}.{signature}"))
    }

    /// Verifies signature and expiry, returning the session it encodes.
    pub fn verify_token(&self, token: &str) -> Result<AuthSession, AuthError> {
        let (claims_b64, signature_b64) = token.split_once('.').ok_or(AuthError::TokenInvalid)?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::TokenInvalid)?;
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|_| AuthError::TokenInvalid)?;
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::TokenInvalid)?;

        let decoded = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| AuthError::TokenInvalid)?;
        let claims: SessionClaims =
            serde_json::from_slice(&decoded).map_err(|_| AuthError::TokenInvalid)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::TokenExpired);
        }

        Ok(AuthSession {
            subject_id: claims.sub,
            email: claims.email,
            role: claims.role,
        })
    }

    fn sign(&self, data: &[u8]) -> Result<String, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|_| AuthError::TokenInvalid)?;
        mac.update(data);
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    async fn persist(&self, state: &AuthState) -> Result<(), AuthError> {
        persist_json_state(self.path.as_deref(), state)
            .await
            .map_err(|message| AuthError::Persistence { message })
    }
}

fn normalize_email(raw: &str) -> Result<String, AuthError> {
    let email = raw.trim().to_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(AuthError::InvalidEmail);
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(AuthError::InvalidEmail);
    }
    Ok(email)
}

fn load_state(path: Option<&std::path::Path>) -> AuthState {
    let Some(path) = path else {
        return AuthState::default();
    };

    let raw = match std::fs::read_to_string(path) {
        Ok(value) => value,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return AuthState::default();
        }
        Err(error) => {
            tracing::warn!(
                target: "datawash.auth",
                path = %path.display(),
                error = %error,
                "failed to read auth store; booting with empty state",
            );
            return AuthState::default();
        }
    };

    match serde_json::from_str::<AuthState>(&raw) {
        Ok(state) => state,
        Err(error) => {
            tracing::warn!(
                target: "datawash.auth",
                path = %path.display(),
                error = %error,
                "failed to parse auth store; booting with empty state",
            );
            AuthState::default()
        }
    }
}
