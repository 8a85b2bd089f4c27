//! Auth Gate: credentials, sessions and role checks.
//!
//! Sessions live in memory only. A restart logs everybody out.

use crate::backend::ParkingBackend;
use crate::error::{AuthError, ParkingError};
use crate::types::{NewUser, Role, User};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Identity resolved for one request. Passed explicitly into every operation
/// that needs to know who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: i32,
    pub role: Role,
    pub token: Uuid,
}

impl RequestContext {
    pub fn require(&self, role: Role) -> Result<(), ParkingError> {
        if self.role != role {
            warn!(user_id = self.user_id, %role, "Role check failed");
            return Err(AuthError::Forbidden(format!("requires the {role} role")).into());
        }
        Ok(())
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: Uuid,
    pub user_id: i32,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::default(),
            ttl,
        }
    }

    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Session>>, ParkingError> {
        self.sessions.lock().map_err(|_| {
            let err = "Session store is poisoned";
            error!(err);
            ParkingError::Storage(err.into())
        })
    }

    fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<(), ParkingError> {
        self.sessions()?
            .retain(|_, session| session.expires_at > now);
        Ok(())
    }

    fn open(&self, user: &User) -> Result<Session, ParkingError> {
        let now = Utc::now();
        self.cleanup_expired_sessions(now)?;

        let session = Session {
            token: Uuid::new_v4(),
            user_id: user.id,
            role: user.role,
            expires_at: now + self.ttl,
        };
        self.sessions()?.insert(session.token, session.clone());
        Ok(session)
    }

    fn resolve(&self, token: Uuid) -> Result<Session, ParkingError> {
        let mut sessions = self.sessions()?;
        let session = sessions
            .get(&token)
            .cloned()
            .ok_or(AuthError::MissingSession)?;

        if session.expires_at <= Utc::now() {
            sessions.remove(&token);
            return Err(AuthError::SessionExpired.into());
        }
        Ok(session)
    }

    fn close(&self, token: Uuid) -> Result<bool, ParkingError> {
        Ok(self.sessions()?.remove(&token).is_some())
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_password(password: &str) -> Result<(), ParkingError> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(ParkingError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

pub fn hash_password(password: &str) -> Result<String, ParkingError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ParkingError::Storage(format!("password hashing failed: {err}")))
}

pub fn verify_password(password: &str, hash: &str) -> Result<(), ParkingError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|_| AuthError::InvalidCredentials)?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| AuthError::InvalidCredentials.into())
}

#[derive(Debug, Clone)]
pub struct AuthGate<T: ParkingBackend> {
    backend: T,
    sessions: SessionStore,
}

impl<T: ParkingBackend> AuthGate<T> {
    pub fn new(backend: T, session_ttl: Duration) -> Self {
        Self {
            backend,
            sessions: SessionStore::new(session_ttl),
        }
    }

    /// Creates a customer account.
    pub fn register(&self, name: &str, email: &str, password: &str) -> Result<User, ParkingError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ParkingError::Validation("name must not be empty".into()));
        }
        validate_password(password)?;

        let user = self
            .backend
            .create_user(NewUser {
                name: name.into(),
                email: normalize_email(email),
                password_hash: hash_password(password)?,
                role: Role::Customer,
            })
            .map_err(|err| match err {
                ParkingError::Conflict(_) => {
                    ParkingError::Conflict("email is already registered".into())
                }
                other => other,
            })?;
        info!(user_id = user.id, "Registered new customer");
        Ok(user)
    }

    pub fn login(&self, email: &str, password: &str) -> Result<Session, ParkingError> {
        let credentials = self.backend.credentials(&normalize_email(email))?;
        let Some((user, password_hash)) = credentials else {
            warn!("Login attempt for unknown email");
            return Err(AuthError::InvalidCredentials.into());
        };

        if let Err(err) = verify_password(password, &password_hash) {
            warn!(user_id = user.id, "Login attempt with wrong password");
            return Err(err);
        }

        let session = self.sessions.open(&user)?;
        info!(user_id = user.id, role = %user.role, "Session opened");
        Ok(session)
    }

    pub fn logout(&self, context: &RequestContext) -> Result<(), ParkingError> {
        if self.sessions.close(context.token)? {
            info!(user_id = context.user_id, "Session closed");
        }
        Ok(())
    }

    /// Resolves a bearer token into the request context. The role comes from
    /// the store, not from the session, so it is always current.
    pub fn authenticate(&self, token: Option<&str>) -> Result<RequestContext, ParkingError> {
        let token = token
            .and_then(|token| Uuid::parse_str(token.trim()).ok())
            .ok_or(AuthError::MissingSession)?;
        let session = self.sessions.resolve(token)?;

        let user = self.backend.user(session.user_id).map_err(|err| match err {
            ParkingError::NotFound(_) => ParkingError::Auth(AuthError::MissingSession),
            other => other,
        })?;

        Ok(RequestContext {
            user_id: user.id,
            role: user.role,
            token,
        })
    }

    pub fn change_password(
        &self,
        context: &RequestContext,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), ParkingError> {
        validate_password(new_password)?;

        let user = self.backend.user(context.user_id)?;
        let (_, password_hash) = self
            .backend
            .credentials(&user.email)?
            .ok_or_else(|| ParkingError::NotFound(format!("user {} does not exist", user.id)))?;
        verify_password(current_password, &password_hash)?;

        self.backend
            .update_password_hash(user.id, hash_password(new_password)?)?;
        info!(user_id = user.id, "Password changed");
        Ok(())
    }

    /// Makes sure the administrator account exists. Existing accounts are
    /// left alone, including their password.
    pub fn ensure_admin(&self, email: &str, password: &str) -> Result<User, ParkingError> {
        let email = normalize_email(email);
        if let Some((user, _)) = self.backend.credentials(&email)? {
            return Ok(user);
        }

        let admin = self.backend.create_user(NewUser {
            name: "Admin".into(),
            email,
            password_hash: hash_password(password)?,
            role: Role::Admin,
        })?;
        info!(user_id = admin.id, "Created administrator account");
        Ok(admin)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::local_parking::LocalParking;
    use test_case::test_case;

    fn gate() -> AuthGate<LocalParking> {
        AuthGate::new(LocalParking::default(), Duration::hours(1))
    }

    #[test]
    fn test_register_login_authenticate_logout() {
        let gate = gate();
        let user = gate
            .register("Stefan", " Stefan@Example.com ", "correct horse")
            .unwrap();
        assert_eq!(user.email, "stefan@example.com");
        assert_eq!(user.role, Role::Customer);

        let session = gate.login("STEFAN@example.com", "correct horse").unwrap();
        assert_eq!(session.user_id, user.id);
        assert!(session.expires_at > Utc::now());

        let token = session.token.to_string();
        let context = gate.authenticate(Some(&token)).unwrap();
        assert_eq!(context.user_id, user.id);
        assert_eq!(context.role, Role::Customer);

        gate.logout(&context).unwrap();
        let err = gate.authenticate(Some(&token)).unwrap_err();
        assert!(matches!(err, ParkingError::Auth(AuthError::MissingSession)));
    }

    #[test_case("stefan@example.com", "wrong password" ; "wrong password")]
    #[test_case("nobody@example.com", "correct horse" ; "unknown email")]
    fn test_bad_credentials(email: &str, password: &str) {
        let gate = gate();
        gate.register("Stefan", "stefan@example.com", "correct horse")
            .unwrap();

        let err = gate.login(email, password).unwrap_err();
        assert!(matches!(
            err,
            ParkingError::Auth(AuthError::InvalidCredentials)
        ));
    }

    #[test_case("", "stefan@example.com", "correct horse" ; "empty name")]
    #[test_case("Stefan", "stefan@example.com", "short" ; "short password")]
    fn test_register_validation(name: &str, email: &str, password: &str) {
        let err = gate().register(name, email, password).unwrap_err();
        assert!(matches!(err, ParkingError::Validation(_)));
    }

    #[test]
    fn test_register_duplicate_email() {
        let gate = gate();
        gate.register("Stefan", "stefan@example.com", "correct horse")
            .unwrap();
        let err = gate
            .register("Stefan", "STEFAN@example.com", "another horse")
            .unwrap_err();
        assert!(matches!(err, ParkingError::Conflict(_)));
    }

    #[test_case(None ; "no token")]
    #[test_case(Some("not-a-uuid") ; "malformed token")]
    #[test_case(Some("2b1c4c3e-8d6f-4c8e-9a3b-0f2f0c9d7e11") ; "unknown token")]
    fn test_authenticate_rejects(token: Option<&str>) {
        let err = gate().authenticate(token).unwrap_err();
        assert!(matches!(err, ParkingError::Auth(AuthError::MissingSession)));
    }

    #[test]
    fn test_expired_session() {
        let gate = AuthGate::new(LocalParking::default(), Duration::zero());
        gate.register("Stefan", "stefan@example.com", "correct horse")
            .unwrap();
        let session = gate.login("stefan@example.com", "correct horse").unwrap();

        let token = session.token.to_string();
        let err = gate.authenticate(Some(&token)).unwrap_err();
        assert!(matches!(err, ParkingError::Auth(AuthError::SessionExpired)));

        // Expired sessions are dropped on first use
        let err = gate.authenticate(Some(&token)).unwrap_err();
        assert!(matches!(err, ParkingError::Auth(AuthError::MissingSession)));
    }

    #[test]
    fn test_role_guard() {
        let gate = gate();
        gate.ensure_admin("admin@example.com", "admin123").unwrap();
        let session = gate.login("admin@example.com", "admin123").unwrap();
        let context = gate
            .authenticate(Some(&session.token.to_string()))
            .unwrap();

        assert!(context.is_admin());
        context.require(Role::Admin).unwrap();
        let err = context.require(Role::Customer).unwrap_err();
        assert!(matches!(err, ParkingError::Auth(AuthError::Forbidden(_))));
    }

    #[test]
    fn test_ensure_admin_is_idempotent() {
        let gate = gate();
        let first = gate.ensure_admin("admin@example.com", "admin123").unwrap();
        let second = gate
            .ensure_admin("ADMIN@example.com", "other password")
            .unwrap();
        assert_eq!(first, second);

        // The old password still works
        gate.login("admin@example.com", "admin123").unwrap();
    }

    #[test]
    fn test_change_password() {
        let gate = gate();
        gate.register("Stefan", "stefan@example.com", "correct horse")
            .unwrap();
        let session = gate.login("stefan@example.com", "correct horse").unwrap();
        let context = gate
            .authenticate(Some(&session.token.to_string()))
            .unwrap();

        let err = gate
            .change_password(&context, "wrong password", "battery staple")
            .unwrap_err();
        assert!(matches!(
            err,
            ParkingError::Auth(AuthError::InvalidCredentials)
        ));
        let err = gate
            .change_password(&context, "correct horse", "short")
            .unwrap_err();
        assert!(matches!(err, ParkingError::Validation(_)));

        gate.change_password(&context, "correct horse", "battery staple")
            .unwrap();
        gate.login("stefan@example.com", "correct horse")
            .unwrap_err();
        gate.login("stefan@example.com", "battery staple").unwrap();
    }
}
