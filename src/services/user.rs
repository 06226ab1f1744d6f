//! User accounts.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::auth::{Access, Caller, DownstreamAuthGuard, Role};
use crate::error::{GatewayError, GatewayResult};
use crate::rpc::{RpcServer, operation, service};
use crate::session::AuthenticatedUser;

service!(UserService = "gateway.user.UserService", registry = "user");

operation!(Authenticate on UserService, "Authenticate", Credentials => AuthenticatedUser);
operation!(CreateUser on UserService, "CreateUser", NewUser => UserProfile);
operation!(FindUserById on UserService, "FindUserById", UserIdRequest => UserProfile);
operation!(FindUserByEmail on UserService, "FindUserByEmail", EmailRequest => UserProfile);
operation!(
    /// Patch the caller's own profile.
    UpdateUser on UserService, "UpdateUser", UserPatch => UserProfile
);

const MIN_PASSWORD_LEN: usize = 6;
const MAX_PASSWORD_LEN: usize = 100;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub login: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub contacts: String,
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("login", &self.login)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdRequest {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

/// Public view of an account. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub login: String,
    pub email: String,
    pub contacts: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a [`UserProfile`].
///
/// `None` leaves a field untouched. Credentials cannot be expressed here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPatch {
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub contacts: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl UserPatch {
    /// Whether the patch touches fields only an admin may change.
    pub fn is_privileged(&self) -> bool {
        self.role.is_some() || self.is_active.is_some()
    }

    pub fn apply(self, profile: &mut UserProfile) {
        if let Some(login) = self.login {
            profile.login = login;
        }
        if let Some(email) = self.email {
            profile.email = email;
        }
        if let Some(contacts) = self.contacts {
            profile.contacts = contacts;
        }
        if let Some(role) = self.role {
            profile.role = role;
        }
        if let Some(is_active) = self.is_active {
            profile.is_active = is_active;
        }
    }
}

fn validate_email(email: &str) -> GatewayResult<()> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(GatewayError::Validation(format!("invalid email: {}", email))),
    }
}

fn validate_password(password: &str) -> GatewayResult<()> {
    let len = password.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
        return Err(GatewayError::Validation(format!(
            "password must be {}-{} characters",
            MIN_PASSWORD_LEN, MAX_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Account storage and credential checks.
pub trait UserDirectory: Send + Sync + 'static {
    /// Check a login (or email) and password. Wrong credentials and inactive
    /// accounts are both `Authentication`.
    fn authenticate(
        &self,
        login: &str,
        password: &str,
    ) -> impl Future<Output = GatewayResult<AuthenticatedUser>> + Send;

    fn create(&self, user: NewUser) -> impl Future<Output = GatewayResult<UserProfile>> + Send;

    fn find_by_id(&self, id: i64) -> impl Future<Output = GatewayResult<UserProfile>> + Send;

    fn find_by_email(&self, email: &str)
    -> impl Future<Output = GatewayResult<UserProfile>> + Send;

    /// Apply `patch` to the caller's own profile.
    fn update(
        &self,
        caller: &Caller,
        patch: UserPatch,
    ) -> impl Future<Output = GatewayResult<UserProfile>> + Send;
}

struct StoredUser {
    profile: UserProfile,
    salt: [u8; 16],
    password_hash: Vec<u8>,
}

fn hash_password(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

#[derive(Default)]
struct UserTable {
    next_id: i64,
    users: HashMap<i64, StoredUser>,
}

impl UserTable {
    fn by_login_or_email(&self, login: &str) -> Option<&StoredUser> {
        self.users
            .values()
            .find(|u| u.profile.email == login || u.profile.login == login)
    }

    fn email_taken(&self, email: &str, except: Option<i64>) -> bool {
        self.users
            .values()
            .any(|u| u.profile.email == email && Some(u.profile.id) != except)
    }

    fn insert(&mut self, user: NewUser, role: Role) -> GatewayResult<UserProfile> {
        validate_email(&user.email)?;
        validate_password(&user.password)?;
        if self.email_taken(&user.email, None) {
            return Err(GatewayError::Validation(format!(
                "email already registered: {}",
                user.email
            )));
        }

        self.next_id += 1;
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);

        let profile = UserProfile {
            id: self.next_id,
            login: user.login,
            email: user.email,
            contacts: user.contacts,
            role,
            is_active: true,
            created_at: Utc::now(),
        };
        self.users.insert(
            profile.id,
            StoredUser {
                profile: profile.clone(),
                password_hash: hash_password(&salt, &user.password),
                salt,
            },
        );
        Ok(profile)
    }
}

/// Process-local [`UserDirectory`].
#[derive(Default)]
pub struct InMemoryUsers {
    table: RwLock<UserTable>,
}

impl InMemoryUsers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an account with the admin role directly.
    pub fn seed_admin(&self, user: NewUser) -> GatewayResult<UserProfile> {
        self.table.write().insert(user, Role::Admin)
    }
}

impl UserDirectory for InMemoryUsers {
    async fn authenticate(&self, login: &str, password: &str) -> GatewayResult<AuthenticatedUser> {
        let table = self.table.read();
        let user = table
            .by_login_or_email(login)
            .ok_or(GatewayError::Authentication)?;

        if !user.profile.is_active || hash_password(&user.salt, password) != user.password_hash {
            return Err(GatewayError::Authentication);
        }

        Ok(AuthenticatedUser {
            user_id: user.profile.id,
            role: user.profile.role,
        })
    }

    async fn create(&self, user: NewUser) -> GatewayResult<UserProfile> {
        let profile = self.table.write().insert(user, Role::User)?;
        info!(user_id = profile.id, "Created user");
        Ok(profile)
    }

    async fn find_by_id(&self, id: i64) -> GatewayResult<UserProfile> {
        self.table
            .read()
            .users
            .get(&id)
            .map(|u| u.profile.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("user {}", id)))
    }

    async fn find_by_email(&self, email: &str) -> GatewayResult<UserProfile> {
        self.table
            .read()
            .users
            .values()
            .find(|u| u.profile.email == email)
            .map(|u| u.profile.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("user {}", email)))
    }

    async fn update(&self, caller: &Caller, patch: UserPatch) -> GatewayResult<UserProfile> {
        let claims = caller.claims()?;
        if patch.is_privileged() && !claims.is_admin() {
            return Err(GatewayError::PermissionDenied(
                "only admins may change role or activity".to_string(),
            ));
        }

        let mut table = self.table.write();
        if let Some(email) = &patch.email {
            validate_email(email)?;
            if table.email_taken(email, Some(claims.user_id)) {
                return Err(GatewayError::Validation(format!(
                    "email already registered: {}",
                    email
                )));
            }
        }

        let user = table
            .users
            .get_mut(&claims.user_id)
            .ok_or_else(|| GatewayError::NotFound(format!("user {}", claims.user_id)))?;
        patch.apply(&mut user.profile);
        Ok(user.profile.clone())
    }
}

pub fn user_server<U: UserDirectory>(
    directory: Arc<U>,
    guard: DownstreamAuthGuard,
) -> RpcServer<UserService> {
    let authenticate = directory.clone();
    let create = directory.clone();
    let by_id = directory.clone();
    let by_email = directory.clone();
    let update = directory;

    RpcServer::builder(guard)
        .route::<Authenticate, _, _>(Access::Public, move |_, req: Credentials| {
            let directory = authenticate.clone();
            async move { directory.authenticate(&req.login, &req.password).await }
        })
        .route::<CreateUser, _, _>(Access::Public, move |_, req: NewUser| {
            let directory = create.clone();
            async move { directory.create(req).await }
        })
        .route::<FindUserById, _, _>(Access::Authenticated, move |_, req: UserIdRequest| {
            let directory = by_id.clone();
            async move { directory.find_by_id(req.id).await }
        })
        .route::<FindUserByEmail, _, _>(Access::Authenticated, move |_, req: EmailRequest| {
            let directory = by_email.clone();
            async move { directory.find_by_email(&req.email).await }
        })
        .route::<UpdateUser, _, _>(Access::Authenticated, move |caller, patch: UserPatch| {
            let directory = update.clone();
            async move { directory.update(&caller, patch).await }
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Claims;

    fn new_user(login: &str, email: &str) -> NewUser {
        NewUser {
            login: login.to_string(),
            email: email.to_string(),
            password: "secret-pw".to_string(),
            contacts: String::new(),
        }
    }

    fn caller(user_id: i64, role: Role) -> Caller {
        Caller::User(Claims {
            user_id,
            role,
            iat: 0,
            exp: i64::MAX,
        })
    }

    #[tokio::test]
    async fn test_create_then_authenticate() {
        let users = InMemoryUsers::new();
        let profile = users.create(new_user("bob", "bob@example.com")).await.unwrap();
        assert_eq!(profile.role, Role::User);
        assert!(profile.is_active);

        let by_email = users.authenticate("bob@example.com", "secret-pw").await.unwrap();
        assert_eq!(by_email.user_id, profile.id);
        let by_login = users.authenticate("bob", "secret-pw").await.unwrap();
        assert_eq!(by_login, by_email);

        assert_eq!(
            users.authenticate("bob", "wrong-pw").await.unwrap_err(),
            GatewayError::Authentication
        );
        assert_eq!(
            users.authenticate("nobody", "secret-pw").await.unwrap_err(),
            GatewayError::Authentication
        );
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let users = InMemoryUsers::new();
        assert!(matches!(
            users.create(new_user("x", "not-an-email")).await,
            Err(GatewayError::Validation(_))
        ));

        let mut short = new_user("x", "x@example.com");
        short.password = "123".to_string();
        assert!(matches!(users.create(short).await, Err(GatewayError::Validation(_))));

        users.create(new_user("a", "dup@example.com")).await.unwrap();
        assert!(matches!(
            users.create(new_user("b", "dup@example.com")).await,
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_find_missing_user_is_not_found() {
        let users = InMemoryUsers::new();
        assert!(matches!(users.find_by_id(42).await, Err(GatewayError::NotFound(_))));
        assert!(matches!(
            users.find_by_email("ghost@example.com").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_user_cannot_change_own_role() {
        let users = InMemoryUsers::new();
        let profile = users.create(new_user("eve", "eve@example.com")).await.unwrap();

        let patch = UserPatch {
            role: Some(Role::Admin),
            ..Default::default()
        };
        let err = users
            .update(&caller(profile.id, Role::User), patch)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));
        assert_eq!(users.find_by_id(profile.id).await.unwrap().role, Role::User);
    }

    #[tokio::test]
    async fn test_update_applies_only_present_fields() {
        let users = InMemoryUsers::new();
        let profile = users.create(new_user("carol", "carol@example.com")).await.unwrap();

        let patch = UserPatch {
            contacts: Some("+1 555 0100".to_string()),
            ..Default::default()
        };
        let updated = users
            .update(&caller(profile.id, Role::User), patch)
            .await
            .unwrap();
        assert_eq!(updated.contacts, "+1 555 0100");
        assert_eq!(updated.login, "carol");
        assert_eq!(updated.email, "carol@example.com");
    }

    #[tokio::test]
    async fn test_admin_may_deactivate_and_inactive_cannot_log_in() {
        let users = InMemoryUsers::new();
        let admin = users.seed_admin(new_user("root", "root@example.com")).unwrap();
        assert_eq!(admin.role, Role::Admin);

        let patch = UserPatch {
            is_active: Some(false),
            ..Default::default()
        };
        users.update(&caller(admin.id, Role::Admin), patch).await.unwrap();
        assert_eq!(
            users.authenticate("root", "secret-pw").await.unwrap_err(),
            GatewayError::Authentication
        );
    }

    #[tokio::test]
    async fn test_anonymous_update_is_rejected() {
        let users = InMemoryUsers::new();
        assert!(matches!(
            users.update(&Caller::Anonymous, UserPatch::default()).await,
            Err(GatewayError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_patch_deserializes_from_partial_json() {
        let patch: UserPatch = serde_json::from_str(r#"{"email":"new@example.com"}"#).unwrap();
        assert_eq!(patch.email.as_deref(), Some("new@example.com"));
        assert!(patch.login.is_none());
        assert!(!patch.is_privileged());
    }
}
