use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{ensure, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

const AUTH_FILE: &str = "auth.json";

/// The signed-in account as the identity backend reports it.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub uid: Arc<str>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub anonymous: bool,
}

/// Interface for abstracting the identity backend.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    fn current_user(&self) -> Option<AuthUser>;

    async fn sign_in_anonymously(&self) -> Result<AuthUser>;

    /// Signs in with an externally issued credential.
    async fn sign_in_with_credential(&self, token: &str) -> Result<AuthUser>;

    async fn sign_out(&self) -> Result<()>;
}

/// The shipped [AuthProvider]: remembers the signed-in account in the app
/// data directory. Anonymous accounts get a fresh v4 UUID; credentials are
/// taken as opaque account ids, verifying them against an identity service
/// is the platform integration's job.
pub struct LocalAuth {
    auth_file: PathBuf,
    user: Mutex<Option<AuthUser>>,
}

impl LocalAuth {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let auth_file = data_dir.join(AUTH_FILE);
        let user = match std::fs::read_to_string(&auth_file) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Stored session in {auth_file:?} is unreadable: {e}");
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            auth_file,
            user: Mutex::new(user),
        })
    }

    async fn persist(&self, user: Option<&AuthUser>) -> Result<()> {
        match user {
            Some(user) => {
                let buffer = serde_json::to_vec(user)?;
                tokio::fs::write(&self.auth_file, buffer).await?;
            }
            None => match tokio::fs::remove_file(&self.auth_file).await {
                Ok(()) => (),
                Err(e) if e.kind() == ErrorKind::NotFound => (),
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    fn lock_user(&self) -> MutexGuard<'_, Option<AuthUser>> {
        match self.user.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl AuthProvider for LocalAuth {
    fn current_user(&self) -> Option<AuthUser> {
        self.lock_user().clone()
    }

    async fn sign_in_anonymously(&self) -> Result<AuthUser> {
        let user = AuthUser {
            uid: Uuid::new_v4().to_string().into(),
            display_name: None,
            photo_url: None,
            anonymous: true,
        };
        self.persist(Some(&user)).await?;
        *self.lock_user() = Some(user.clone());
        Ok(user)
    }

    async fn sign_in_with_credential(&self, token: &str) -> Result<AuthUser> {
        let token = token.trim();
        ensure!(!token.is_empty(), "credential must not be empty");
        let user = AuthUser {
            uid: token.into(),
            display_name: None,
            photo_url: None,
            anonymous: false,
        };
        self.persist(Some(&user)).await?;
        *self.lock_user() = Some(user.clone());
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        self.persist(None).await?;
        *self.lock_user() = None;
        Ok(())
    }
}
