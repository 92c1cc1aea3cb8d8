use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::credential::AuthCredential;
use crate::auth::error::{AuthError, AuthResult};
use crate::auth::token_manager::{TokenManager, TokenUpdate};
use crate::auth::user::User;

/// Called with the active user whenever it changes.
pub type UserChangeListener = Arc<dyn Fn(User) + Send + Sync>;

/// Supplies auth tokens for outgoing streams and reports user changes.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Returns the current token, or `None` when no user is signed in.
    async fn get_token(&self) -> AuthResult<Option<String>>;

    /// Forces the next [`get_token`](Self::get_token) to refresh.
    fn invalidate_token(&self);

    /// Installs the single change listener and immediately invokes it with
    /// the current user.
    fn set_change_listener(&self, listener: UserChangeListener);

    fn remove_change_listener(&self);

    fn current_user(&self) -> User;
}

/// Provider for unauthenticated access.
#[derive(Default)]
pub struct EmptyCredentialsProvider {
    listener: Mutex<Option<UserChangeListener>>,
}

impl EmptyCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> AuthResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: UserChangeListener) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener.clone());
        listener(User::unauthenticated());
    }

    fn remove_change_listener(&self) {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn current_user(&self) -> User {
        User::unauthenticated()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignInResponse {
    pub uid: String,
    pub id_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
}

/// The identity backend that turns credentials into tokens.
#[async_trait]
pub trait TokenExchange: Send + Sync + 'static {
    async fn sign_in(&self, credential: &AuthCredential) -> AuthResult<SignInResponse>;
    async fn refresh(&self, refresh_token: &str) -> AuthResult<SignInResponse>;
}

const REFRESH_TOLERANCE: Duration = Duration::from_secs(5 * 60);

/// Credentials provider that signs in through a [`TokenExchange`].
pub struct CredentialTokenProvider {
    exchange: Arc<dyn TokenExchange>,
    tokens: TokenManager,
    user: Mutex<User>,
    listener: Mutex<Option<UserChangeListener>>,
    force_refresh: AtomicBool,
    // Bumped on every user change so a refresh racing a sign-out is dropped.
    user_generation: AtomicU64,
}

impl CredentialTokenProvider {
    pub fn new(exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            exchange,
            tokens: TokenManager::default(),
            user: Mutex::new(User::unauthenticated()),
            listener: Mutex::new(None),
            force_refresh: AtomicBool::new(false),
            user_generation: AtomicU64::new(0),
        }
    }

    pub async fn sign_in(&self, credential: AuthCredential) -> AuthResult<User> {
        credential.validate()?;
        let response = self.exchange.sign_in(&credential).await?;
        let user = if credential.is_anonymous() {
            User::anonymous(response.uid.clone())
        } else {
            User::new(response.uid.clone())
        };
        self.tokens.clear();
        self.tokens.update(TokenUpdate::new(
            Some(response.id_token),
            response.refresh_token,
            response.expires_in,
        ));
        self.force_refresh.store(false, Ordering::SeqCst);
        self.change_user(user.clone());
        Ok(user)
    }

    pub fn sign_out(&self) {
        self.tokens.clear();
        self.change_user(User::unauthenticated());
    }

    fn change_user(&self, user: User) {
        {
            let mut current = self.user.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == user {
                return;
            }
            *current = user.clone();
        }
        self.user_generation.fetch_add(1, Ordering::SeqCst);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(user);
        }
    }
}

#[async_trait]
impl CredentialsProvider for CredentialTokenProvider {
    async fn get_token(&self) -> AuthResult<Option<String>> {
        if !self.current_user().is_authenticated() {
            return Ok(None);
        }
        let force = self.force_refresh.swap(false, Ordering::SeqCst);
        if !force && !self.tokens.should_refresh(REFRESH_TOLERANCE) {
            return Ok(self.tokens.access_token());
        }
        let Some(refresh_token) = self.tokens.refresh_token() else {
            return Ok(self.tokens.access_token());
        };
        let generation = self.user_generation.load(Ordering::SeqCst);
        let response = self.exchange.refresh(&refresh_token).await?;
        if generation != self.user_generation.load(Ordering::SeqCst) {
            return Err(AuthError::UserSignedOut);
        }
        self.tokens.update(TokenUpdate::new(
            Some(response.id_token.clone()),
            response.refresh_token,
            response.expires_in,
        ));
        Ok(Some(response.id_token))
    }

    fn invalidate_token(&self) {
        self.force_refresh.store(true, Ordering::SeqCst);
    }

    fn set_change_listener(&self, listener: UserChangeListener) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener.clone());
        listener(self.current_user());
    }

    fn remove_change_listener(&self) {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn current_user(&self) -> User {
        self.user.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeExchange {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl TokenExchange for FakeExchange {
        async fn sign_in(&self, credential: &AuthCredential) -> AuthResult<SignInResponse> {
            let uid = match credential {
                AuthCredential::Password { email, .. } => email.clone(),
                AuthCredential::OAuth { provider_id, .. } => format!("oauth-{provider_id}"),
                AuthCredential::CustomToken { token } => token.clone(),
                AuthCredential::Anonymous => "anon".to_string(),
            };
            Ok(SignInResponse {
                uid,
                id_token: "id-0".into(),
                refresh_token: Some("refresh".into()),
                expires_in: Some(Duration::from_secs(3600)),
            })
        }

        async fn refresh(&self, refresh_token: &str) -> AuthResult<SignInResponse> {
            assert_eq!(refresh_token, "refresh");
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SignInResponse {
                uid: "ignored".into(),
                id_token: format!("id-{n}"),
                refresh_token: None,
                expires_in: Some(Duration::from_secs(3600)),
            })
        }
    }

    #[tokio::test]
    async fn listener_fires_immediately_and_on_change() {
        let provider = CredentialTokenProvider::new(Arc::new(FakeExchange::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        provider.set_change_listener(Arc::new(move |user| sink.lock().unwrap().push(user)));

        provider
            .sign_in(AuthCredential::password("a@b.c", "pw"))
            .await
            .unwrap();
        provider.sign_out();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![User::unauthenticated(), User::new("a@b.c"), User::unauthenticated()]
        );
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let exchange = Arc::new(FakeExchange::default());
        let provider = CredentialTokenProvider::new(exchange.clone());
        assert_eq!(provider.get_token().await.unwrap(), None);

        provider.sign_in(AuthCredential::Anonymous).await.unwrap();
        assert!(provider.current_user().is_anonymous());
        assert_eq!(provider.get_token().await.unwrap().as_deref(), Some("id-0"));

        provider.invalidate_token();
        assert_eq!(provider.get_token().await.unwrap().as_deref(), Some("id-1"));
        assert_eq!(provider.get_token().await.unwrap().as_deref(), Some("id-1"));
        assert_eq!(exchange.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_credentials_never_reach_exchange() {
        let provider = CredentialTokenProvider::new(Arc::new(FakeExchange::default()));
        let err = provider
            .sign_in(AuthCredential::custom_token(""))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential(_)));
        assert!(!provider.current_user().is_authenticated());
    }

    #[tokio::test]
    async fn empty_provider_is_unauthenticated() {
        let provider = EmptyCredentialsProvider::new();
        assert_eq!(provider.get_token().await.unwrap(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        provider.set_change_listener(Arc::new(move |user| {
            assert!(!user.is_authenticated());
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
