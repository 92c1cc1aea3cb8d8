use std::cmp::Ordering;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expiration_time: Option<SystemTime>,
}

/// Holds the current id token, its refresh token and its expiry.
#[derive(Debug, Default)]
pub struct TokenManager {
    state: Mutex<TokenState>,
}

impl TokenManager {
    pub fn update(&self, update: TokenUpdate) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(access_token) = update.access_token {
            state.access_token = Some(access_token);
        }
        if let Some(refresh_token) = update.refresh_token {
            state.refresh_token = Some(refresh_token);
        }
        state.expiration_time = update
            .expires_in
            .and_then(|expires_in| SystemTime::now().checked_add(expires_in));
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = TokenState::default();
    }

    pub fn access_token(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .access_token
            .clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh_token
            .clone()
    }

    /// True when there is no token or it expires within `tolerance`.
    pub fn should_refresh(&self, tolerance: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.access_token.is_none() {
            return true;
        }
        match state.expiration_time {
            None => false,
            Some(expiration) => {
                let now = SystemTime::now();
                let threshold = now.checked_add(tolerance).unwrap_or(now);
                matches!(expiration.cmp(&threshold), Ordering::Less | Ordering::Equal)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct TokenUpdate {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
}

impl TokenUpdate {
    pub fn new(
        access_token: Option<String>,
        refresh_token: Option<String>,
        expires_in: Option<Duration>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_in,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_needed_without_token_or_near_expiry() {
        let manager = TokenManager::default();
        assert!(manager.should_refresh(Duration::from_secs(30)));

        manager.update(TokenUpdate::new(
            Some("id".into()),
            Some("refresh".into()),
            Some(Duration::from_secs(10)),
        ));
        assert!(manager.should_refresh(Duration::from_secs(30)));
        assert!(!manager.should_refresh(Duration::from_secs(1)));

        manager.clear();
        assert_eq!(manager.access_token(), None);
        assert_eq!(manager.refresh_token(), None);
    }

    #[test]
    fn tokens_without_expiry_stay_fresh() {
        let manager = TokenManager::default();
        manager.update(TokenUpdate::new(Some("id".into()), None, None));
        assert!(!manager.should_refresh(Duration::from_secs(3600)));
    }
}
