use std::fmt;

use crate::app::AppError;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    App(AppError),
    Network(String),
    InvalidCredential(String),
    /// The token exchange refused the credential or refresh token.
    Rejected(String),
    UserSignedOut,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::App(err) => write!(f, "{err}"),
            AuthError::Network(message) => write!(f, "Network error: {message}"),
            AuthError::InvalidCredential(message) => write!(f, "Invalid credential: {message}"),
            AuthError::Rejected(message) => write!(f, "Token exchange rejected: {message}"),
            AuthError::UserSignedOut => write!(f, "User signed out while a token was in flight"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<AppError> for AuthError {
    fn from(error: AppError) -> Self {
        AuthError::App(error)
    }
}
