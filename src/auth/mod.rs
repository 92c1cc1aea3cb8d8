//! Credentials consumed by the sync engine.
//!
//! The engine never signs users in itself; it asks a [`CredentialsProvider`]
//! for tokens and listens for user changes.

mod credential;
mod error;
mod provider;
mod token_manager;
mod user;

#[doc(inline)]
pub use credential::AuthCredential;

#[doc(inline)]
pub use error::{AuthError, AuthResult};

#[doc(inline)]
pub use provider::{
    CredentialTokenProvider, CredentialsProvider, EmptyCredentialsProvider, SignInResponse,
    TokenExchange, UserChangeListener,
};

pub use token_manager::{TokenManager, TokenUpdate};

#[doc(inline)]
pub use user::User;
