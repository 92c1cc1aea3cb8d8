use serde_json::{json, Value};

use crate::auth::error::{AuthError, AuthResult};

/// A sign-in credential.
///
/// The set of credential kinds is closed; everything that consumes a
/// credential dispatches with `match`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthCredential {
    Password {
        email: String,
        password: String,
    },
    OAuth {
        provider_id: String,
        id_token: Option<String>,
        access_token: Option<String>,
        raw_nonce: Option<String>,
    },
    CustomToken {
        token: String,
    },
    Anonymous,
}

impl AuthCredential {
    pub const PASSWORD_PROVIDER_ID: &'static str = "password";
    pub const CUSTOM_PROVIDER_ID: &'static str = "custom";
    pub const ANONYMOUS_PROVIDER_ID: &'static str = "anonymous";

    pub fn password(email: impl Into<String>, password: impl Into<String>) -> Self {
        AuthCredential::Password {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn oauth_id_token(provider_id: impl Into<String>, id_token: impl Into<String>) -> Self {
        AuthCredential::OAuth {
            provider_id: provider_id.into(),
            id_token: Some(id_token.into()),
            access_token: None,
            raw_nonce: None,
        }
    }

    pub fn oauth_access_token(
        provider_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        AuthCredential::OAuth {
            provider_id: provider_id.into(),
            id_token: None,
            access_token: Some(access_token.into()),
            raw_nonce: None,
        }
    }

    pub fn custom_token(token: impl Into<String>) -> Self {
        AuthCredential::CustomToken {
            token: token.into(),
        }
    }

    pub fn provider_id(&self) -> &str {
        match self {
            AuthCredential::Password { .. } => Self::PASSWORD_PROVIDER_ID,
            AuthCredential::OAuth { provider_id, .. } => provider_id,
            AuthCredential::CustomToken { .. } => Self::CUSTOM_PROVIDER_ID,
            AuthCredential::Anonymous => Self::ANONYMOUS_PROVIDER_ID,
        }
    }

    pub fn sign_in_method(&self) -> &str {
        // OAuth providers sign in with their own id; the rest reuse the provider id.
        self.provider_id()
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, AuthCredential::Anonymous)
    }

    /// Checks the credential carries what the token exchange needs.
    pub fn validate(&self) -> AuthResult<()> {
        match self {
            AuthCredential::Password { email, password } => {
                if email.trim().is_empty() || !email.contains('@') {
                    return Err(AuthError::InvalidCredential(format!(
                        "'{email}' is not a valid email address"
                    )));
                }
                if password.is_empty() {
                    return Err(AuthError::InvalidCredential("password must not be empty".into()));
                }
                Ok(())
            }
            AuthCredential::OAuth {
                provider_id,
                id_token,
                access_token,
                ..
            } => {
                if provider_id.trim().is_empty() {
                    return Err(AuthError::InvalidCredential(
                        "OAuth credential is missing its provider id".into(),
                    ));
                }
                if id_token.is_none() && access_token.is_none() {
                    return Err(AuthError::InvalidCredential(
                        "OAuth credential needs an id token or an access token".into(),
                    ));
                }
                Ok(())
            }
            AuthCredential::CustomToken { token } => {
                if token.trim().is_empty() {
                    return Err(AuthError::InvalidCredential("custom token must not be empty".into()));
                }
                Ok(())
            }
            AuthCredential::Anonymous => Ok(()),
        }
    }

    /// Serializes the credential to a JSON value.
    pub fn to_json(&self) -> Value {
        let mut value = json!({
            "providerId": self.provider_id(),
            "signInMethod": self.sign_in_method(),
        });
        match self {
            AuthCredential::Password { email, password } => {
                value["email"] = json!(email);
                value["password"] = json!(password);
            }
            AuthCredential::OAuth {
                id_token,
                access_token,
                raw_nonce,
                ..
            } => {
                if let Some(id_token) = id_token {
                    value["idToken"] = json!(id_token);
                }
                if let Some(access_token) = access_token {
                    value["accessToken"] = json!(access_token);
                }
                if let Some(nonce) = raw_nonce {
                    value["rawNonce"] = json!(nonce);
                }
            }
            AuthCredential::CustomToken { token } => {
                value["token"] = json!(token);
            }
            AuthCredential::Anonymous => {}
        }
        value
    }

    /// Reconstructs a credential from a value produced by [`to_json`](Self::to_json).
    pub fn from_json(value: &Value) -> AuthResult<Self> {
        let provider_id = string_field(value, "providerId")
            .ok_or_else(|| AuthError::InvalidCredential("missing providerId".into()))?;
        let credential = match provider_id.as_str() {
            Self::PASSWORD_PROVIDER_ID => AuthCredential::Password {
                email: string_field(value, "email").unwrap_or_default(),
                password: string_field(value, "password").unwrap_or_default(),
            },
            Self::CUSTOM_PROVIDER_ID => AuthCredential::CustomToken {
                token: string_field(value, "token").unwrap_or_default(),
            },
            Self::ANONYMOUS_PROVIDER_ID => AuthCredential::Anonymous,
            _ => AuthCredential::OAuth {
                provider_id,
                id_token: string_field(value, "idToken"),
                access_token: string_field(value, "accessToken"),
                raw_nonce: string_field(value, "rawNonce"),
            },
        };
        credential.validate()?;
        Ok(credential)
    }

    pub fn from_json_str(data: &str) -> AuthResult<Self> {
        let value: Value = serde_json::from_str(data)
            .map_err(|err| AuthError::InvalidCredential(err.to_string()))?;
        Self::from_json(&value)
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_follow_kind() {
        assert_eq!(AuthCredential::password("a@b.c", "pw").provider_id(), "password");
        assert_eq!(AuthCredential::custom_token("t").provider_id(), "custom");
        assert_eq!(AuthCredential::Anonymous.provider_id(), "anonymous");
        assert_eq!(
            AuthCredential::oauth_id_token("google.com", "id").sign_in_method(),
            "google.com"
        );
    }

    #[test]
    fn validation_rejects_incomplete_credentials() {
        assert!(AuthCredential::password("nope", "pw").validate().is_err());
        assert!(AuthCredential::password("a@b.c", "").validate().is_err());
        assert!(AuthCredential::custom_token(" ").validate().is_err());
        let bare = AuthCredential::OAuth {
            provider_id: "github.com".into(),
            id_token: None,
            access_token: None,
            raw_nonce: None,
        };
        assert!(matches!(bare.validate(), Err(AuthError::InvalidCredential(_))));
        assert!(AuthCredential::Anonymous.validate().is_ok());
    }

    #[test]
    fn json_preserves_oauth_fields() {
        let credential = AuthCredential::OAuth {
            provider_id: "apple.com".into(),
            id_token: Some("id".into()),
            access_token: None,
            raw_nonce: Some("nonce".into()),
        };
        let text = credential.to_json().to_string();
        assert_eq!(AuthCredential::from_json_str(&text).unwrap(), credential);
    }

    #[test]
    fn from_json_requires_provider() {
        let err = AuthCredential::from_json(&json!({"token": "x"})).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential(_)));
    }
}
