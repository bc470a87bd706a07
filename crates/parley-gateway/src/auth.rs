use std::time::Duration;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use parley_types::api::Claims;

use crate::error::{AuthError, GatewayError, GatewayResult, validation};

/// Password hashing and bearer-token issuance.
#[derive(Clone)]
pub struct Authenticator {
    secret: String,
    ttl: Duration,
}

impl Authenticator {
    pub fn new(secret: impl Into<String>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    pub fn issue_token(&self, user_id: Uuid, username: &str) -> anyhow::Result<String> {
        let ttl = chrono::Duration::from_std(self.ttl)?;
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;

        Ok(token)
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|_| AuthError::TokenInvalid)
    }
}

/// Argon2id hash. CPU-heavy, call from a blocking task.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))
}

/// CPU-heavy, call from a blocking task.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

pub fn validate_credentials(username: &str, password: &str) -> GatewayResult<()> {
    let len = username.chars().count();
    if !(3..=32).contains(&len) {
        return Err(validation("username must be 3-32 characters"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(validation(
            "username may only contain letters, digits and underscores",
        ));
    }
    if password.chars().count() < 6 {
        return Err(validation("password must be at least 6 characters"));
    }
    if password.len() > 1024 {
        return Err(GatewayError::Validation("password is too long".into()));
    }
    Ok(())
}
