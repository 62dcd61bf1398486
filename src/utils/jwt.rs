use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{AppErr, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Participant,
}

/// `sub` is the admin id for admins and the session token for participants.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub:  String,
    pub role: Role,
    pub exp:  i64,
}

pub fn sign(sub: &str, role: Role, secret: &str, ttl: Duration) -> AppResult<String> {
    let c = Claims { sub: sub.into(), role, exp: Utc::now().timestamp() + ttl.as_secs() as i64 };
    Ok(encode(&Header::default(), &c, &EncodingKey::from_secret(secret.as_bytes()))?)
}

pub fn verify(token: &str, secret: &str) -> AppResult<Claims> {
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::new(Algorithm::HS256))
        .map(|d| d.claims)
        .map_err(|e| {
            tracing::debug!(error = %e, "rejected bearer token");
            AppErr::Unauthorized("invalid or expired token")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn signed_token_verifies_with_role() {
        let t = sign("admin-7", Role::Admin, SECRET, Duration::from_secs(60)).unwrap();
        let c = verify(&t, SECRET).unwrap();
        assert_eq!(c.sub, "admin-7");
        assert_eq!(c.role, Role::Admin);
    }

    #[test]
    fn wrong_secret_or_garbage_is_unauthorized() {
        let t = sign("p", Role::Participant, SECRET, Duration::from_secs(60)).unwrap();
        assert!(matches!(verify(&t, "other"), Err(AppErr::Unauthorized(_))));
        assert!(matches!(verify("not.a.jwt", SECRET), Err(AppErr::Unauthorized(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let c = Claims { sub: "p".into(), role: Role::Participant, exp: Utc::now().timestamp() - 3600 };
        let t = encode(&Header::default(), &c, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
        assert!(verify(&t, SECRET).is_err());
    }
}
