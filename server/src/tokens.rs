use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::JwtConfig;

/// The two token kinds use separate signing secrets and lifetimes, and
/// carry their kind as a claim so neither can stand in for the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub username: String,
    pub kind: TokenKind,
    /// Unique per issued token, so rotation always produces a new
    /// value even within the same second.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid or expired token")]
pub struct InvalidToken;

#[derive(Clone)]
pub struct TokenIssuer {
    config: JwtConfig,
}

impl TokenIssuer {
    pub fn new(config: JwtConfig) -> Self {
        Self { config }
    }

    /// Sign a short-lived access token for the given user.
    pub fn issue_access(&self, user_id: Uuid, username: &str) -> color_eyre::Result<String> {
        self.issue(user_id, username, TokenKind::Access)
    }

    /// Sign a longer-lived refresh token for the given user.
    pub fn issue_refresh(&self, user_id: Uuid, username: &str) -> color_eyre::Result<String> {
        self.issue(user_id, username, TokenKind::Refresh)
    }

    fn issue(&self, user_id: Uuid, username: &str, kind: TokenKind) -> color_eyre::Result<String> {
        let now = Utc::now();
        let ttl = match kind {
            TokenKind::Access => Duration::minutes(self.config.access_ttl_minutes),
            TokenKind::Refresh => Duration::days(self.config.refresh_ttl_days),
        };

        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_owned(),
            kind,
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret(kind).as_bytes()),
        )?;

        Ok(token)
    }

    /// Decode and validate a token of the expected kind. Bad signature,
    /// expiry, and kind mismatch all collapse into `InvalidToken`.
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, InvalidToken> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret(kind).as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| InvalidToken)?;

        if data.claims.kind != kind {
            return Err(InvalidToken);
        }

        Ok(data.claims)
    }

    fn secret(&self, kind: TokenKind) -> &str {
        match kind {
            TokenKind::Access => &self.config.access_secret,
            TokenKind::Refresh => &self.config.refresh_secret,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_issuer() -> TokenIssuer {
        TokenIssuer::new(JwtConfig {
            access_secret: "access-test-secret".to_string(),
            refresh_secret: "refresh-test-secret".to_string(),
            access_ttl_minutes: 15,
            refresh_ttl_days: 10,
        })
    }

    #[test]
    fn access_token_round_trip() -> color_eyre::Result<()> {
        let issuer = test_issuer();
        let user_id = Uuid::new_v4();

        let token = issuer.issue_access(user_id, "annlee")?;
        let claims = issuer.verify(&token, TokenKind::Access).unwrap();

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.username, "annlee");
        assert_eq!(claims.kind, TokenKind::Access);
        assert!(claims.exp > claims.iat);

        Ok(())
    }

    #[test]
    fn refresh_token_is_not_an_access_token() -> color_eyre::Result<()> {
        let issuer = test_issuer();
        let user_id = Uuid::new_v4();

        let refresh = issuer.issue_refresh(user_id, "annlee")?;
        assert!(issuer.verify(&refresh, TokenKind::Access).is_err());
        assert!(issuer.verify(&refresh, TokenKind::Refresh).is_ok());

        Ok(())
    }

    #[test]
    fn consecutive_tokens_are_distinct() -> color_eyre::Result<()> {
        let issuer = test_issuer();
        let user_id = Uuid::new_v4();

        let first = issuer.issue_refresh(user_id, "annlee")?;
        let second = issuer.issue_refresh(user_id, "annlee")?;
        assert_ne!(first, second);

        Ok(())
    }

    #[test]
    fn tampered_token_is_rejected() -> color_eyre::Result<()> {
        let issuer = test_issuer();
        let token = issuer.issue_access(Uuid::new_v4(), "annlee")?;

        // Flip a character in the signature segment
        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });

        assert!(issuer.verify(&tampered, TokenKind::Access).is_err());

        Ok(())
    }

    #[test]
    fn token_signed_with_wrong_secret_is_rejected() -> color_eyre::Result<()> {
        let issuer = test_issuer();
        let other = TokenIssuer::new(JwtConfig {
            access_secret: "some-other-secret".to_string(),
            refresh_secret: "refresh-test-secret".to_string(),
            access_ttl_minutes: 15,
            refresh_ttl_days: 10,
        });

        let token = other.issue_access(Uuid::new_v4(), "annlee")?;
        assert!(issuer.verify(&token, TokenKind::Access).is_err());

        Ok(())
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = test_issuer();
        let now = Utc::now();

        // Expired well past the default validation leeway
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            username: "annlee".to_string(),
            kind: TokenKind::Access,
            jti: Uuid::new_v4().to_string(),
            iat: (now - Duration::hours(2)).timestamp(),
            exp: (now - Duration::hours(1)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret("access-test-secret".as_bytes()),
        )
        .unwrap();

        assert!(issuer.verify(&token, TokenKind::Access).is_err());
    }
}
