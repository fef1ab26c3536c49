use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::errors::{AppError, ErrorCode};
use crate::types::auth::{AuthUser, Claims};

/// Bearer-token extractor. Every authenticated handler takes an
/// `AuthUser` argument; rejections map straight onto the error envelope.
#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        let claims = decode_claims(token)?;

        if claims.is_expired() {
            return Err(AppError::new(ErrorCode::TokenExpired, "token has expired"));
        }

        Ok(AuthUser::from(claims))
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::new(ErrorCode::Unauthorized, "missing authorization header"))?
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            AppError::new(
                ErrorCode::Unauthorized,
                "authorization header must use Bearer scheme",
            )
        })
}

fn decode_claims(token: &str) -> Result<Claims, AppError> {
    let jwt_secret = std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "development-secret-change-in-production".to_string());

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            AppError::new(ErrorCode::TokenExpired, "token has expired")
        }
        _ => AppError::new(ErrorCode::TokenInvalid, format!("invalid token: {e}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::auth::UserRole;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use uuid::Uuid;

    const DEV_SECRET: &str = "development-secret-change-in-production";

    fn sign(claims: &Claims) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(DEV_SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn bearer_scheme_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Basic abc123".parse().unwrap());
        let err = bearer_token(&headers).unwrap_err();
        assert_eq!(err.code(), "E0004");
    }

    #[test]
    fn missing_header_is_unauthorized() {
        let headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn valid_token_round_trips() {
        std::env::set_var("JWT_SECRET", DEV_SECRET);
        let user_id = Uuid::new_v4();
        let token = sign(&Claims::new(user_id, UserRole::Premium, 900));
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert!(claims.is_premium());
    }

    #[test]
    fn expired_token_is_rejected() {
        std::env::set_var("JWT_SECRET", DEV_SECRET);
        let mut claims = Claims::new(Uuid::new_v4(), UserRole::User, 900);
        claims.iat -= 3600;
        claims.exp = claims.iat + 900;
        let err = decode_claims(&sign(&claims)).unwrap_err();
        assert_eq!(err.code(), "E1001");
    }

    #[test]
    fn garbage_token_is_invalid() {
        std::env::set_var("JWT_SECRET", DEV_SECRET);
        let err = decode_claims("not-a-jwt").unwrap_err();
        assert_eq!(err.code(), "E1002");
    }
}
