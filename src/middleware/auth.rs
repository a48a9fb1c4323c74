use crate::{auth::verify_jwt, error::AppError, state::AppState};
use axum::{
    body::Body,
    extract::{State, FromRequestParts},
    http::{Request, request::Parts},
    middleware::Next,
    response::Response,
    async_trait,
};
use uuid::Uuid;

/// Pulls the bearer token from the Authorization header, or from `?token=`
/// for WebSocket upgrades where browsers cannot set headers.
fn extract_token(req: &Request<Body>) -> Result<&str, AppError> {
    if let Some(auth_header) = req.headers().get("Authorization").and_then(|h| h.to_str().ok()) {
        return auth_header
            .strip_prefix("Bearer ")
            .ok_or(AppError::Unauthorized("Invalid credentials".to_string()));
    }

    req.uri()
        .query()
        .unwrap_or("")
        .split('&')
        .find_map(|p| p.strip_prefix("token="))
        .filter(|token| !token.is_empty())
        .ok_or(AppError::Unauthorized("Invalid credentials".to_string()))
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let claims = verify_jwt(extract_token(&req)?, &state.config.jwt_secret)?;
    let user_id = claims.user_id()?;

    if !state.user_directory.exists(user_id).await? {
        return Err(AppError::Unauthorized("User not found".to_string()));
    }

    req.extensions_mut().insert(user_id);

    Ok(next.run(req).await)
}

// Extractor for getting user_id from request extensions
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Uuid>()
            .copied()
            .map(AuthUser)
            .ok_or(AppError::Unauthorized("Invalid credentials".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, header: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = header {
            builder = builder.header("Authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_token_from_header_or_query() {
        assert_eq!(extract_token(&request("/api/ws", Some("Bearer abc"))).unwrap(), "abc");
        assert_eq!(extract_token(&request("/api/ws?x=1&token=xyz", None)).unwrap(), "xyz");
        assert!(extract_token(&request("/api/ws", Some("Basic abc"))).is_err());
        assert!(extract_token(&request("/api/ws?token=", None)).is_err());
        assert!(extract_token(&request("/api/ws", None)).is_err());
    }
}
