use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};

use crate::AppState;

/// A caller identified by the `X-User-Id` header. Stands in for the
/// session-cookie auth the Python original shares with the rest of
/// open-webui; this crate has no user/session store of its own, so request
/// identity is taken as asserted by whatever sits in front of it (spec.md
/// §7, "Auth/identity — assume a verified caller identity is already
/// available").
#[derive(Clone, Debug)]
pub struct VerifiedUser {
    pub user_id: String,
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for VerifiedUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or((StatusCode::UNAUTHORIZED, "missing X-User-Id header"))?;
        Ok(VerifiedUser {
            user_id: user_id.to_string(),
        })
    }
}

/// An admin caller, authenticated by the shared `ADMIN_TOKEN` (spec.md §7).
#[derive(Clone, Debug)]
pub struct AdminUser {
    pub user_id: String,
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let verified = VerifiedUser::from_request_parts(parts, state).await?;
        let token = parts
            .headers
            .get("x-admin-token")
            .and_then(|v| v.to_str().ok())
            .ok_or((StatusCode::FORBIDDEN, "missing X-Admin-Token header"))?;
        if token != state.config.admin_token {
            return Err((StatusCode::FORBIDDEN, "invalid admin token"));
        }
        Ok(AdminUser {
            user_id: verified.user_id,
        })
    }
}
