use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};

use crate::AppState;

/// Extractor that validates the `X-Admin-Key` header against `config.admin_api_key`.
/// Guards the operator surface: company administration and cache clearing.
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get("X-Admin-Key")
            .and_then(|v| v.to_str().ok())
            .ok_or((StatusCode::UNAUTHORIZED, "Missing X-Admin-Key header"))?;

        if key != state.config.admin_api_key {
            return Err((StatusCode::UNAUTHORIZED, "Invalid admin key"));
        }

        Ok(AdminAuth)
    }
}
