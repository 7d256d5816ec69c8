//! Request extractors.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use buildplane_core::ResourceId;
use buildplane_core::authz::Subject;
use buildplane_db::Queries;

use crate::AppState;
use crate::error::ApiError;

/// Header carrying the id of the calling user.
pub const USER_HEADER: &str = "x-buildplane-user";

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct Caller(pub Subject);

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {USER_HEADER} header")))?;
        let user_id: ResourceId = raw
            .parse()
            .map_err(|_| ApiError::Unauthorized(format!("invalid user id {raw:?}")))?;
        let user = state.store().get_user(user_id).await.map_err(|e| {
            if e.is_not_found() {
                ApiError::Unauthorized(format!("unknown user {user_id}"))
            } else {
                e.into()
            }
        })?;
        Ok(Caller(Subject::from(&user)))
    }
}
