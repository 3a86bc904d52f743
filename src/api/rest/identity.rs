use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::AppError;
use crate::models::coordinate::OperatorId;

pub const OPERATOR_HEADER: &str = "x-operator-id";

/// The authenticated operator, as asserted by the upstream auth proxy.
/// Duty routes only ever act on this operator's own duty.
pub struct OperatorIdentity(pub OperatorId);

#[async_trait]
impl<S> FromRequestParts<S> for OperatorIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(OPERATOR_HEADER)
            .ok_or(AppError::Unauthorized)?
            .to_str()
            .map_err(|_| AppError::Unauthorized)?;

        Ok(Self(OperatorId::new(raw)?))
    }
}
