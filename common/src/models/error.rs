use std::fmt::{Display, Formatter};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use strum::Display as EnumDisplay;

/// Every outcome the kernel can surface to a caller. Handlers map these to
/// status codes; kernel code never inspects error text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumDisplay)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IslandNotFound,
    TeamNotFound,
    SnapshotNotFound,
    AlreadyExists,
    InvalidState,
    CapacityExhausted,
    DriverUnavailable,
    DriverTimeout,
    RetryExceeded,
    Internal,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::IslandNotFound | Self::TeamNotFound | Self::SnapshotNotFound => {
                StatusCode::NOT_FOUND
            }
            Self::AlreadyExists | Self::InvalidState | Self::RetryExceeded => {
                StatusCode::CONFLICT
            }
            Self::CapacityExhausted | Self::DriverUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::DriverTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::IslandNotFound => "island not found",
            Self::TeamNotFound => "team not found",
            Self::SnapshotNotFound => "snapshot not found",
            Self::AlreadyExists => "an island already exists for this owner",
            Self::InvalidState => "the requested transition is illegal from the current status",
            Self::CapacityExhausted => "the request could not be queued",
            Self::DriverUnavailable => "hypervisor unavailable",
            Self::DriverTimeout => "hypervisor operation timed out",
            Self::RetryExceeded => "update retry budget exhausted",
            Self::Internal => "internal server error",
        }
    }
}

/// Wire-level error body. Does not leak anything beyond the short message
/// derived from the [`ErrorKind`].
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
    pub status_code: u16,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self {
            message: kind.message().to_string(),
            status_code: kind.status().as_u16(),
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status_code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), axum::Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_status_codes() {
        assert_eq!(ErrorKind::IslandNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::InvalidState.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::AlreadyExists.status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorKind::DriverUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorKind::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
