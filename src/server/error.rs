//! Mapping of hub errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::channel::LogError;
use crate::hub::HubError;
use crate::registry::RegistryError;
use crate::types::InvalidName;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("invalid request body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidName(#[from] InvalidName),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl From<LogError> for ApiError {
    fn from(e: LogError) -> Self {
        ApiError::Hub(e.into())
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::Hub(e.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Hub(HubError::Log(e)) => match e {
                LogError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
                LogError::DuplicateChannel(_) => StatusCode::CONFLICT,
                LogError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                LogError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Hub(HubError::Registry(e)) => match e {
                RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
                RegistryError::DuplicateName(_) | RegistryError::Conflict(_) => StatusCode::CONFLICT,
                RegistryError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            },
            ApiError::Hub(HubError::Snapshot(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InvalidBody(_) | ApiError::InvalidName(_) | ApiError::InvalidParam(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelName, GroupConfigError, GroupName};

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let orders = ChannelName::new("orders").unwrap();
        let g = GroupName::new("g").unwrap();

        assert_eq!(
            ApiError::from(LogError::ChannelNotFound(orders.clone())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(LogError::DuplicateChannel(orders.clone())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(RegistryError::DuplicateName(g.clone())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(RegistryError::Conflict("channelUrl".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(RegistryError::InvalidConfig(GroupConfigError::UnknownChannel(orders)))
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RegistryError::NotFound(g)).status(),
            StatusCode::NOT_FOUND
        );
    }
}
