use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use exchange_core::ExchangeError;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("event not found")]
    EventNotFound,
    #[error("event already exists")]
    EventExists,
    #[error("event id must be letters, digits, '-' or '_'")]
    InvalidEventId,
    #[error("log in first")]
    LoginRequired,
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::EventNotFound => StatusCode::NOT_FOUND,
            ApiError::EventExists => StatusCode::CONFLICT,
            ApiError::InvalidEventId => StatusCode::BAD_REQUEST,
            ApiError::LoginRequired => StatusCode::UNAUTHORIZED,
            ApiError::Exchange(err) => match err {
                ExchangeError::InsufficientParticipants { .. }
                | ExchangeError::DuplicateParticipant(_)
                | ExchangeError::InvalidAssignment(_)
                | ExchangeError::InvalidCountry(_)
                | ExchangeError::MissingField(_)
                | ExchangeError::EmptyMessage => StatusCode::BAD_REQUEST,
                ExchangeError::UnknownParticipant(_) => StatusCode::NOT_FOUND,
                ExchangeError::InvalidStage(_)
                | ExchangeError::WrongStage { .. }
                | ExchangeError::Unassigned(_)
                | ExchangeError::NoSender(_) => StatusCode::CONFLICT,
                ExchangeError::Store(_) | ExchangeError::Delivery(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
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
