use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use layerlift_delta::{
    wire::{PROTOCOL_VERSION, VERSION_HEADER},
    Error,
};
use tracing::warn;

/// Any failure of the HTTP surface: a 500 with a plain-text diagnostic.
pub struct AppError(Error);

impl From<Error> for AppError {
    fn from(value: Error) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        warn!(err=%self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [
                (VERSION_HEADER, PROTOCOL_VERSION),
                ("content-type", "text/plain; charset=utf-8"),
            ],
            format!("{}\n", self.0),
        )
            .into_response()
    }
}
