use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("{0}")]
    Validation(String),

    #[error("camera '{0}' is already registered")]
    Conflict(String),

    #[error("camera '{0}' not found")]
    NotFound(String),

    #[error("camera '{0}' does not accept pushed frames")]
    WrongSourceType(String),

    #[error("no frame available yet")]
    NoFrameYet,

    #[error("frame could not be decoded: {0}")]
    BadFrame(String),

    /// Bus transport failure. Never surfaced to HTTP callers; the adapter
    /// counts the event as dropped and moves on.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// Single-packet decode failure on the ingest path. Counted, not surfaced.
    #[error("decode error: {0}")]
    Decode(String),

    /// Stream-level failure. Drives the worker's reconnect state machine.
    #[error("source error: {0}")]
    Source(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Stable machine-readable kind for the structured error body.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "validation_error",
            IngestError::Conflict(_) => "conflict",
            IngestError::NotFound(_) => "not_found",
            IngestError::WrongSourceType(_) => "wrong_source_type",
            IngestError::NoFrameYet => "no_frame_yet",
            IngestError::BadFrame(_) => "bad_frame",
            IngestError::BusUnavailable(_) => "bus_unavailable",
            IngestError::Decode(_) => "decode_error",
            IngestError::Source(_) => "source_error",
            IngestError::Config(_) => "config_error",
            IngestError::Io(_) => "io_error",
        }
    }
}

impl actix_web::ResponseError for IngestError {
    fn status_code(&self) -> StatusCode {
        match self {
            IngestError::Validation(_) | IngestError::BadFrame(_) => StatusCode::BAD_REQUEST,
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::Conflict(_)
            | IngestError::WrongSourceType(_)
            | IngestError::NoFrameYet => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::ResponseError;

    #[test]
    fn control_plane_status_mapping() {
        assert_eq!(
            IngestError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            IngestError::Conflict("cam".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            IngestError::NotFound("cam".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            IngestError::WrongSourceType("cam".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(IngestError::NoFrameYet.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            IngestError::BadFrame("garbage".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(IngestError::NoFrameYet.kind(), "no_frame_yet");
        assert_eq!(IngestError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(
            IngestError::WrongSourceType("x".into()).kind(),
            "wrong_source_type"
        );
    }
}
