use axum::{
    extract::{
        multipart::MultipartError,
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gymdesk_media::MediaError;
use serde::Serialize;
use tracing::error;

use crate::AppState;

/// Slack on top of the configured attachment cap so multipart framing
/// does not push a limit-sized file over the request body limit.
pub const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Serialize)]
struct UploadResponse {
    #[serde(rename = "fileUrl")]
    file_url: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl ErrorBody {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// A multipart read that failed because the request body outgrew the
/// route's body limit is still an oversize upload, not a framing error.
fn multipart_rejection(err: &MultipartError, context: &str) -> (StatusCode, ErrorBody) {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorBody::new("file exceeds the upload limit"),
        )
    } else {
        (
            StatusCode::BAD_REQUEST,
            ErrorBody::new(format!("{context}: {err}")),
        )
    }
}

pub async fn upload_attachment(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    #[cfg(feature = "metrics")]
    let route = "messages.upload";

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                let status = StatusCode::BAD_REQUEST;
                #[cfg(feature = "metrics")]
                state.record_http_request(route, status.as_u16());
                return (status, Json(ErrorBody::new("file field missing"))).into_response();
            }
            Err(err) => {
                let (status, body) = multipart_rejection(&err, "malformed multipart body");
                #[cfg(feature = "metrics")]
                state.record_http_request(route, status.as_u16());
                return (status, Json(body)).into_response();
            }
        };

        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let original_name = field.file_name().unwrap_or(UPLOAD_FIELD).to_string();
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(err) => {
                let (status, body) = multipart_rejection(&err, "unreadable file field");
                #[cfg(feature = "metrics")]
                state.record_http_request(route, status.as_u16());
                return (status, Json(body)).into_response();
            }
        };

        return match state.attachments().store(&original_name, &data).await {
            Ok(stored) => {
                #[cfg(feature = "metrics")]
                state.record_http_request(route, StatusCode::OK.as_u16());
                (StatusCode::OK, Json(UploadResponse { file_url: stored.url })).into_response()
            }
            Err(err @ MediaError::TooLarge { .. }) => {
                let status = StatusCode::PAYLOAD_TOO_LARGE;
                #[cfg(feature = "metrics")]
                state.record_http_request(route, status.as_u16());
                (status, Json(ErrorBody::new(err.to_string()))).into_response()
            }
            Err(err) => {
                error!(?err, "failed to store attachment");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                #[cfg(feature = "metrics")]
                state.record_http_request(route, status.as_u16());
                (status, Json(ErrorBody::new("storage_error"))).into_response()
            }
        };
    }
}
