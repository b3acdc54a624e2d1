use serde_derive::Serialize;
use std::convert::Infallible;
use thiserror::Error;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

/// Errors surfaced to API clients. Any of them aborts the whole batch.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid image file: {filename}--{reason}")]
    InvalidImage { filename: String, reason: String },

    #[error(
        "Unsupported image format for file: {filename}. \
         Please upload an image in WEBP, JPG, JPEG, or PNG format."
    )]
    UnsupportedFormat { filename: String },

    #[error("Segmentation pipeline error for file {filename}: {reason}")]
    Segmentation { filename: String, reason: String },

    #[error("Image encoding error for file {filename}: {reason}")]
    Encoding { filename: String, reason: String },

    #[error("Malformed multipart body: {0}")]
    MalformedForm(String),

    #[error("Field required: files")]
    MissingFiles,

    #[error("Upload exceeds the limit of {limit} bytes")]
    TooLarge { limit: u64 },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidImage { .. }
            | ApiError::UnsupportedFormat { .. }
            | ApiError::MalformedForm(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingFiles => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Segmentation { .. } | ApiError::Encoding { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl warp::reject::Reject for ApiError {}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// Renders every rejection as `{"detail": ...}` with a matching status code.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, detail) = if let Some(e) = err.find::<ApiError>() {
        (e.status(), e.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(e) = err.find::<warp::reject::PayloadTooLarge>() {
        (StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::UnsupportedMediaType>() {
        (StatusCode::UNSUPPORTED_MEDIA_TYPE, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::MissingHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::LengthRequired>() {
        (StatusCode::LENGTH_REQUIRED, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed".to_string(),
        )
    } else {
        log::error!("unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody { detail }),
        status,
    ))
}
