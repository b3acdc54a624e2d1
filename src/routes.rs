use bytes::{Buf, BufMut};
use futures_util::TryStreamExt;
use warp::multipart::FormData;
use warp::{Filter, Rejection, Reply};

use crate::error::ApiError;
use crate::intake::Upload;
use crate::pipeline::Pipeline;

/// Multipart field carrying the images.
const FILES_FIELD: &str = "files";

/// `POST /remove-background/`
pub fn remove_background(
    pipeline: Pipeline,
    max_upload_bytes: u64,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("remove-background")
        .and(warp::path::end())
        .and(warp::post())
        // no Content-Length requirement, so chunked bodies get through; the
        // limit is enforced while reading the parts
        .and(warp::multipart::form().max_length(None))
        .and(warp::any().map(move || pipeline.clone()))
        .and(warp::any().map(move || max_upload_bytes))
        .and_then(handle_remove_background)
}

async fn handle_remove_background(
    form: FormData,
    pipeline: Pipeline,
    max_upload_bytes: u64,
) -> Result<impl Reply, Rejection> {
    let uploads = collect_uploads(form, max_upload_bytes)
        .await
        .map_err(warp::reject::custom)?;
    let response = pipeline.run(uploads).await.map_err(warp::reject::custom)?;
    Ok(warp::reply::json(&response))
}

async fn collect_uploads(form: FormData, max_upload_bytes: u64) -> Result<Vec<Upload>, ApiError> {
    let malformed = |e: warp::Error| ApiError::MalformedForm(e.to_string());
    futures_util::pin_mut!(form);

    // each part is drained before the next one is pulled off the body
    let mut uploads = Vec::new();
    let mut received: u64 = 0;
    while let Some(part) = form.try_next().await.map_err(malformed)? {
        if part.name() != FILES_FIELD {
            continue;
        }
        let filename = part.filename().unwrap_or_default().to_string();

        let stream = part.stream();
        futures_util::pin_mut!(stream);
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.try_next().await.map_err(malformed)? {
            received += chunk.remaining() as u64;
            if received > max_upload_bytes {
                return Err(ApiError::TooLarge {
                    limit: max_upload_bytes,
                });
            }
            bytes.put(chunk);
        }
        uploads.push(Upload { filename, bytes });
    }

    if uploads.is_empty() {
        return Err(ApiError::MissingFiles);
    }
    Ok(uploads)
}
