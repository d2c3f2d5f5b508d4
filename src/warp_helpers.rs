use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;

use warp::{reject, Filter, Rejection, Reply};

use crate::db::DbPool;
use crate::downloader::Downloader;
use crate::flickr_client::SearchProvider;
use crate::media_store::MediaStore;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    pub timestamp: String,
}

#[derive(Debug)]
pub struct DatabaseError {
    pub message: String,
}

impl reject::Reject for DatabaseError {}

#[derive(Debug)]
pub struct NotFoundError;
impl reject::Reject for NotFoundError {}

/// The page search against the remote API failed.
#[derive(Debug)]
pub struct UpstreamError {
    pub message: String,
}

impl reject::Reject for UpstreamError {}

/// The requested page of search results was empty, even after the refresh
/// action's single retry from page 1.
#[derive(Debug)]
pub struct EmptyPageError;
impl reject::Reject for EmptyPageError {}

pub fn with_db(db_pool: DbPool) -> impl Filter<Extract = (DbPool,), Error = Infallible> + Clone {
    warp::any().map(move || db_pool.clone())
}

pub fn with_media(
    media: MediaStore,
) -> impl Filter<Extract = (MediaStore,), Error = Infallible> + Clone {
    warp::any().map(move || media.clone())
}

pub fn with_downloader(
    downloader: Downloader,
) -> impl Filter<Extract = (Downloader,), Error = Infallible> + Clone {
    warp::any().map(move || downloader.clone())
}

pub fn with_search(
    search: Arc<dyn SearchProvider>,
) -> impl Filter<Extract = (Arc<dyn SearchProvider>,), Error = Infallible> + Clone {
    warp::any().map(move || search.clone())
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let code;
    let message;
    let timestamp = chrono::Utc::now().to_rfc3339();

    if err.is_not_found() {
        code = warp::http::StatusCode::NOT_FOUND;
        message = "Not Found".to_string();
    } else if let Some(database_error) = err.find::<DatabaseError>() {
        code = warp::http::StatusCode::INTERNAL_SERVER_ERROR;
        message = database_error.message.clone();
    } else if err.find::<NotFoundError>().is_some() {
        code = warp::http::StatusCode::NOT_FOUND;
        message = "Resource not found".to_string();
    } else if err.find::<EmptyPageError>().is_some() {
        code = warp::http::StatusCode::NOT_FOUND;
        message = "No photos on this page".to_string();
    } else if let Some(upstream_error) = err.find::<UpstreamError>() {
        code = warp::http::StatusCode::BAD_GATEWAY;
        message = upstream_error.message.clone();
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        code = warp::http::StatusCode::PAYLOAD_TOO_LARGE;
        message = "Payload too large".to_string();
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        code = warp::http::StatusCode::METHOD_NOT_ALLOWED;
        message = "Method not allowed".to_string();
    } else {
        log::error!("Unhandled rejection: {:?}", err);
        code = warp::http::StatusCode::INTERNAL_SERVER_ERROR;
        message = "Internal server error".to_string();
    }

    let error_response = ErrorResponse {
        error: message,
        code: code.as_u16(),
        timestamp,
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&error_response),
        code,
    ))
}

pub fn cors() -> warp::cors::Builder {
    warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
}
