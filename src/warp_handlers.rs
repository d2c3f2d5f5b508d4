use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;

use warp::{reject, Rejection, Reply};

use crate::db::{DbPool, MapViewport, Marker, Photo};
use crate::downloader::Downloader;
use crate::flickr_client::SearchProvider;
use crate::gallery::{self, CollectionError};
use crate::media_store::MediaStore;
use crate::warp_helpers::{DatabaseError, EmptyPageError, NotFoundError, UpstreamError};

#[derive(Debug, Deserialize)]
pub struct CreateMarkerRequest {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Serialize)]
pub struct PhotoState {
    pub id: i64,
    pub file_name: String,
    pub url: String,
    pub downloaded: bool,
    pub is_downloading: bool,
}

#[derive(Debug, Serialize)]
pub struct GalleryResponse {
    pub marker_id: i64,
    pub photos: Vec<PhotoState>,
    pub all_downloaded: bool,
}

pub async fn health_check() -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

pub async fn ready_check(db_pool: DbPool) -> Result<impl Reply, Rejection> {
    // Test database connection
    match db_pool.get() {
        Ok(_) => Ok(warp::reply::json(&json!({
            "status": "ready",
            "database": "connected",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            log::error!("Database connection failed: {}", e);
            Err(reject::custom(DatabaseError {
                message: "Database connection failed".to_string(),
            }))
        }
    }
}

/// Places a marker and prefetches its first photo collection in the
/// background. Prefetch failures are only logged; opening the gallery
/// re-attempts naturally, and unlike the refresh action this path never
/// retries an empty page.
pub async fn create_marker(
    req: CreateMarkerRequest,
    db_pool: DbPool,
    search: Arc<dyn SearchProvider>,
    downloader: Downloader,
) -> Result<impl Reply, Rejection> {
    let marker = match Marker::create(&db_pool, req.latitude, req.longitude) {
        Ok(marker) => marker,
        Err(e) => {
            log::error!("Database error: {}", e);
            return Err(reject::custom(DatabaseError {
                message: format!("Database error: {}", e),
            }));
        }
    };

    let marker_id = marker.id;
    tokio::task::spawn_blocking(move || {
        if let Err(e) = gallery::fetch_collection(&db_pool, search.as_ref(), &downloader, marker_id)
        {
            log::warn!("Initial photo fetch for marker {} failed: {}", marker_id, e);
        }
    });

    Ok(warp::reply::with_status(
        warp::reply::json(&marker),
        warp::http::StatusCode::CREATED,
    ))
}

pub async fn list_markers(db_pool: DbPool) -> Result<impl Reply, Rejection> {
    match Marker::list_all(&db_pool) {
        Ok(markers) => Ok(warp::reply::json(&markers)),
        Err(e) => {
            log::error!("Database error: {}", e);
            Err(reject::custom(DatabaseError {
                message: format!("Database error: {}", e),
            }))
        }
    }
}

pub async fn delete_marker(
    marker_id: i64,
    db_pool: DbPool,
    downloader: Downloader,
    media: MediaStore,
) -> Result<impl Reply, Rejection> {
    match gallery::delete_marker(&db_pool, &downloader, &media, marker_id) {
        Ok(true) => Ok(warp::reply::json(&json!({"status": "deleted"}))),
        Ok(false) => Err(reject::custom(NotFoundError)),
        Err(e) => Err(collection_rejection(e)),
    }
}

/// Gallery state for one marker. Rendering the gallery doubles as the
/// re-attempt trigger: any record without a backing file and without a
/// download in flight gets one started here.
pub async fn get_gallery(
    marker_id: i64,
    db_pool: DbPool,
    downloader: Downloader,
    media: MediaStore,
) -> Result<impl Reply, Rejection> {
    if marker_not_found(&db_pool, marker_id)? {
        return Err(reject::custom(NotFoundError));
    }

    let photos = match Photo::for_marker(&db_pool, marker_id) {
        Ok(photos) => photos,
        Err(e) => {
            log::error!("Database error: {}", e);
            return Err(reject::custom(DatabaseError {
                message: format!("Database error: {}", e),
            }));
        }
    };

    let mut states = Vec::with_capacity(photos.len());
    let mut all_downloaded = true;
    for photo in &photos {
        let downloaded = media.exists(&photo.file_name);
        if !downloaded {
            all_downloaded = false;
            downloader.spawn(photo);
        }
        states.push(PhotoState {
            id: photo.id,
            file_name: photo.file_name.clone(),
            url: photo.path_info.photo_url(),
            downloaded,
            is_downloading: downloader.is_downloading(photo.id),
        });
    }

    Ok(warp::reply::json(&GalleryResponse {
        marker_id,
        photos: states,
        all_downloaded,
    }))
}

/// The "new collection" action: replaces the marker's records with the next
/// page of results.
pub async fn refresh_gallery(
    marker_id: i64,
    db_pool: DbPool,
    search: Arc<dyn SearchProvider>,
    downloader: Downloader,
    media: MediaStore,
) -> Result<impl Reply, Rejection> {
    let result = tokio::task::spawn_blocking(move || {
        gallery::refresh_collection(&db_pool, search.as_ref(), &downloader, &media, marker_id)
    })
    .await
    .map_err(|e| {
        log::error!("Refresh task failed: {}", e);
        reject::custom(DatabaseError {
            message: "Refresh task failed".to_string(),
        })
    })?;

    match result {
        Ok(photos) => Ok(warp::reply::json(&json!({
            "marker_id": marker_id,
            "created": photos.len(),
        }))),
        Err(e) => Err(collection_rejection(e)),
    }
}

/// Serves the downloaded bytes for one photo. A missing file starts a
/// re-download (subject to the in-flight guard) before rejecting, so the next
/// render finds it.
pub async fn get_photo_file(
    photo_id: i64,
    db_pool: DbPool,
    downloader: Downloader,
    media: MediaStore,
) -> Result<impl Reply, Rejection> {
    let photo = match Photo::find_by_id(&db_pool, photo_id) {
        Ok(Some(photo)) => photo,
        Ok(None) => return Err(reject::custom(NotFoundError)),
        Err(e) => {
            log::error!("Database error: {}", e);
            return Err(reject::custom(DatabaseError {
                message: format!("Database error: {}", e),
            }));
        }
    };

    match media.read(&photo.file_name) {
        Ok(file_data) => Ok(warp::reply::with_header(
            file_data,
            "content-type",
            "image/jpeg",
        )),
        Err(_) => {
            downloader.spawn(&photo);
            Err(reject::custom(NotFoundError))
        }
    }
}

pub async fn delete_photo(
    photo_id: i64,
    db_pool: DbPool,
    downloader: Downloader,
    media: MediaStore,
) -> Result<impl Reply, Rejection> {
    match gallery::delete_photo(&db_pool, &downloader, &media, photo_id) {
        Ok(true) => Ok(warp::reply::json(&json!({"status": "deleted"}))),
        Ok(false) => Err(reject::custom(NotFoundError)),
        Err(e) => Err(collection_rejection(e)),
    }
}

pub async fn get_map_state(db_pool: DbPool) -> Result<impl Reply, Rejection> {
    match MapViewport::load(&db_pool) {
        Ok(Some(viewport)) => Ok(warp::reply::json(&viewport)),
        Ok(None) => Err(reject::custom(NotFoundError)),
        Err(e) => {
            log::error!("Database error: {}", e);
            Err(reject::custom(DatabaseError {
                message: format!("Database error: {}", e),
            }))
        }
    }
}

pub async fn put_map_state(
    viewport: MapViewport,
    db_pool: DbPool,
) -> Result<impl Reply, Rejection> {
    match viewport.save(&db_pool) {
        Ok(()) => Ok(warp::reply::json(&viewport)),
        Err(e) => {
            log::error!("Database error: {}", e);
            Err(reject::custom(DatabaseError {
                message: format!("Database error: {}", e),
            }))
        }
    }
}

fn marker_not_found(db_pool: &DbPool, marker_id: i64) -> Result<bool, Rejection> {
    match Marker::find_by_id(db_pool, marker_id) {
        Ok(marker) => Ok(marker.is_none()),
        Err(e) => {
            log::error!("Database error: {}", e);
            Err(reject::custom(DatabaseError {
                message: format!("Database error: {}", e),
            }))
        }
    }
}

fn collection_rejection(error: CollectionError) -> Rejection {
    match error {
        CollectionError::UnknownMarker(_) => reject::custom(NotFoundError),
        CollectionError::EmptyPage => reject::custom(EmptyPageError),
        CollectionError::Search(e) => reject::custom(UpstreamError {
            message: e.to_string(),
        }),
        CollectionError::Database(message) => {
            log::error!("Database error: {}", message);
            reject::custom(DatabaseError { message })
        }
    }
}
