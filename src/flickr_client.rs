use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::FlickrConfig;

/// Fixed page size for location searches.
pub const PHOTOS_PER_PAGE: u32 = 21;

#[derive(Debug, thiserror::Error)]
pub enum FlickrError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Parse(String),
}

/// The four fields needed to rebuild a photo's remote URL, exactly as they
/// appear in a search result descriptor. Stored one-to-one with each photo
/// record so interrupted downloads can be re-initiated later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathInfo {
    pub farm: u64,
    pub server: String,
    pub id: String,
    pub secret: String,
}

impl PathInfo {
    /// Remote URL for the photo. The format is fixed by Flickr's static image
    /// hosts and must be reproduced exactly.
    pub fn photo_url(&self) -> String {
        format!(
            "https://farm{}.static.flickr.com/{}/{}_{}.jpg",
            self.farm, self.server, self.id, self.secret
        )
    }

    /// Local file name, derived from the remote identifier so existence
    /// checks need no other record state.
    pub fn file_name(&self) -> String {
        format!("{}.jpg", self.id)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    photos: PhotoPage,
}

#[derive(Debug, Deserialize)]
struct PhotoPage {
    photo: Vec<PathInfo>,
}

/// One remote lookup per marker and page. Failures are returned as values;
/// retry, if any, is the caller's concern.
pub trait SearchProvider: Send + Sync {
    fn search_photos_by_location(
        &self,
        latitude: f64,
        longitude: f64,
        page: u32,
    ) -> Result<Vec<PathInfo>, FlickrError>;
}

/// Fetches the raw bytes for one image URL.
pub trait PhotoFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FlickrError>;
}

pub struct FlickrClient {
    config: FlickrConfig,
}

impl FlickrClient {
    pub fn new(config: FlickrConfig) -> Self {
        Self { config }
    }
}

impl SearchProvider for FlickrClient {
    fn search_photos_by_location(
        &self,
        latitude: f64,
        longitude: f64,
        page: u32,
    ) -> Result<Vec<PathInfo>, FlickrError> {
        debug!(
            "Searching photos at ({}, {}), page {}",
            latitude, longitude, page
        );

        let mut response = ureq::get(&self.config.base_url)
            .query("method", "flickr.photos.search")
            .query("api_key", &self.config.api_key)
            .query("safe_search", "1")
            .query("format", "json")
            .query("nojsoncallback", "1")
            .query("lat", latitude.to_string())
            .query("lon", longitude.to_string())
            .query("per_page", PHOTOS_PER_PAGE.to_string())
            .query("page", page.to_string())
            .call()
            .map_err(|e| FlickrError::Network(e.to_string()))?;

        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| FlickrError::Network(e.to_string()))?;

        let parsed: SearchResponse =
            serde_json::from_str(&body).map_err(|e| FlickrError::Parse(e.to_string()))?;

        Ok(parsed.photos.photo)
    }
}

impl PhotoFetcher for FlickrClient {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FlickrError> {
        let mut response = ureq::get(url)
            .call()
            .map_err(|e| FlickrError::Network(e.to_string()))?;

        response
            .body_mut()
            .read_to_vec()
            .map_err(|e| FlickrError::Network(e.to_string()))
    }
}
