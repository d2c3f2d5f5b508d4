use log::{info, warn};

use crate::db::{DbPool, Marker, Photo};
use crate::downloader::Downloader;
use crate::flickr_client::{FlickrError, SearchProvider};
use crate::media_store::MediaStore;

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("photo search failed: {0}")]
    Search(#[from] FlickrError),
    #[error("no photos on this page")]
    EmptyPage,
    #[error("marker {0} not found")]
    UnknownMarker(i64),
    #[error("database error: {0}")]
    Database(String),
}

fn db_err(e: Box<dyn std::error::Error>) -> CollectionError {
    CollectionError::Database(e.to_string())
}

/// Fetches one page of search results for the marker and creates one photo
/// record plus one download per result.
///
/// A failed search leaves the pagination counter untouched. An empty page
/// resets it to 1 and creates nothing. A non-empty page advances it by 1, so
/// the next collection naturally requests a different page.
pub fn fetch_collection(
    pool: &DbPool,
    search: &dyn SearchProvider,
    downloader: &Downloader,
    marker_id: i64,
) -> Result<Vec<Photo>, CollectionError> {
    let marker = Marker::find_by_id(pool, marker_id)
        .map_err(db_err)?
        .ok_or(CollectionError::UnknownMarker(marker_id))?;

    let descriptors =
        search.search_photos_by_location(marker.latitude, marker.longitude, marker.next_page)?;

    if descriptors.is_empty() {
        Marker::reset_next_page(pool, marker_id).map_err(db_err)?;
        return Err(CollectionError::EmptyPage);
    }

    Marker::advance_next_page(pool, marker_id).map_err(db_err)?;

    let mut photos = Vec::with_capacity(descriptors.len());
    for info in &descriptors {
        let photo = Photo::create(pool, marker_id, info).map_err(db_err)?;
        downloader.spawn(&photo);
        photos.push(photo);
    }

    info!(
        "Created {} photo records for marker {} (page {})",
        photos.len(),
        marker_id,
        marker.next_page
    );
    Ok(photos)
}

/// The "new collection" action: drops the current records and fetches a
/// fresh page.
///
/// An empty page has just reset the counter, so a single retry starts over
/// from page 1. A second failure of any kind is handed back to the caller,
/// which leaves the action user-retryable. Marker creation deliberately does
/// not retry; only this path does.
pub fn refresh_collection(
    pool: &DbPool,
    search: &dyn SearchProvider,
    downloader: &Downloader,
    media: &MediaStore,
    marker_id: i64,
) -> Result<Vec<Photo>, CollectionError> {
    clear_collection(pool, downloader, media, marker_id)?;

    match fetch_collection(pool, search, downloader, marker_id) {
        Err(CollectionError::EmptyPage) => {
            warn!(
                "Marker {} had an empty result page, retrying from page 1",
                marker_id
            );
            fetch_collection(pool, search, downloader, marker_id)
        }
        other => other,
    }
}

/// True when every photo record of the marker has its backing file on disk.
/// Recomputed on demand; collections hold at most one page of records.
pub fn all_downloaded(
    pool: &DbPool,
    media: &MediaStore,
    marker_id: i64,
) -> Result<bool, CollectionError> {
    let photos = Photo::for_marker(pool, marker_id).map_err(db_err)?;
    Ok(photos.iter().all(|p| media.exists(&p.file_name)))
}

/// Removes one photo record together with its backing file. Returns whether
/// the record existed.
pub fn delete_photo(
    pool: &DbPool,
    downloader: &Downloader,
    media: &MediaStore,
    photo_id: i64,
) -> Result<bool, CollectionError> {
    match Photo::find_by_id(pool, photo_id).map_err(db_err)? {
        Some(photo) => {
            downloader.cancel(photo.id);
            media.remove(&photo.file_name);
            Photo::delete_row(pool, photo.id).map_err(db_err)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Deletes a marker and everything it owns: in-flight downloads are
/// cancelled, each backing file removed, then the rows. Ownership is walked
/// explicitly rather than left to the schema, so no orphaned files can
/// survive. Returns whether the marker existed.
pub fn delete_marker(
    pool: &DbPool,
    downloader: &Downloader,
    media: &MediaStore,
    marker_id: i64,
) -> Result<bool, CollectionError> {
    if Marker::find_by_id(pool, marker_id).map_err(db_err)?.is_none() {
        return Ok(false);
    }

    clear_collection(pool, downloader, media, marker_id)?;
    Marker::delete_row(pool, marker_id).map_err(db_err)?;
    Ok(true)
}

/// Deletes every photo record of the marker together with its backing file.
fn clear_collection(
    pool: &DbPool,
    downloader: &Downloader,
    media: &MediaStore,
    marker_id: i64,
) -> Result<(), CollectionError> {
    let photos = Photo::for_marker(pool, marker_id).map_err(db_err)?;
    for photo in &photos {
        downloader.cancel(photo.id);
        media.remove(&photo.file_name);
        Photo::delete_row(pool, photo.id).map_err(db_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_pool::create_in_memory_pool;
    use crate::flickr_client::{PathInfo, PhotoFetcher};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Returns one scripted page per call, in order; repeats the last page
    /// when the script runs out.
    struct ScriptedSearch {
        pages: Mutex<Vec<Result<Vec<PathInfo>, ()>>>,
        calls: AtomicUsize,
        last_page_requested: Mutex<Vec<u32>>,
    }

    impl ScriptedSearch {
        fn new(pages: Vec<Result<Vec<PathInfo>, ()>>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages),
                calls: AtomicUsize::new(0),
                last_page_requested: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn requested_pages(&self) -> Vec<u32> {
            self.last_page_requested.lock().unwrap().clone()
        }
    }

    impl SearchProvider for ScriptedSearch {
        fn search_photos_by_location(
            &self,
            _latitude: f64,
            _longitude: f64,
            page: u32,
        ) -> Result<Vec<PathInfo>, FlickrError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_page_requested.lock().unwrap().push(page);

            let pages = self.pages.lock().unwrap();
            let outcome = pages.get(call).or_else(|| pages.last()).cloned().unwrap();
            outcome.map_err(|_| FlickrError::Network("connection reset".to_string()))
        }
    }

    struct NullFetcher;

    impl PhotoFetcher for NullFetcher {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, FlickrError> {
            Ok(b"bytes".to_vec())
        }
    }

    fn descriptors(count: usize) -> Vec<PathInfo> {
        descriptors_named("photo", count)
    }

    fn descriptors_named(prefix: &str, count: usize) -> Vec<PathInfo> {
        (0..count)
            .map(|i| PathInfo {
                farm: 1,
                server: "2".to_string(),
                id: format!("{}-{}", prefix, i),
                secret: "s".to_string(),
            })
            .collect()
    }

    struct TestEnv {
        pool: DbPool,
        media: MediaStore,
        downloader: Downloader,
        _temp_dir: TempDir,
    }

    fn test_env() -> TestEnv {
        let temp_dir = TempDir::new().unwrap();
        let pool = create_in_memory_pool().unwrap();
        let media = MediaStore::new(temp_dir.path().join("media")).unwrap();
        let (downloader, _consumer) = Downloader::start(media.clone(), Arc::new(NullFetcher));
        TestEnv {
            pool,
            media,
            downloader,
            _temp_dir: temp_dir,
        }
    }

    async fn wait_until_idle(downloader: &Downloader) {
        for _ in 0..100 {
            if downloader.idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("downloads did not finish");
    }

    #[tokio::test]
    async fn test_non_empty_page_creates_records_and_advances_counter() {
        let env = test_env();
        let marker = Marker::create(&env.pool, 40.7, -74.0).unwrap();
        let search = ScriptedSearch::new(vec![Ok(descriptors(5))]);

        let photos =
            fetch_collection(&env.pool, search.as_ref(), &env.downloader, marker.id).unwrap();

        assert_eq!(photos.len(), 5);
        assert_eq!(search.requested_pages(), vec![1]);
        let marker = Marker::find_by_id(&env.pool, marker.id).unwrap().unwrap();
        assert_eq!(marker.next_page, 2);
        assert_eq!(Photo::for_marker(&env.pool, marker.id).unwrap().len(), 5);

        wait_until_idle(&env.downloader).await;
        assert!(all_downloaded(&env.pool, &env.media, marker.id).unwrap());
    }

    #[tokio::test]
    async fn test_empty_page_resets_counter_and_creates_nothing() {
        let env = test_env();
        let marker = Marker::create(&env.pool, 0.0, 0.0).unwrap();
        // simulate an earlier history that left the marker on page 3
        Marker::advance_next_page(&env.pool, marker.id).unwrap();
        Marker::advance_next_page(&env.pool, marker.id).unwrap();

        let search = ScriptedSearch::new(vec![Ok(vec![])]);
        let result = fetch_collection(&env.pool, search.as_ref(), &env.downloader, marker.id);

        assert!(matches!(result, Err(CollectionError::EmptyPage)));
        assert_eq!(search.requested_pages(), vec![3]);
        let marker = Marker::find_by_id(&env.pool, marker.id).unwrap().unwrap();
        assert_eq!(marker.next_page, 1);
        assert!(Photo::for_marker(&env.pool, marker.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_search_leaves_counter_unchanged() {
        let env = test_env();
        let marker = Marker::create(&env.pool, 0.0, 0.0).unwrap();
        Marker::advance_next_page(&env.pool, marker.id).unwrap();

        let search = ScriptedSearch::new(vec![Err(())]);
        let result = fetch_collection(&env.pool, search.as_ref(), &env.downloader, marker.id);

        assert!(matches!(result, Err(CollectionError::Search(_))));
        let marker = Marker::find_by_id(&env.pool, marker.id).unwrap().unwrap();
        assert_eq!(marker.next_page, 2);
    }

    #[tokio::test]
    async fn test_fetch_collection_unknown_marker() {
        let env = test_env();
        let search = ScriptedSearch::new(vec![Ok(descriptors(1))]);

        let result = fetch_collection(&env.pool, search.as_ref(), &env.downloader, 404);
        assert!(matches!(result, Err(CollectionError::UnknownMarker(404))));
        assert_eq!(search.call_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_replaces_collection() {
        let env = test_env();
        let marker = Marker::create(&env.pool, 0.0, 0.0).unwrap();

        let search =
            ScriptedSearch::new(vec![Ok(descriptors(3)), Ok(descriptors_named("fresh", 2))]);
        fetch_collection(&env.pool, search.as_ref(), &env.downloader, marker.id).unwrap();
        wait_until_idle(&env.downloader).await;
        let first = Photo::for_marker(&env.pool, marker.id).unwrap();
        assert_eq!(first.len(), 3);

        let photos = refresh_collection(
            &env.pool,
            search.as_ref(),
            &env.downloader,
            &env.media,
            marker.id,
        )
        .unwrap();

        assert_eq!(photos.len(), 2);
        assert_eq!(search.requested_pages(), vec![1, 2]);
        // the old records and their files are gone
        for photo in &first {
            assert!(Photo::find_by_id(&env.pool, photo.id).unwrap().is_none());
            assert!(!env.media.exists(&photo.file_name));
        }
        assert_eq!(Photo::for_marker(&env.pool, marker.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_retries_empty_page_once_from_page_one() {
        let env = test_env();
        let marker = Marker::create(&env.pool, 0.0, 0.0).unwrap();
        // marker sits on page 3
        Marker::advance_next_page(&env.pool, marker.id).unwrap();
        Marker::advance_next_page(&env.pool, marker.id).unwrap();

        let search = ScriptedSearch::new(vec![Ok(vec![]), Ok(descriptors(4))]);
        let photos = refresh_collection(
            &env.pool,
            search.as_ref(),
            &env.downloader,
            &env.media,
            marker.id,
        )
        .unwrap();

        assert_eq!(photos.len(), 4);
        // first attempt on page 3, retry restarted from page 1
        assert_eq!(search.requested_pages(), vec![3, 1]);
        let marker = Marker::find_by_id(&env.pool, marker.id).unwrap().unwrap();
        assert_eq!(marker.next_page, 2);
    }

    #[tokio::test]
    async fn test_refresh_gives_up_after_second_empty_page() {
        let env = test_env();
        let marker = Marker::create(&env.pool, 0.0, 0.0).unwrap();

        let search = ScriptedSearch::new(vec![Ok(vec![]), Ok(vec![])]);
        let result = refresh_collection(
            &env.pool,
            search.as_ref(),
            &env.downloader,
            &env.media,
            marker.id,
        );

        assert!(matches!(result, Err(CollectionError::EmptyPage)));
        assert_eq!(search.call_count(), 2);
        assert!(Photo::for_marker(&env.pool, marker.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_does_not_retry_search_failure() {
        let env = test_env();
        let marker = Marker::create(&env.pool, 0.0, 0.0).unwrap();

        let search = ScriptedSearch::new(vec![Err(())]);
        let result = refresh_collection(
            &env.pool,
            search.as_ref(),
            &env.downloader,
            &env.media,
            marker.id,
        );

        assert!(matches!(result, Err(CollectionError::Search(_))));
        assert_eq!(search.call_count(), 1);
    }

    #[tokio::test]
    async fn test_all_downloaded_tracks_file_existence() {
        let env = test_env();
        let marker = Marker::create(&env.pool, 0.0, 0.0).unwrap();
        let a = Photo::create(&env.pool, marker.id, &descriptors(2)[0]).unwrap();
        let b = Photo::create(&env.pool, marker.id, &descriptors(2)[1]).unwrap();

        assert!(!all_downloaded(&env.pool, &env.media, marker.id).unwrap());

        env.media.write_atomic(&a.file_name, b"a").unwrap();
        assert!(!all_downloaded(&env.pool, &env.media, marker.id).unwrap());

        env.media.write_atomic(&b.file_name, b"b").unwrap();
        assert!(all_downloaded(&env.pool, &env.media, marker.id).unwrap());
    }

    #[tokio::test]
    async fn test_delete_marker_removes_records_and_files() {
        let env = test_env();
        let marker = Marker::create(&env.pool, 0.0, 0.0).unwrap();
        let search = ScriptedSearch::new(vec![Ok(descriptors(3))]);
        let photos =
            fetch_collection(&env.pool, search.as_ref(), &env.downloader, marker.id).unwrap();
        wait_until_idle(&env.downloader).await;

        assert!(delete_marker(&env.pool, &env.downloader, &env.media, marker.id).unwrap());

        assert!(Marker::find_by_id(&env.pool, marker.id).unwrap().is_none());
        for photo in &photos {
            assert!(Photo::find_by_id(&env.pool, photo.id).unwrap().is_none());
            assert!(!env.media.exists(&photo.file_name));
        }

        // deleting again reports the marker as gone
        assert!(!delete_marker(&env.pool, &env.downloader, &env.media, marker.id).unwrap());
    }

    #[tokio::test]
    async fn test_delete_single_photo() {
        let env = test_env();
        let marker = Marker::create(&env.pool, 0.0, 0.0).unwrap();
        let photo = Photo::create(&env.pool, marker.id, &descriptors(1)[0]).unwrap();
        env.media.write_atomic(&photo.file_name, b"x").unwrap();

        assert!(delete_photo(&env.pool, &env.downloader, &env.media, photo.id).unwrap());
        assert!(!env.media.exists(&photo.file_name));
        assert!(Photo::find_by_id(&env.pool, photo.id).unwrap().is_none());

        assert!(!delete_photo(&env.pool, &env.downloader, &env.media, photo.id).unwrap());
    }
}
