use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db::Photo;
use crate::flickr_client::{FlickrError, PhotoFetcher};
use crate::media_store::MediaStore;

/// Result of one background fetch, handed back to the foreground consumer.
struct DownloadOutcome {
    photo_id: i64,
    file_name: String,
    result: Result<Vec<u8>, FlickrError>,
    cancelled: Arc<AtomicBool>,
}

type InFlightRegistry = Arc<Mutex<HashMap<i64, Arc<AtomicBool>>>>;

/// Fetches photo payloads in background tasks and applies the results on a
/// single consumer task.
///
/// Background tasks only produce raw bytes; every file write and registry
/// update happens on the consumer, so downloads of one page may complete in
/// any order without coordination. The in-flight registry doubles as the
/// transient "is downloading" flag for gallery state.
#[derive(Clone)]
pub struct Downloader {
    media: MediaStore,
    fetcher: Arc<dyn PhotoFetcher>,
    in_flight: InFlightRegistry,
    outcomes: mpsc::UnboundedSender<DownloadOutcome>,
}

impl Downloader {
    /// Creates the downloader and spawns its outcome consumer.
    pub fn start(media: MediaStore, fetcher: Arc<dyn PhotoFetcher>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight: InFlightRegistry = Arc::new(Mutex::new(HashMap::new()));

        let consumer = tokio::spawn(consume_outcomes(rx, media.clone(), in_flight.clone()));

        let downloader = Self {
            media,
            fetcher,
            in_flight,
            outcomes: tx,
        };
        (downloader, consumer)
    }

    /// Starts a download for one record unless its backing file already
    /// exists or a download for it is already in flight. Returns whether a
    /// task was started.
    pub fn spawn(&self, photo: &Photo) -> bool {
        if self.media.exists(&photo.file_name) {
            return false;
        }

        let cancelled = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if in_flight.contains_key(&photo.id) {
                return false;
            }
            let flag = Arc::new(AtomicBool::new(false));
            in_flight.insert(photo.id, flag.clone());
            flag
        };

        let url = photo.path_info.photo_url();
        let photo_id = photo.id;
        let file_name = photo.file_name.clone();
        let fetcher = self.fetcher.clone();
        let outcomes = self.outcomes.clone();

        tokio::spawn(async move {
            debug!("Downloading photo {} from {}", photo_id, url);
            let result = tokio::task::spawn_blocking(move || fetcher.fetch(&url))
                .await
                .unwrap_or_else(|e| Err(FlickrError::Network(e.to_string())));

            // The consumer only goes away on shutdown; a failed send means
            // there is nothing left to apply the outcome to.
            let _ = outcomes.send(DownloadOutcome {
                photo_id,
                file_name,
                result,
                cancelled,
            });
        });

        true
    }

    pub fn is_downloading(&self, photo_id: i64) -> bool {
        self.in_flight.lock().unwrap().contains_key(&photo_id)
    }

    pub fn idle(&self) -> bool {
        self.in_flight.lock().unwrap().is_empty()
    }

    /// Cancels an in-flight download. The fetch itself is not interrupted;
    /// its outcome is discarded without writing a file. Records with no
    /// download in flight are ignored.
    pub fn cancel(&self, photo_id: i64) {
        if let Some(flag) = self.in_flight.lock().unwrap().remove(&photo_id) {
            flag.store(true, Ordering::SeqCst);
            debug!("Cancelled download for photo {}", photo_id);
        }
    }
}

async fn consume_outcomes(
    mut rx: mpsc::UnboundedReceiver<DownloadOutcome>,
    media: MediaStore,
    in_flight: InFlightRegistry,
) {
    while let Some(outcome) = rx.recv().await {
        if outcome.cancelled.load(Ordering::SeqCst) {
            // A cancelled download leaves no file and does not touch the
            // registry; the cancel path already removed its entry.
            debug!("Discarding cancelled download of {}", outcome.file_name);
            continue;
        }

        match outcome.result {
            Ok(bytes) => {
                if let Err(e) = media.write_atomic(&outcome.file_name, &bytes) {
                    warn!("Failed to store {}: {}", outcome.file_name, e);
                }
            }
            Err(e) => {
                // The record stays without a file; rendering its gallery
                // again re-attempts the download.
                warn!("Download of {} failed: {}", outcome.file_name, e);
            }
        }

        in_flight.lock().unwrap().remove(&outcome.photo_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flickr_client::PathInfo;
    use chrono::Utc;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_photo(id: i64) -> Photo {
        Photo {
            id,
            marker_id: 1,
            file_name: format!("{}.jpg", id),
            path_info: PathInfo {
                farm: 1,
                server: "2".to_string(),
                id: id.to_string(),
                secret: "s".to_string(),
            },
            created_at: Utc::now(),
        }
    }

    fn test_media() -> (MediaStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let media = MediaStore::new(temp_dir.path().join("media")).unwrap();
        (media, temp_dir)
    }

    struct StaticFetcher {
        result: Result<Vec<u8>, ()>,
    }

    impl PhotoFetcher for StaticFetcher {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, FlickrError> {
            self.result
                .clone()
                .map_err(|_| FlickrError::Network("connection refused".to_string()))
        }
    }

    /// Blocks each fetch until the test releases it, so cancellation can be
    /// issued while the download is reliably still in flight.
    struct GatedFetcher {
        gate: Mutex<std_mpsc::Receiver<()>>,
    }

    impl GatedFetcher {
        fn new() -> (Arc<Self>, std_mpsc::Sender<()>) {
            let (tx, rx) = std_mpsc::channel();
            (
                Arc::new(Self {
                    gate: Mutex::new(rx),
                }),
                tx,
            )
        }
    }

    impl PhotoFetcher for GatedFetcher {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, FlickrError> {
            self.gate.lock().unwrap().recv().ok();
            Ok(b"gated bytes".to_vec())
        }
    }

    async fn wait_until_idle(downloader: &Downloader) {
        for _ in 0..100 {
            if downloader.idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("downloader did not become idle");
    }

    #[tokio::test]
    async fn test_successful_download_writes_file() {
        let (media, _temp_dir) = test_media();
        let fetcher = Arc::new(StaticFetcher {
            result: Ok(b"image data".to_vec()),
        });
        let (downloader, _consumer) = Downloader::start(media.clone(), fetcher);

        let photo = test_photo(1);
        assert!(downloader.spawn(&photo));

        wait_until_idle(&downloader).await;
        assert_eq!(media.read("1.jpg").unwrap(), b"image data");
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() {
        let (media, _temp_dir) = test_media();
        let fetcher = Arc::new(StaticFetcher { result: Err(()) });
        let (downloader, _consumer) = Downloader::start(media.clone(), fetcher);

        let photo = test_photo(2);
        assert!(downloader.spawn(&photo));

        wait_until_idle(&downloader).await;
        assert!(!media.exists("2.jpg"));
        // a later spawn re-attempts the same record
        assert!(downloader.spawn(&photo));
        wait_until_idle(&downloader).await;
    }

    #[tokio::test]
    async fn test_spawn_skips_existing_file_and_in_flight() {
        let (media, _temp_dir) = test_media();
        media.write_atomic("3.jpg", b"already here").unwrap();

        let (fetcher, release) = GatedFetcher::new();
        let (downloader, _consumer) = Downloader::start(media.clone(), fetcher);

        // file already present
        assert!(!downloader.spawn(&test_photo(3)));

        // second spawn while the first is still in flight
        let photo = test_photo(4);
        assert!(downloader.spawn(&photo));
        assert!(downloader.is_downloading(photo.id));
        assert!(!downloader.spawn(&photo));

        release.send(()).unwrap();
        wait_until_idle(&downloader).await;
        assert_eq!(media.read("4.jpg").unwrap(), b"gated bytes");
    }

    #[tokio::test]
    async fn test_cancelled_download_writes_nothing() {
        let (media, _temp_dir) = test_media();
        let (fetcher, release) = GatedFetcher::new();
        let (downloader, consumer) = Downloader::start(media.clone(), fetcher);

        let photo = test_photo(5);
        assert!(downloader.spawn(&photo));
        assert!(downloader.is_downloading(photo.id));

        // cancel clears the flag immediately, not via the completion path
        downloader.cancel(photo.id);
        assert!(!downloader.is_downloading(photo.id));

        // let the fetch finish and the consumer observe the cancellation
        release.send(()).unwrap();
        drop(downloader);
        consumer.await.unwrap();

        assert!(!media.exists("5.jpg"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_record_is_ignored() {
        let (media, _temp_dir) = test_media();
        let fetcher = Arc::new(StaticFetcher {
            result: Ok(vec![]),
        });
        let (downloader, _consumer) = Downloader::start(media, fetcher);

        downloader.cancel(999);
        assert!(!downloader.is_downloading(999));
    }
}
