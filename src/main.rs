use log::{error, info};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use warp::Filter;

use geo_pix::config::Config;
use geo_pix::db_pool::{create_db_pool, DbPool};
use geo_pix::downloader::Downloader;
use geo_pix::flickr_client::{FlickrClient, PhotoFetcher, SearchProvider};
use geo_pix::media_store::MediaStore;
use geo_pix::warp_handlers;
use geo_pix::warp_helpers::{
    cors, handle_rejection, with_db, with_downloader, with_media, with_search,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from_env()?;
    let port = config.port;

    info!("Starting geo-pix server on port {}", port);
    info!("Database: {}", config.db_path);
    info!("Media path: {}", config.media_path);
    info!("Flickr endpoint: {}", config.flickr.base_url);

    // Check if port is available BEFORE initializing services
    if !is_port_available(port) {
        error!(
            "Port {} is already in use. Please stop any existing geo-pix instances or use a different port.",
            port
        );
        return Err(format!("Port {} is already in use", port).into());
    }

    let (db_pool, media, downloader, search) = initialize_services(&config)?;

    let health_routes = build_health_routes(db_pool.clone());
    let marker_routes = build_marker_routes(
        db_pool.clone(),
        search,
        downloader.clone(),
        media.clone(),
    );
    let photo_routes = build_photo_routes(db_pool.clone(), downloader, media);
    let map_routes = build_map_routes(db_pool);

    let routes = health_routes
        .or(marker_routes)
        .or(photo_routes)
        .or(map_routes)
        .with(cors())
        .with(warp::log("geo_pix"))
        .recover(handle_rejection);

    info!(
        "Server started successfully, listening on http://localhost:{}",
        port
    );

    warp::serve(routes).run(([0, 0, 0, 0], port)).await;

    Ok(())
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

type InitServicesResult = (DbPool, MediaStore, Downloader, Arc<dyn SearchProvider>);

fn initialize_services(config: &Config) -> Result<InitServicesResult, Box<dyn std::error::Error>> {
    let db_pool = create_db_pool(&config.db_path)?;
    info!("Database initialized successfully");

    let media = MediaStore::new(PathBuf::from(&config.media_path))?;
    info!("Media store initialized");

    let client = Arc::new(FlickrClient::new(config.flickr.clone()));
    let search: Arc<dyn SearchProvider> = client.clone();
    let fetcher: Arc<dyn PhotoFetcher> = client;

    let (downloader, _outcome_consumer) = Downloader::start(media.clone(), fetcher);
    info!("Download worker started");

    Ok((db_pool, media, downloader, search))
}

fn build_health_routes(
    db_pool: DbPool,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::get())
        .and_then(warp_handlers::health_check);

    let ready = warp::path("ready")
        .and(warp::get())
        .and(with_db(db_pool))
        .and_then(warp_handlers::ready_check);

    health.or(ready)
}

fn build_marker_routes(
    db_pool: DbPool,
    search: Arc<dyn SearchProvider>,
    downloader: Downloader,
    media: MediaStore,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let api_marker_create = warp::path("api")
        .and(warp::path("markers"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json::<warp_handlers::CreateMarkerRequest>())
        .and(with_db(db_pool.clone()))
        .and(with_search(search.clone()))
        .and(with_downloader(downloader.clone()))
        .and_then(warp_handlers::create_marker);

    let api_markers_list = warp::path("api")
        .and(warp::path("markers"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_db(db_pool.clone()))
        .and_then(warp_handlers::list_markers);

    let api_marker_delete = warp::path("api")
        .and(warp::path("markers"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_db(db_pool.clone()))
        .and(with_downloader(downloader.clone()))
        .and(with_media(media.clone()))
        .and_then(warp_handlers::delete_marker);

    let api_marker_gallery = warp::path("api")
        .and(warp::path("markers"))
        .and(warp::path::param::<i64>())
        .and(warp::path("photos"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_db(db_pool.clone()))
        .and(with_downloader(downloader.clone()))
        .and(with_media(media.clone()))
        .and_then(warp_handlers::get_gallery);

    let api_marker_refresh = warp::path("api")
        .and(warp::path("markers"))
        .and(warp::path::param::<i64>())
        .and(warp::path("refresh"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_db(db_pool))
        .and(with_search(search))
        .and(with_downloader(downloader))
        .and(with_media(media))
        .and_then(warp_handlers::refresh_gallery);

    api_marker_create
        .or(api_markers_list)
        .or(api_marker_delete)
        .or(api_marker_gallery)
        .or(api_marker_refresh)
}

fn build_photo_routes(
    db_pool: DbPool,
    downloader: Downloader,
    media: MediaStore,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let api_photo_file = warp::path("api")
        .and(warp::path("photos"))
        .and(warp::path::param::<i64>())
        .and(warp::path("file"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_db(db_pool.clone()))
        .and(with_downloader(downloader.clone()))
        .and(with_media(media.clone()))
        .and_then(warp_handlers::get_photo_file);

    let api_photo_delete = warp::path("api")
        .and(warp::path("photos"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_db(db_pool))
        .and(with_downloader(downloader))
        .and(with_media(media))
        .and_then(warp_handlers::delete_photo);

    api_photo_file.or(api_photo_delete)
}

fn build_map_routes(
    db_pool: DbPool,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let api_map_get = warp::path("api")
        .and(warp::path("map"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_db(db_pool.clone()))
        .and_then(warp_handlers::get_map_state);

    let api_map_put = warp::path("api")
        .and(warp::path("map"))
        .and(warp::path::end())
        .and(warp::put())
        .and(warp::body::json::<geo_pix::db::MapViewport>())
        .and(with_db(db_pool))
        .and_then(warp_handlers::put_map_state);

    api_map_get.or(api_map_put)
}
