pub mod config;
pub mod db;
pub mod db_pool;
pub mod db_schema;
pub mod downloader;
pub mod flickr_client;
pub mod gallery;
pub mod media_store;
pub mod warp_handlers;
pub mod warp_helpers;
