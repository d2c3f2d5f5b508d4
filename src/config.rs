use std::env;

/// Settings for the Flickr API, injected into the search client at startup.
#[derive(Debug, Clone)]
pub struct FlickrConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub db_path: String,
    pub media_path: String,
    pub flickr: FlickrConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Config {
            port: env::var("GEO_PIX_PORT")
                .unwrap_or_else(|_| "18474".to_string())
                .parse()?,
            host: env::var("GEO_PIX_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            db_path: env::var("GEO_PIX_DB_PATH")
                .unwrap_or_else(|_| "./data/database/geo-pix.db".to_string()),
            media_path: env::var("GEO_PIX_MEDIA_PATH")
                .unwrap_or_else(|_| "./data/media".to_string()),
            flickr: FlickrConfig {
                api_key: env::var("GEO_PIX_FLICKR_API_KEY")
                    .unwrap_or_else(|_| "751eec8def22fb19810bc86348b765d9".to_string()),
                base_url: env::var("GEO_PIX_FLICKR_BASE_URL")
                    .unwrap_or_else(|_| "https://api.flickr.com/services/rest/".to_string()),
            },
        })
    }
}
