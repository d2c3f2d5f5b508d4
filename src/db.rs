use chrono::{DateTime, Utc};
use rusqlite::{params, Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

pub use crate::db_pool::{create_db_pool, DbPool};
use crate::flickr_client::PathInfo;

/// A user-placed geographic point of interest.
///
/// Latitude and longitude are immutable after creation. `next_page` is the
/// pagination counter for photo searches; it is only ever mutated through
/// [`Marker::advance_next_page`] and [`Marker::reset_next_page`], which the
/// acquisition workflow alone calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub next_page: u32,
    pub created_at: DateTime<Utc>,
}

impl Marker {
    pub fn from_row(row: &Row) -> SqlResult<Self> {
        Ok(Marker {
            id: row.get(0)?,
            latitude: row.get(1)?,
            longitude: row.get(2)?,
            next_page: row.get(3)?,
            created_at: parse_datetime(row, 4)?,
        })
    }

    pub fn create(
        pool: &DbPool,
        latitude: f64,
        longitude: f64,
    ) -> Result<Marker, Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO markers (latitude, longitude, next_page, created_at) VALUES (?1, ?2, 1, ?3)",
            params![latitude, longitude, created_at.to_rfc3339()],
        )?;

        Ok(Marker {
            id: conn.last_insert_rowid(),
            latitude,
            longitude,
            next_page: 1,
            created_at,
        })
    }

    pub fn find_by_id(
        pool: &DbPool,
        marker_id: i64,
    ) -> Result<Option<Marker>, Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM markers WHERE id = ?")?;

        match stmt.query_row([marker_id], Marker::from_row) {
            Ok(marker) => Ok(Some(marker)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    pub fn list_all(pool: &DbPool) -> Result<Vec<Marker>, Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM markers ORDER BY id")?;
        let marker_iter = stmt.query_map([], Marker::from_row)?;

        let mut markers = Vec::new();
        for marker in marker_iter {
            markers.push(marker?);
        }
        Ok(markers)
    }

    /// Advances the pagination counter after a non-empty page fetch.
    pub fn advance_next_page(
        pool: &DbPool,
        marker_id: i64,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        conn.execute(
            "UPDATE markers SET next_page = next_page + 1 WHERE id = ?",
            [marker_id],
        )?;
        Ok(())
    }

    /// Resets the pagination counter after an empty page fetch, so the next
    /// attempt starts over from the first page.
    pub fn reset_next_page(
        pool: &DbPool,
        marker_id: i64,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        conn.execute("UPDATE markers SET next_page = 1 WHERE id = ?", [marker_id])?;
        Ok(())
    }

    /// Deletes the marker row only. Callers delete the owned photo records
    /// and their files first (see `gallery::delete_marker`).
    pub fn delete_row(pool: &DbPool, marker_id: i64) -> Result<(), Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        conn.execute("DELETE FROM markers WHERE id = ?", [marker_id])?;
        Ok(())
    }
}

/// The metadata entity for one downloadable photo.
///
/// `file_name` is derived from the remote identifier, so existence of the
/// backing file can be checked without reading any other record state. The
/// "is downloading" flag is transient and lives in the downloader's in-flight
/// registry, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Photo {
    pub id: i64,
    pub marker_id: i64,
    pub file_name: String,
    pub path_info: PathInfo,
    pub created_at: DateTime<Utc>,
}

impl Photo {
    pub fn from_row(row: &Row) -> SqlResult<Self> {
        Ok(Photo {
            id: row.get(0)?,
            marker_id: row.get(1)?,
            file_name: row.get(2)?,
            path_info: PathInfo {
                farm: row.get::<_, i64>(3)? as u64,
                server: row.get(4)?,
                id: row.get(5)?,
                secret: row.get(6)?,
            },
            created_at: parse_datetime(row, 7)?,
        })
    }

    pub fn create(
        pool: &DbPool,
        marker_id: i64,
        info: &PathInfo,
    ) -> Result<Photo, Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        let file_name = info.file_name();
        let created_at = Utc::now();
        conn.execute(
            r#"
            INSERT INTO photos (marker_id, file_name, farm, server, remote_id, secret, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                marker_id,
                file_name,
                info.farm as i64,
                info.server,
                info.id,
                info.secret,
                created_at.to_rfc3339(),
            ],
        )?;

        Ok(Photo {
            id: conn.last_insert_rowid(),
            marker_id,
            file_name,
            path_info: info.clone(),
            created_at,
        })
    }

    pub fn find_by_id(
        pool: &DbPool,
        photo_id: i64,
    ) -> Result<Option<Photo>, Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM photos WHERE id = ?")?;

        match stmt.query_row([photo_id], Photo::from_row) {
            Ok(photo) => Ok(Some(photo)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// All photo records owned by the marker. Order is irrelevant to callers;
    /// id order keeps gallery listings stable.
    pub fn for_marker(
        pool: &DbPool,
        marker_id: i64,
    ) -> Result<Vec<Photo>, Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM photos WHERE marker_id = ? ORDER BY id")?;
        let photo_iter = stmt.query_map([marker_id], Photo::from_row)?;

        let mut photos = Vec::new();
        for photo in photo_iter {
            photos.push(photo?);
        }
        Ok(photos)
    }

    pub fn delete_row(pool: &DbPool, photo_id: i64) -> Result<(), Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        conn.execute("DELETE FROM photos WHERE id = ?", [photo_id])?;
        Ok(())
    }
}

/// Last map center and zoom span, restored by the client on next launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapViewport {
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub latitude_span: f64,
    pub longitude_span: f64,
}

impl MapViewport {
    pub fn load(pool: &DbPool) -> Result<Option<MapViewport>, Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT center_latitude, center_longitude, latitude_span, longitude_span
             FROM map_state WHERE id = 1",
        )?;

        match stmt.query_row([], |row| {
            Ok(MapViewport {
                center_latitude: row.get(0)?,
                center_longitude: row.get(1)?,
                latitude_span: row.get(2)?,
                longitude_span: row.get(3)?,
            })
        }) {
            Ok(viewport) => Ok(Some(viewport)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    pub fn save(&self, pool: &DbPool) -> Result<(), Box<dyn std::error::Error>> {
        let conn = pool.get()?;
        conn.execute(
            r#"
            INSERT INTO map_state (id, center_latitude, center_longitude, latitude_span, longitude_span, updated_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                center_latitude = excluded.center_latitude,
                center_longitude = excluded.center_longitude,
                latitude_span = excluded.latitude_span,
                longitude_span = excluded.longitude_span,
                updated_at = excluded.updated_at
            "#,
            params![
                self.center_latitude,
                self.center_longitude,
                self.latitude_span,
                self.longitude_span,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn parse_datetime(row: &Row, idx: usize) -> SqlResult<DateTime<Utc>> {
    let datetime_str = row.get::<_, String>(idx)?;
    DateTime::parse_from_rfc3339(&datetime_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                idx,
                "created_at".to_string(),
                rusqlite::types::Type::Text,
            )
        })
}
