use rusqlite::{Connection, Result as SqlResult};

// Schema definitions
pub const MARKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS markers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    next_page INTEGER NOT NULL DEFAULT 1 CHECK(next_page >= 1),
    created_at DATETIME NOT NULL
)
"#;

// One row per image record. The four path fields rebuild the remote URL;
// file_name is derived from remote_id and addresses the shared media store.
pub const PHOTOS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    marker_id INTEGER NOT NULL,
    file_name TEXT NOT NULL,
    farm INTEGER NOT NULL,
    server TEXT NOT NULL,
    remote_id TEXT NOT NULL,
    secret TEXT NOT NULL,
    created_at DATETIME NOT NULL,
    FOREIGN KEY (marker_id) REFERENCES markers(id) ON DELETE CASCADE
)
"#;

// Single-row table holding the last map viewport, restored on next launch.
pub const MAP_STATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS map_state (
    id INTEGER PRIMARY KEY CHECK(id = 1),
    center_latitude REAL NOT NULL,
    center_longitude REAL NOT NULL,
    latitude_span REAL NOT NULL,
    longitude_span REAL NOT NULL,
    updated_at DATETIME NOT NULL
)
"#;

pub const SCHEMA_SQL: &[&str] = &[
    MARKERS_TABLE,
    PHOTOS_TABLE,
    "CREATE INDEX IF NOT EXISTS idx_photos_marker_id ON photos(marker_id);",
    MAP_STATE_TABLE,
];

pub fn initialize_schema(conn: &Connection) -> SqlResult<()> {
    for sql in SCHEMA_SQL {
        conn.execute(sql, [])?;
    }
    Ok(())
}
