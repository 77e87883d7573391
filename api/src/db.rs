use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// SQLite database of uploaded photos: `{db_dir}/photo_booth.db`.
///
/// WAL mode so readers don't block the upload handler.
pub struct PhotoDb {
    conn: Mutex<Connection>,
}

impl PhotoDb {
    /// Open (or create) the database. Creates `db_dir` if it does not exist.
    pub fn open(db_dir: &Path) -> SqlResult<Self> {
        std::fs::create_dir_all(db_dir)
            .map_err(|_e| rusqlite::Error::InvalidPath(db_dir.into()))?;

        let db_path = db_dir.join("photo_booth.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let db = Self::init(conn)?;

        info!(path = db_path.display().to_string(), "SQLite database opened");
        Ok(db)
    }

    pub fn open_in_memory() -> SqlResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS photos (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                email       TEXT,
                link        TEXT    NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_photos_created
                ON photos(created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a new photo link. Returns the new row id.
    pub fn insert_photo(&self, link: &str, now_ms: i64) -> SqlResult<i64> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO photos (link, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![link, now_ms],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, link, "inserted photo");
        Ok(id)
    }

    pub fn count(&self) -> SqlResult<i64> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))
    }

    #[cfg(test)]
    fn rows(&self) -> SqlResult<Vec<(String, Option<String>, i64, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt =
            conn.prepare("SELECT link, email, created_at, updated_at FROM photos ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        rows.collect()
    }

    #[cfg(test)]
    pub fn links(&self) -> SqlResult<Vec<String>> {
        Ok(self.rows()?.into_iter().map(|(link, ..)| link).collect())
    }
}
