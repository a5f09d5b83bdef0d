//! Relational detection log.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use super::PlateRecorder;
use crate::detect::DetectionResult;
use crate::frame::RawImage;
use crate::ingest::CaptureSource;

/// Writes one row per plate match to a SQLite database.
pub struct SqlitePlateRecorder {
    conn: Mutex<Connection>,
}

impl SqlitePlateRecorder {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open plate database {}", db_path.display()))?;
        let recorder = Self {
            conn: Mutex::new(conn),
        };
        recorder.ensure_schema()?;
        Ok(recorder)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let recorder = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        recorder.ensure_schema()?;
        Ok(recorder)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.lock().expect("db lock").execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS plates (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              source TEXT NOT NULL,
              number TEXT NOT NULL,
              epoch_time INTEGER NOT NULL,
              image_width INTEGER NOT NULL,
              image_height INTEGER NOT NULL,
              processing_time REAL NOT NULL,
              confidence REAL NOT NULL,
              top_left_x REAL NOT NULL,
              top_left_y REAL NOT NULL,
              top_right_x REAL NOT NULL,
              top_right_y REAL NOT NULL,
              bottom_right_x REAL NOT NULL,
              bottom_right_y REAL NOT NULL,
              bottom_left_x REAL NOT NULL,
              bottom_left_y REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_plates_epoch ON plates(epoch_time);
            "#,
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn plate_count(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("db lock");
        let count = conn.query_row("SELECT COUNT(*) FROM plates", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl PlateRecorder for SqlitePlateRecorder {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn record(
        &self,
        detection: &DetectionResult,
        source: &CaptureSource,
        _original: &RawImage,
        _filtered: &RawImage,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("db lock");
        for plate in &detection.results {
            let c = &plate.coordinates;
            conn.execute(
                r#"
                INSERT INTO plates(
                    source, number, epoch_time, image_width, image_height,
                    processing_time, confidence,
                    top_left_x, top_left_y, top_right_x, top_right_y,
                    bottom_right_x, bottom_right_y, bottom_left_x, bottom_left_y
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
                params![
                    source.name(),
                    plate.plate,
                    detection.epoch_time as i64,
                    detection.img_width,
                    detection.img_height,
                    plate.processing_time_ms,
                    plate.confidence,
                    c[0].x,
                    c[0].y,
                    c[1].x,
                    c[1].y,
                    c[2].x,
                    c[2].y,
                    c[3].x,
                    c[3].y,
                ],
            )?;
        }
        Ok(())
    }
}
