//! Durable manual store: manuals, sections and image regions in SQLite.
//!
//! Every write runs in autocommit mode, so a row is durable as soon as the
//! call returns. An ingestion that fails halfway leaves the rows of the
//! pages it finished; nothing is rolled back.
//!
//! The connection sits behind a `Mutex` so one store can be shared
//! (`Arc<ManualStore>`) between the ingestion orchestrator and readers.
//! Section ordinals are computed under that lock, which makes them
//! race-free without a transaction.

mod schema;

use crate::config::{Classification, ManualMetadata};
use crate::error::IngestError;
use crate::model::{ImageInfo, ManualInfo, NewImage, NewSection, SectionInfo};
use crate::pipeline::geometry::NormalizedBox;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const SECTION_COLUMNS: &str =
    "id, manual_id, parent_id, start_page, end_page, level, name, ordinal";
const IMAGE_COLUMNS: &str = "id, manual_id, page, x, y, w, h, description";

pub struct ManualStore {
    connection: Mutex<Connection>,
}

impl std::fmt::Debug for ManualStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualStore").finish_non_exhaustive()
    }
}

impl ManualStore {
    /// Open (creating if needed) a file-backed store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| IngestError::ArtifactWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let connection = Connection::open(path)?;
        schema::configure_connection(&connection, false)?;
        schema::ensure_schema(&connection)?;
        debug!("Opened manual store at {}", path.display());
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Private in-memory store, gone when dropped.
    pub fn open_in_memory() -> Result<Self, IngestError> {
        let connection = Connection::open_in_memory()?;
        schema::configure_connection(&connection, true)?;
        schema::ensure_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, IngestError> {
        self.connection
            .lock()
            .map_err(|_| IngestError::Internal("manual store lock poisoned".to_string()))
    }

    // ── Manuals ──────────────────────────────────────────────────────────

    /// Insert a manual row and return its id.
    pub fn create_manual(&self, metadata: &ManualMetadata) -> Result<i64, IngestError> {
        metadata.validate()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO manuals(make, model, year, classification) VALUES(?1, ?2, ?3, ?4)",
            params![
                metadata.make.trim(),
                metadata.model.trim(),
                metadata.year,
                metadata.classification.as_str()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_manual(&self, manual_id: i64) -> Result<Option<ManualInfo>, IngestError> {
        let conn = self.conn()?;
        let manual = conn
            .query_row(
                "SELECT id, make, model, year, classification FROM manuals WHERE id = ?1",
                [manual_id],
                manual_from_row,
            )
            .optional()?;
        Ok(manual)
    }

    pub fn list_manuals(&self) -> Result<Vec<ManualInfo>, IngestError> {
        let conn = self.conn()?;
        let mut statement =
            conn.prepare("SELECT id, make, model, year, classification FROM manuals ORDER BY id")?;
        let rows = statement.query_map([], manual_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Sections ─────────────────────────────────────────────────────────

    /// Insert a section after checking it against the manual and its parent.
    ///
    /// Rejected with [`IngestError::InputInvalid`]: unknown manual,
    /// `level < 1`, `start_page < 1`, `start_page > end_page`, and a parent
    /// that belongs to another manual, is not strictly shallower, or whose
    /// page range does not contain the child's.
    pub fn add_section(&self, manual_id: i64, section: &NewSection) -> Result<SectionInfo, IngestError> {
        if section.level < 1 {
            return Err(IngestError::InputInvalid(format!(
                "section '{}' has level {}; levels start at 1",
                section.name, section.level
            )));
        }
        if section.start_page < 1 || section.start_page > section.end_page {
            return Err(IngestError::InputInvalid(format!(
                "section '{}' has invalid page range {}..={}",
                section.name, section.start_page, section.end_page
            )));
        }

        let conn = self.conn()?;
        ensure_manual_exists(&conn, manual_id)?;

        if let Some(parent_id) = section.parent_id {
            let parent = query_section(&conn, "WHERE id = ?1", params![parent_id])?.ok_or_else(|| {
                IngestError::InputInvalid(format!("parent section {parent_id} does not exist"))
            })?;
            if parent.manual_id != manual_id {
                return Err(IngestError::InputInvalid(format!(
                    "parent section {parent_id} belongs to manual {}, not {manual_id}",
                    parent.manual_id
                )));
            }
            if parent.level >= section.level {
                return Err(IngestError::InputInvalid(format!(
                    "parent section {parent_id} (level {}) is not shallower than level {}",
                    parent.level, section.level
                )));
            }
            if !parent.contains_range(section.start_page, section.end_page) {
                return Err(IngestError::InputInvalid(format!(
                    "pages {}..={} fall outside parent section {parent_id} ({}..={})",
                    section.start_page, section.end_page, parent.start_page, parent.end_page
                )));
            }
        }

        let ordinal: u32 = conn.query_row(
            "SELECT COUNT(*) FROM sections WHERE manual_id = ?1 AND start_page = ?2",
            params![manual_id, section.start_page],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO sections(manual_id, parent_id, start_page, end_page, level, name, ordinal)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                manual_id,
                section.parent_id,
                section.start_page,
                section.end_page,
                section.level,
                section.name,
                ordinal
            ],
        )?;

        Ok(SectionInfo {
            id: conn.last_insert_rowid(),
            manual_id,
            parent_id: section.parent_id,
            start_page: section.start_page,
            end_page: section.end_page,
            level: section.level,
            name: section.name.clone(),
            ordinal,
        })
    }

    /// All sections of a manual in reading order.
    pub fn list_sections(&self, manual_id: i64) -> Result<Vec<SectionInfo>, IngestError> {
        let conn = self.conn()?;
        query_sections(
            &conn,
            "WHERE manual_id = ?1 ORDER BY start_page, id",
            params![manual_id],
        )
    }

    /// The `ordinal`-th section starting on `start_page`.
    pub fn get_section(
        &self,
        manual_id: i64,
        start_page: u32,
        ordinal: u32,
    ) -> Result<Option<SectionInfo>, IngestError> {
        let conn = self.conn()?;
        query_section(
            &conn,
            "WHERE manual_id = ?1 AND start_page = ?2 AND ordinal = ?3",
            params![manual_id, start_page, ordinal],
        )
    }

    pub fn get_section_by_id(&self, section_id: i64) -> Result<Option<SectionInfo>, IngestError> {
        let conn = self.conn()?;
        query_section(&conn, "WHERE id = ?1", params![section_id])
    }

    /// Sections whose page range overlaps `start_page..=end_page`.
    pub fn sections_in_page_range(
        &self,
        manual_id: i64,
        start_page: u32,
        end_page: u32,
    ) -> Result<Vec<SectionInfo>, IngestError> {
        let conn = self.conn()?;
        query_sections(
            &conn,
            "WHERE manual_id = ?1 AND start_page <= ?3 AND end_page >= ?2 ORDER BY start_page, id",
            params![manual_id, start_page, end_page],
        )
    }

    /// Case-insensitive substring match on section names, optionally
    /// restricted to one manual. `%` and `_` in `needle` match literally.
    pub fn find_sections_by_name(
        &self,
        manual_id: Option<i64>,
        needle: &str,
    ) -> Result<Vec<SectionInfo>, IngestError> {
        let pattern = format!("%{}%", escape_like(needle.trim()));
        let conn = self.conn()?;
        query_sections(
            &conn,
            "WHERE (?1 IS NULL OR manual_id = ?1) AND name LIKE ?2 ESCAPE '\\'
             ORDER BY manual_id, start_page, id",
            params![manual_id, pattern],
        )
    }

    // ── Images ───────────────────────────────────────────────────────────

    /// Insert an image region. The box is clamped into the unit square
    /// before it is stored.
    pub fn add_image(&self, manual_id: i64, image: &NewImage) -> Result<ImageInfo, IngestError> {
        if image.page < 1 {
            return Err(IngestError::InputInvalid(
                "image page numbers start at 1".to_string(),
            ));
        }
        let bbox = image.bbox.clamped();

        let conn = self.conn()?;
        ensure_manual_exists(&conn, manual_id)?;
        conn.execute(
            "INSERT INTO images(manual_id, page, x, y, w, h, description)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                manual_id,
                image.page,
                bbox.x,
                bbox.y,
                bbox.w,
                bbox.h,
                image.description
            ],
        )?;

        Ok(ImageInfo {
            id: conn.last_insert_rowid(),
            manual_id,
            page: image.page,
            bbox,
            description: image.description.clone(),
        })
    }

    pub fn get_image(&self, image_id: i64) -> Result<Option<ImageInfo>, IngestError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1");
        Ok(conn.query_row(&sql, [image_id], image_from_row).optional()?)
    }

    pub fn list_images(&self, manual_id: i64) -> Result<Vec<ImageInfo>, IngestError> {
        self.images_in_page_range(manual_id, 1, u32::MAX)
    }

    pub fn images_on_page(&self, manual_id: i64, page: u32) -> Result<Vec<ImageInfo>, IngestError> {
        self.images_in_page_range(manual_id, page, page)
    }

    pub fn images_in_page_range(
        &self,
        manual_id: i64,
        start_page: u32,
        end_page: u32,
    ) -> Result<Vec<ImageInfo>, IngestError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {IMAGE_COLUMNS} FROM images
             WHERE manual_id = ?1 AND page BETWEEN ?2 AND ?3
             ORDER BY page, id"
        );
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(params![manual_id, start_page, end_page], image_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn ensure_manual_exists(conn: &Connection, manual_id: i64) -> Result<(), IngestError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM manuals WHERE id = ?1)",
        [manual_id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(IngestError::InputInvalid(format!("manual {manual_id} does not exist")))
    }
}

fn query_section(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> Result<Option<SectionInfo>, IngestError> {
    let sql = format!("SELECT {SECTION_COLUMNS} FROM sections {clause}");
    Ok(conn.query_row(&sql, params, section_from_row).optional()?)
}

fn query_sections(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<SectionInfo>, IngestError> {
    let sql = format!("SELECT {SECTION_COLUMNS} FROM sections {clause}");
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map(params, section_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn manual_from_row(row: &Row<'_>) -> rusqlite::Result<ManualInfo> {
    let classification: String = row.get(4)?;
    let classification = classification
        .parse::<Classification>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(ManualInfo {
        id: row.get(0)?,
        make: row.get(1)?,
        model: row.get(2)?,
        year: row.get(3)?,
        classification,
    })
}

fn section_from_row(row: &Row<'_>) -> rusqlite::Result<SectionInfo> {
    Ok(SectionInfo {
        id: row.get(0)?,
        manual_id: row.get(1)?,
        parent_id: row.get(2)?,
        start_page: row.get(3)?,
        end_page: row.get(4)?,
        level: row.get(5)?,
        name: row.get(6)?,
        ordinal: row.get(7)?,
    })
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageInfo> {
    Ok(ImageInfo {
        id: row.get(0)?,
        manual_id: row.get(1)?,
        page: row.get(2)?,
        bbox: NormalizedBox::new(row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?),
        description: row.get(7)?,
    })
}

fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
