//! SQLite schema for the manual store.

use rusqlite::Connection;

pub(crate) const SCHEMA_VERSION: &str = "1";

/// File-backed databases get WAL; in-memory ones cannot use it.
pub(crate) fn configure_connection(connection: &Connection, in_memory: bool) -> rusqlite::Result<()> {
    connection.pragma_update(None, "foreign_keys", "ON")?;
    if !in_memory {
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;
    }
    Ok(())
}

/// `AUTOINCREMENT` keeps ids monotonic: a re-ingested manual never reuses
/// the ids of an earlier one, even after deletions.
pub(crate) fn ensure_schema(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS manuals (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          make TEXT NOT NULL,
          model TEXT NOT NULL,
          year INTEGER NOT NULL,
          classification TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sections (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          manual_id INTEGER NOT NULL,
          parent_id INTEGER,
          start_page INTEGER NOT NULL,
          end_page INTEGER NOT NULL,
          level INTEGER NOT NULL DEFAULT 1,
          name TEXT NOT NULL,
          ordinal INTEGER NOT NULL DEFAULT 0,
          UNIQUE(manual_id, start_page, ordinal),
          FOREIGN KEY(manual_id) REFERENCES manuals(id),
          FOREIGN KEY(parent_id) REFERENCES sections(id)
        );

        CREATE TABLE IF NOT EXISTS images (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          manual_id INTEGER NOT NULL,
          page INTEGER NOT NULL,
          x REAL NOT NULL,
          y REAL NOT NULL,
          w REAL NOT NULL,
          h REAL NOT NULL,
          description TEXT NOT NULL DEFAULT '',
          FOREIGN KEY(manual_id) REFERENCES manuals(id)
        );

        CREATE INDEX IF NOT EXISTS idx_sections_manual_page ON sections(manual_id, start_page);
        CREATE INDEX IF NOT EXISTS idx_images_manual_page ON images(manual_id, page);
        ",
    )?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let connection = Connection::open_in_memory().unwrap();
        configure_connection(&connection, true).unwrap();
        ensure_schema(&connection).unwrap();
        ensure_schema(&connection).unwrap();

        let version: String = connection
            .query_row(
                "SELECT value FROM metadata WHERE key = 'db_schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
