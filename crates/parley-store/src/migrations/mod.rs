//! Schema migrations keyed on `PRAGMA user_version`.
//!
//! Every migration listed in [`MIGRATIONS`] whose version is above the
//! stored `user_version` runs once, in order, each inside its own
//! transaction together with the version bump.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Up = fn(&Connection) -> rusqlite::Result<()>;

/// `(version, name, up)` in ascending version order.
const MIGRATIONS: &[(u32, &str, Up)] = &[(1, "v001_initial", v001_initial::up)];

/// Schema version after all migrations have run.
pub const CURRENT_VERSION: u32 = 1;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    for &(version, name, up) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(version, name, "applying migration");

        conn.execute_batch("BEGIN")?;
        let applied = up(conn).and_then(|_| conn.pragma_update(None, "user_version", version));
        match applied {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(StoreError::Migration(format!("{name}: {e}")));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(conn: &Connection) -> u32 {
        conn.pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(version(&conn), CURRENT_VERSION);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_VERSION + 1)
            .unwrap();
        assert!(matches!(
            run_migrations(&conn),
            Err(StoreError::Migration(_))
        ));
    }

    #[test]
    fn versions_ascend_to_current() {
        let versions: Vec<u32> = MIGRATIONS.iter().map(|(v, _, _)| *v).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.last().copied(), Some(CURRENT_VERSION));
    }
}
