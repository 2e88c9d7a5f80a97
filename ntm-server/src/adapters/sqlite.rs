use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub const IN_MEMORY: &str = ":memory:";

/// Opens the server database. `:memory:` yields a private in-memory database.
pub fn open(path: &Path) -> anyhow::Result<Connection> {
    if path == Path::new(IN_MEMORY) {
        return Connection::open_in_memory().context("opening in-memory database");
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("opening database {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_file_and_memory_databases() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&dir.path().join("db/ntm.db")).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        let mem = open(Path::new(IN_MEMORY)).unwrap();
        mem.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
    }
}
