//! Database schema and migrations.

use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS folders (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL REFERENCES projects(id),
            parent_folder_id INTEGER REFERENCES folders(id),
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS repositories (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL REFERENCES projects(id),
            url TEXT NOT NULL,
            branch TEXT NOT NULL,
            provider TEXT NOT NULL,
            framework TEXT NOT NULL,
            tests_directory TEXT NOT NULL,
            local_checkout_path TEXT,
            username TEXT,
            auth_token TEXT,
            sync_status TEXT NOT NULL DEFAULT 'not_synced',
            last_sync_time TEXT
        );

        CREATE TABLE IF NOT EXISTS discovered_tests (
            id INTEGER PRIMARY KEY,
            repository_id INTEGER NOT NULL REFERENCES repositories(id),
            name TEXT NOT NULL,
            relative_file_path TEXT NOT NULL,
            is_available INTEGER NOT NULL DEFAULT 1,
            last_run_time TEXT,
            last_status TEXT
        );

        CREATE TABLE IF NOT EXISTS test_cases (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL REFERENCES projects(id),
            folder_id INTEGER REFERENCES folders(id),
            title TEXT NOT NULL,
            test_type TEXT NOT NULL,
            framework TEXT,
            script_path TEXT,
            repository_id INTEGER REFERENCES repositories(id),
            inline_code TEXT
        );

        CREATE TABLE IF NOT EXISTS test_runs (
            id INTEGER PRIMARY KEY,
            test_case_id INTEGER NOT NULL REFERENCES test_cases(id),
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            duration_seconds REAL,
            output_text TEXT NOT NULL DEFAULT '',
            error_text TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS test_events (
            id INTEGER PRIMARY KEY,
            test_run_id INTEGER NOT NULL REFERENCES test_runs(id),
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            description TEXT NOT NULL,
            details_json TEXT NOT NULL DEFAULT 'null',
            timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scheduler_events (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL REFERENCES projects(id),
            title TEXT NOT NULL,
            event_type TEXT NOT NULL,
            scheduled_time TEXT NOT NULL,
            recurrence TEXT NOT NULL DEFAULT 'none',
            test_selector_json TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            last_run_time TEXT,
            parent_event_id INTEGER REFERENCES scheduler_events(id),
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_discovered_tests_repo ON discovered_tests(repository_id);
        CREATE INDEX IF NOT EXISTS idx_test_cases_project ON test_cases(project_id);
        CREATE INDEX IF NOT EXISTS idx_test_cases_folder ON test_cases(folder_id);
        CREATE INDEX IF NOT EXISTS idx_test_runs_case ON test_runs(test_case_id);
        CREATE INDEX IF NOT EXISTS idx_test_events_run ON test_events(test_run_id);
        CREATE INDEX IF NOT EXISTS idx_scheduler_events_time ON scheduler_events(scheduled_time);
        CREATE INDEX IF NOT EXISTS idx_scheduler_events_parent ON scheduler_events(parent_event_id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in [
            "projects",
            "folders",
            "repositories",
            "discovered_tests",
            "test_cases",
            "test_runs",
            "test_events",
            "scheduler_events",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "table {} should start empty", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
