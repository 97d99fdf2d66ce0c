//! Projects, folders, repositories, discovered tests and test cases.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::{enum_col, fmt_ts, opt_enum_col, opt_ts_col, Store, StoreError, StoreResult};
use crate::model::{
    DiscoveredTest, DiscoveryChange, Id, NewRepository, NewTestCase, Repository, RunStatus,
    SyncStatus, TestCase, TestType,
};

const REPOSITORY_COLUMNS: &str = "id, project_id, url, branch, provider, framework, tests_directory,
    local_checkout_path, username, auth_token, sync_status, last_sync_time";

const DISCOVERED_COLUMNS: &str =
    "id, repository_id, name, relative_file_path, is_available, last_run_time, last_status";

const TEST_CASE_COLUMNS: &str =
    "id, project_id, folder_id, title, test_type, framework, script_path, repository_id, inline_code";

/// Runnable automated cases: automated type with a script or inline code.
const AUTOMATED_FILTER: &str =
    "test_type = 'automated' AND (script_path IS NOT NULL OR inline_code IS NOT NULL)";

fn repository_from_row(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        project_id: row.get(1)?,
        url: row.get(2)?,
        branch: row.get(3)?,
        provider: enum_col(row, 4)?,
        framework: enum_col(row, 5)?,
        tests_directory: row.get(6)?,
        local_checkout_path: row.get(7)?,
        username: row.get(8)?,
        auth_token: row.get(9)?,
        sync_status: enum_col(row, 10)?,
        last_sync_time: opt_ts_col(row, 11)?,
    })
}

fn discovered_from_row(row: &Row<'_>) -> rusqlite::Result<DiscoveredTest> {
    Ok(DiscoveredTest {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        name: row.get(2)?,
        relative_file_path: row.get(3)?,
        is_available: row.get::<_, i64>(4)? != 0,
        last_run_time: opt_ts_col(row, 5)?,
        last_status: opt_enum_col::<RunStatus>(row, 6)?,
    })
}

fn test_case_from_row(row: &Row<'_>) -> rusqlite::Result<TestCase> {
    Ok(TestCase {
        id: row.get(0)?,
        project_id: row.get(1)?,
        folder_id: row.get(2)?,
        title: row.get(3)?,
        test_type: enum_col::<TestType>(row, 4)?,
        framework: row.get(5)?,
        script_path: row.get(6)?,
        repository_id: row.get(7)?,
        inline_code: row.get(8)?,
    })
}

impl Store {
    // -- projects & folders --------------------------------------------------

    pub fn create_project(&self, name: &str) -> StoreResult<Id> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO projects (name) VALUES (?1)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_folder(&self, project_id: Id, parent_folder_id: Option<Id>, name: &str) -> StoreResult<Id> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO folders (project_id, parent_folder_id, name) VALUES (?1, ?2, ?3)",
            params![project_id, parent_folder_id, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // -- repositories --------------------------------------------------------

    pub fn create_repository(&self, repo: &NewRepository) -> StoreResult<Id> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO repositories
                (project_id, url, branch, provider, framework, tests_directory, username, auth_token, sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                repo.project_id,
                repo.url,
                repo.branch,
                repo.provider.as_str(),
                repo.framework.as_str(),
                repo.tests_directory,
                repo.username,
                repo.auth_token,
                SyncStatus::NotSynced.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_repository(&self, id: Id) -> StoreResult<Repository> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM repositories WHERE id = ?1", REPOSITORY_COLUMNS),
            params![id],
            repository_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound { entity: "repository", id })
    }

    pub fn list_repositories(&self) -> StoreResult<Vec<Repository>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM repositories ORDER BY id", REPOSITORY_COLUMNS))?;
        let rows = stmt.query_map([], repository_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn mark_repository_synced(&self, id: Id, checkout_path: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE repositories SET sync_status = ?2, local_checkout_path = ?3, last_sync_time = ?4 WHERE id = ?1",
            params![id, SyncStatus::Synced.as_str(), checkout_path, fmt_ts(&at)],
        )?;
        Ok(())
    }

    pub fn mark_repository_sync_error(&self, id: Id) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE repositories SET sync_status = ?2 WHERE id = ?1",
            params![id, SyncStatus::Error.as_str()],
        )?;
        Ok(())
    }

    // -- discovered tests ----------------------------------------------------

    pub fn list_discovered_tests(&self, repository_id: Id) -> StoreResult<Vec<DiscoveredTest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM discovered_tests WHERE repository_id = ?1 ORDER BY id",
            DISCOVERED_COLUMNS
        ))?;
        let rows = stmt.query_map(params![repository_id], discovered_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Apply reconciliation writes for one repository atomically.
    pub fn apply_discovery(&self, repository_id: Id, changes: &[DiscoveryChange]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO discovered_tests (repository_id, name, relative_file_path, is_available)
                 VALUES (?1, ?2, ?3, 1)",
            )?;
            let mut update = tx.prepare(
                "UPDATE discovered_tests SET relative_file_path = ?3, is_available = ?4
                 WHERE id = ?1 AND repository_id = ?2",
            )?;
            for change in changes {
                match change {
                    DiscoveryChange::Insert { name, relative_file_path } => {
                        insert.execute(params![repository_id, name, relative_file_path])?;
                    }
                    DiscoveryChange::Update { id, relative_file_path, is_available } => {
                        update.execute(params![id, repository_id, relative_file_path, *is_available as i64])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Look up the catalog entry a repository-backed test case points at.
    pub fn find_discovered_test(
        &self,
        repository_id: Id,
        relative_file_path: &str,
        name: Option<&str>,
    ) -> StoreResult<Option<DiscoveredTest>> {
        let conn = self.conn()?;
        let found = match name {
            Some(name) => conn
                .query_row(
                    &format!(
                        "SELECT {} FROM discovered_tests
                         WHERE repository_id = ?1 AND relative_file_path = ?2 AND name = ?3
                         ORDER BY id LIMIT 1",
                        DISCOVERED_COLUMNS
                    ),
                    params![repository_id, relative_file_path, name],
                    discovered_from_row,
                )
                .optional()?,
            None => conn
                .query_row(
                    &format!(
                        "SELECT {} FROM discovered_tests
                         WHERE repository_id = ?1 AND relative_file_path = ?2
                         ORDER BY is_available DESC, id LIMIT 1",
                        DISCOVERED_COLUMNS
                    ),
                    params![repository_id, relative_file_path],
                    discovered_from_row,
                )
                .optional()?,
        };
        Ok(found)
    }

    pub fn record_discovered_test_run(&self, id: Id, at: DateTime<Utc>, status: RunStatus) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE discovered_tests SET last_run_time = ?2, last_status = ?3 WHERE id = ?1",
            params![id, fmt_ts(&at), status.as_str()],
        )?;
        Ok(())
    }

    // -- test cases ----------------------------------------------------------

    pub fn create_test_case(&self, case: &NewTestCase) -> StoreResult<Id> {
        let conn = self.conn()?;
        let test_type = if case.manual { TestType::Manual } else { TestType::Automated };
        conn.execute(
            "INSERT INTO test_cases
                (project_id, folder_id, title, test_type, framework, script_path, repository_id, inline_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                case.project_id,
                case.folder_id,
                case.title,
                test_type.as_str(),
                case.framework,
                case.script_path,
                case.repository_id,
                case.inline_code,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_test_case(&self, id: Id) -> StoreResult<TestCase> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM test_cases WHERE id = ?1", TEST_CASE_COLUMNS),
            params![id],
            test_case_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound { entity: "test case", id })
    }

    pub fn automated_cases_by_ids(&self, ids: &[Id]) -> StoreResult<Vec<TestCase>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_cases WHERE id IN ({}) AND {} ORDER BY id",
            TEST_CASE_COLUMNS, placeholders, AUTOMATED_FILTER
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), test_case_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn automated_cases_in_project(&self, project_id: Id) -> StoreResult<Vec<TestCase>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_cases WHERE project_id = ?1 AND {} ORDER BY id",
            TEST_CASE_COLUMNS, AUTOMATED_FILTER
        ))?;
        let rows = stmt.query_map(params![project_id], test_case_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Automated cases of `project_id` in `folder_id` and every folder beneath it.
    pub fn automated_cases_in_folder_tree(&self, project_id: Id, folder_id: Id) -> StoreResult<Vec<TestCase>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "WITH RECURSIVE tree(id) AS (
                SELECT id FROM folders WHERE id = ?1 AND project_id = ?2
                UNION
                SELECT f.id FROM folders f JOIN tree t ON f.parent_folder_id = t.id
             )
             SELECT {} FROM test_cases
             WHERE folder_id IN (SELECT id FROM tree) AND project_id = ?2 AND {}
             ORDER BY id",
            TEST_CASE_COLUMNS, AUTOMATED_FILTER
        ))?;
        let rows = stmt.query_map(params![folder_id, project_id], test_case_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
