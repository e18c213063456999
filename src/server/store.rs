use crate::build_log::{LogDelta, LogSnapshot, Status};
use crate::error::ReportError;
use crate::report::ReportRequest;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A build report as served to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReport {
    pub id: u64,
    pub created_at: String,
    pub updated_at: String,
    pub finished: bool,
    pub request: ReportRequest,
    pub log: LogSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub id: u64,
    pub command: String,
    pub host: String,
    pub status: Status,
    pub finished: bool,
    pub created_at: String,
}

/// SQLite persistence for build reports.
///
/// The single connection is guarded by a mutex, so deltas for a report are
/// applied one at a time in the order the requests acquire it.
pub struct ReportStore {
    conn: Mutex<Connection>,
}

impl ReportStore {
    pub fn new(db_path: &Path) -> Result<Self, ReportError> {
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, ReportError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ReportError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                command TEXT NOT NULL,
                host TEXT NOT NULL,
                status TEXT NOT NULL,
                finished INTEGER NOT NULL DEFAULT 0,
                request TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                created_at TIMESTAMP,
                updated_at TIMESTAMP
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stores a new report whose log tree starts as an empty root named
    /// after the command.
    pub fn create(&self, request: &ReportRequest) -> Result<u64, ReportError> {
        let snapshot = LogSnapshot::new(request.command.clone());
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reports (command, host, status, finished, request, snapshot, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?6)",
            params![
                request.command,
                request.host.name,
                snapshot.status.as_str(),
                serde_json::to_string(request)?,
                serde_json::to_string(&snapshot)?,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    /// Applies `delta` to the stored log tree. Returns whether the report is
    /// now finished.
    pub fn apply_delta(&self, id: u64, delta: &LogDelta) -> Result<bool, ReportError> {
        let conn = self.conn.lock();
        let row: Option<(bool, String)> = conn
            .query_row(
                "SELECT finished, snapshot FROM reports WHERE id = ?1",
                params![id as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((finished, snapshot)) = row else {
            return Err(ReportError::NotFound { id });
        };
        if finished {
            return Err(ReportError::Finished { id });
        }

        let mut snapshot: LogSnapshot = serde_json::from_str(&snapshot)?;
        snapshot.apply(delta);
        let finished = snapshot.closed;
        conn.execute(
            "UPDATE reports SET snapshot = ?1, status = ?2, finished = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                serde_json::to_string(&snapshot)?,
                snapshot.status.as_str(),
                finished,
                chrono::Utc::now().to_rfc3339(),
                id as i64
            ],
        )?;
        Ok(finished)
    }

    pub fn get(&self, id: u64) -> Result<StoredReport, ReportError> {
        let conn = self.conn.lock();
        let row: Option<(String, String, bool, String, String)> = conn
            .query_row(
                "SELECT created_at, updated_at, finished, request, snapshot FROM reports WHERE id = ?1",
                params![id as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;
        let Some((created_at, updated_at, finished, request, snapshot)) = row else {
            return Err(ReportError::NotFound { id });
        };
        Ok(StoredReport {
            id,
            created_at,
            updated_at,
            finished,
            request: serde_json::from_str(&request)?,
            log: serde_json::from_str(&snapshot)?,
        })
    }

    /// Most recent reports first.
    pub fn list(&self, limit: usize) -> Result<Vec<ReportSummary>, ReportError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, command, host, status, finished, created_at FROM reports ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let status: String = row.get(3)?;
            Ok(ReportSummary {
                id: row.get::<_, i64>(0)? as u64,
                command: row.get(1)?,
                host: row.get(2)?,
                status: Status::from_wire(&status).unwrap_or_default(),
                finished: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut summaries = Vec::new();
        for summary in rows {
            summaries.push(summary?);
        }
        Ok(summaries)
    }

    /// Ids of reports still receiving updates.
    pub fn live(&self) -> Result<Vec<u64>, ReportError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM reports WHERE finished = 0 ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;

        let mut ids = Vec::new();
        for id in rows {
            ids.push(id? as u64);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphPayload;
    use crate::report::HostInfo;
    use std::collections::BTreeMap;

    fn request() -> ReportRequest {
        ReportRequest {
            host: HostInfo {
                name: "ci-1".into(),
                platform: "linux".into(),
                processors: 8,
                extra: serde_json::Map::new(),
            },
            working_dir: "/src".into(),
            command_line: "anvil build :all".into(),
            command: "build".into(),
            stages: vec!["build".into()],
            configuration: serde_json::Value::Null,
            targets: vec![":all".into()],
            graph: GraphPayload {
                nodes: Vec::new(),
                edges: Vec::new(),
            },
        }
    }

    fn stage_delta(status: Status) -> LogDelta {
        let mut children = BTreeMap::new();
        children.insert(
            "build".to_string(),
            LogDelta {
                status: Some(status),
                ..LogDelta::default()
            },
        );
        LogDelta {
            children,
            ..LogDelta::default()
        }
    }

    #[test]
    fn test_create_and_apply_in_order() {
        let store = ReportStore::in_memory().unwrap();
        let id = store.create(&request()).unwrap();

        store.apply_delta(id, &stage_delta(Status::Running)).unwrap();
        store.apply_delta(id, &stage_delta(Status::Succeeded)).unwrap();

        let report = store.get(id).unwrap();
        assert_eq!(report.request.host.name, "ci-1");
        assert_eq!(report.log.name, "build");
        assert_eq!(report.log.children["build"].status, Status::Succeeded);
        assert!(!report.finished);
    }

    #[test]
    fn test_closing_root_finishes_report() {
        let store = ReportStore::in_memory().unwrap();
        let id = store.create(&request()).unwrap();
        let close = LogDelta {
            status: Some(Status::Succeeded),
            closed: Some(true),
            ..LogDelta::default()
        };
        assert!(store.apply_delta(id, &close).unwrap());
        assert!(store.live().unwrap().is_empty());
        assert!(matches!(
            store.apply_delta(id, &stage_delta(Status::Failed)),
            Err(ReportError::Finished { .. })
        ));
        assert_eq!(store.list(10).unwrap()[0].status, Status::Succeeded);
    }

    #[test]
    fn test_unknown_report() {
        let store = ReportStore::in_memory().unwrap();
        assert!(matches!(store.get(7), Err(ReportError::NotFound { id: 7 })));
        assert!(matches!(
            store.apply_delta(7, &LogDelta::default()),
            Err(ReportError::NotFound { id: 7 })
        ));
    }

    #[test]
    fn test_list_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(&dir.path().join("reports.db")).unwrap();
        let first = store.create(&request()).unwrap();
        let second = store.create(&request()).unwrap();
        let ids: Vec<u64> = store.list(10).unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second, first]);
        assert_eq!(store.live().unwrap(), vec![first, second]);
    }
}
