#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use calculadora_core::{
    format_rfc3339, now_utc, parse_rfc3339, run_batch, BatchItem, BatchOutcome, CalcError,
    HistoryQuery, HistoryRecord, HistoryStore, NewHistoryRecord, Operation, SortField, SortOrder,
    StoreError,
};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection};
use time::OffsetDateTime;
use ulid::Ulid;

const HISTORY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_HISTORIAL_V1: &str = r"
CREATE TABLE IF NOT EXISTS historial (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id TEXT NOT NULL UNIQUE,
  operacion TEXT NOT NULL CHECK (operacion IN ('sum', 'sub', 'mul', 'div')),
  operands_json TEXT NOT NULL,
  resultado REAL NOT NULL,
  date TEXT NOT NULL,
  date_unix_ns INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_historial_no_update
BEFORE UPDATE ON historial
BEGIN
  SELECT RAISE(FAIL, 'historial is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_historial_no_delete
BEFORE DELETE ON historial
BEGIN
  SELECT RAISE(FAIL, 'historial is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_historial_operacion_date
  ON historial(operacion, date_unix_ns);
CREATE INDEX IF NOT EXISTS idx_historial_date
  ON historial(date_unix_ns);
CREATE INDEX IF NOT EXISTS idx_historial_resultado
  ON historial(resultado);
";

/// Durable append-only history log backed by sqlite.
pub struct SqliteHistoryStore {
    conn: Connection,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_HISTORIAL_V1)
            .context("failed to apply historial schema")?;

        let now = format_rfc3339(now_utc()).context("failed to format migration timestamp")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![HISTORY_MIGRATION_VERSION, now],
            )
            .context("failed to register historial schema migration")?;

        Ok(())
    }

    fn insert_record(&mut self, record: &NewHistoryRecord) -> Result<HistoryRecord> {
        if record.operands.len() < 2 {
            return Err(anyhow!("operation record requires at least 2 operands"));
        }

        let record_id = Ulid::new();
        let date = now_utc();
        let date_text = format_rfc3339(date).context("failed to format record timestamp")?;
        let date_unix_ns = unix_nanos(date)?;
        let operands_json =
            serde_json::to_string(&record.operands).context("failed to serialize operands")?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start insert transaction")?;

        tx.execute(
            "INSERT INTO historial(
                record_id, operacion, operands_json, resultado, date, date_unix_ns
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record_id.to_string(),
                record.operation.as_str(),
                operands_json,
                record.resultado,
                date_text,
                date_unix_ns,
            ],
        )
        .context("failed to append history record")?;

        let record_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit insert transaction")?;

        Ok(HistoryRecord {
            record_seq,
            record_id,
            operation: record.operation,
            operands: record.operands.clone(),
            resultado: record.resultado,
            date,
        })
    }

    fn find_records(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let mut sql = String::from(
            "SELECT record_seq, record_id, operacion, operands_json, resultado, date
             FROM historial",
        );

        let op_value = query
            .operation
            .map(|operation| operation.as_str().to_string());
        let from_value = query.date_from.map(unix_nanos).transpose()?;
        let to_value = query.date_to.map(unix_nanos).transpose()?;

        let mut clauses: Vec<String> = Vec::new();
        let mut bindings: Vec<&dyn ToSql> = Vec::new();
        if let Some(value) = op_value.as_ref() {
            bindings.push(value);
            clauses.push(format!("operacion = ?{}", bindings.len()));
        }
        if let Some(value) = from_value.as_ref() {
            bindings.push(value);
            clauses.push(format!("date_unix_ns >= ?{}", bindings.len()));
        }
        if let Some(value) = to_value.as_ref() {
            bindings.push(value);
            clauses.push(format!("date_unix_ns <= ?{}", bindings.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let sort_column = match query.sort_field {
            SortField::Date => "date_unix_ns",
            SortField::Result => "resultado",
        };
        let direction = match query.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        // record_seq breaks ties deterministically in the same direction.
        sql.push_str(&format!(
            " ORDER BY {sort_column} {direction}, record_seq {direction}"
        ));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(bindings.as_slice(), parse_history_row)?;
        collect_rows(rows)
    }

    fn ping(&self) -> Result<()> {
        let _count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM historial", [], |row| row.get(0))
            .context("failed to read historial")?;
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn insert(&mut self, record: NewHistoryRecord) -> Result<HistoryRecord, StoreError> {
        self.insert_record(&record).map_err(into_store_error)
    }

    fn find(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, StoreError> {
        self.find_records(query).map_err(into_store_error)
    }
}

/// Cloneable per-request handle over the sqlite history store. Opens and
/// migrates a connection per call so every request works on a fresh handle.
#[derive(Debug, Clone)]
pub struct HistoryApi {
    db_path: PathBuf,
}

impl HistoryApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteHistoryStore, CalcError> {
        let store = SqliteHistoryStore::open(&self.db_path).map_err(store_unavailable)?;
        store.migrate().map_err(store_unavailable)?;
        Ok(store)
    }

    /// Validates, evaluates, and persists one two-operand operation.
    pub fn record_operation(
        &self,
        operation: Operation,
        a: f64,
        b: f64,
    ) -> Result<f64, CalcError> {
        let mut store = self.open_store()?;
        calculadora_core::record_operation(&mut store, operation, a, b)
    }

    /// Runs a batch with first-failure semantics; earlier items stay
    /// persisted when a later item fails.
    pub fn run_batch(&self, items: &[BatchItem]) -> Result<Vec<BatchOutcome>, CalcError> {
        let mut store = self.open_store()?;
        run_batch(&mut store, items)
    }

    pub fn query_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, CalcError> {
        let store = self.open_store()?;
        store.find(query).map_err(CalcError::from)
    }

    /// Opens, migrates, and runs a trivial query against the store so health
    /// checks report actual reachability.
    pub fn ping(&self) -> Result<(), CalcError> {
        let store = self.open_store()?;
        store.ping().map_err(store_unavailable)
    }
}

fn store_unavailable(err: anyhow::Error) -> CalcError {
    CalcError::StoreUnavailable(format!("{err:#}"))
}

fn into_store_error(err: anyhow::Error) -> StoreError {
    StoreError(format!("{err:#}"))
}

fn unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of range: {value}"))
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let record_seq: i64 = row.get(0)?;
    let record_id_raw: String = row.get(1)?;
    let operacion_raw: String = row.get(2)?;
    let operands_json: String = row.get(3)?;
    let resultado: f64 = row.get(4)?;
    let date_raw: String = row.get(5)?;

    let record_id = Ulid::from_string(&record_id_raw).map_err(|err| {
        conversion_error(1, format!("invalid record_id {record_id_raw}: {err}"))
    })?;
    let operation = Operation::parse(&operacion_raw)
        .ok_or_else(|| conversion_error(2, format!("unknown operacion: {operacion_raw}")))?;
    let operands: Vec<f64> = serde_json::from_str(&operands_json)
        .map_err(|err| conversion_error(3, format!("invalid operands_json: {err}")))?;
    let date = parse_rfc3339(&date_raw)
        .ok_or_else(|| conversion_error(5, format!("invalid date: {date_raw}")))?;

    Ok(HistoryRecord {
        record_seq,
        record_id,
        operation,
        operands,
        resultado,
        date,
    })
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for row in rows {
        items.push(row.context("failed to read history row")?);
    }
    Ok(items)
}
