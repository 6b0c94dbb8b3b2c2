use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CalcError {
    #[error("No se permiten números negativos")]
    NegativeOperand {
        operation: Operation,
        operands: Vec<f64>,
    },
    #[error("Division entre cero")]
    DivisionByZero {
        operation: Operation,
        operands: Vec<f64>,
    },
    #[error("Lista vacía o inválida")]
    EmptyBatch,
    #[error("Operación inválida: {0}")]
    InvalidOperationKind(String),
    #[error("Cada operación requiere al menos 2 números")]
    InsufficientOperands,
    #[error("history store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Failure raised by a [`HistoryStore`] implementation. Carries the
/// backend's diagnostic text; the pipeline maps it to
/// [`CalcError::StoreUnavailable`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{0}")]
pub struct StoreError(pub String);

impl From<StoreError> for CalcError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable(err.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Sum,
    Sub,
    Mul,
    Div,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sum" => Some(Self::Sum),
            "sub" => Some(Self::Sub),
            "mul" => Some(Self::Mul),
            "div" => Some(Self::Div),
            _ => None,
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluates `operands` under `operation`.
///
/// Sum and Mul fold with their identities; Sub and Div left-fold from the
/// first operand (`a - b - c`, `a / b / c`). Negative operands are rejected
/// before the division-by-zero check.
///
/// # Errors
/// Returns [`CalcError::InsufficientOperands`] for fewer than two operands,
/// [`CalcError::NegativeOperand`] when any operand is below zero, and
/// [`CalcError::DivisionByZero`] when a divisor after the first operand is
/// zero.
pub fn evaluate(operation: Operation, operands: &[f64]) -> Result<f64, CalcError> {
    if operands.len() < 2 {
        return Err(CalcError::InsufficientOperands);
    }

    if operands.iter().any(|value| *value < 0.0) {
        return Err(CalcError::NegativeOperand {
            operation,
            operands: operands.to_vec(),
        });
    }

    if operation == Operation::Div && operands[1..].iter().any(|value| *value == 0.0) {
        return Err(CalcError::DivisionByZero {
            operation,
            operands: operands.to_vec(),
        });
    }

    let result = match operation {
        Operation::Sum => operands.iter().sum(),
        Operation::Mul => operands.iter().product(),
        Operation::Sub => operands[1..]
            .iter()
            .fold(operands[0], |acc, value| acc - value),
        Operation::Div => operands[1..]
            .iter()
            .fold(operands[0], |acc, value| acc / value),
    };

    Ok(result)
}

/// A persisted log entry for one computed operation. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub record_seq: i64,
    pub record_id: Ulid,
    pub operation: Operation,
    pub operands: Vec<f64>,
    pub resultado: f64,
    pub date: OffsetDateTime,
}

/// Payload for a record about to be persisted. The store assigns
/// `record_seq`, `record_id`, and `date`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryRecord {
    pub operation: Operation,
    pub operands: Vec<f64>,
    pub resultado: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Date,
    Result,
}

impl SortField {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "date" => Some(Self::Date),
            "result" => Some(Self::Result),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// History selection: optional operation-kind filter, inclusive date bounds,
/// and an explicit sort field and direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
    pub operation: Option<Operation>,
    pub date_from: Option<OffsetDateTime>,
    pub date_to: Option<OffsetDateTime>,
    pub sort_field: SortField,
    pub sort_order: SortOrder,
}

impl HistoryQuery {
    #[must_use]
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        if let Some(operation) = self.operation {
            if record.operation != operation {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if record.date < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if record.date > to {
                return false;
            }
        }
        true
    }
}

/// Append-only log of operation records. Implementations must assign
/// monotonically increasing `record_seq` values in write order.
pub trait HistoryStore {
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot persist the record.
    fn insert(&mut self, record: NewHistoryRecord) -> Result<HistoryRecord, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backend cannot run the query.
    fn find(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, StoreError>;
}

/// Validates, evaluates, and persists one two-operand operation.
///
/// Persistence failure fails the whole request: a returned result must
/// always have a matching history record.
///
/// # Errors
/// Propagates [`evaluate`] failures and maps store failures to
/// [`CalcError::StoreUnavailable`].
pub fn record_operation(
    store: &mut dyn HistoryStore,
    operation: Operation,
    a: f64,
    b: f64,
) -> Result<f64, CalcError> {
    let operands = vec![a, b];
    let resultado = evaluate(operation, &operands)?;
    store.insert(NewHistoryRecord {
        operation,
        operands,
        resultado,
    })?;
    Ok(resultado)
}

/// One batch request item, as received on the wire. `op` stays a raw string
/// so an unknown kind can be reported back verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub op: String,
    pub nums: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchOutcome {
    pub op: Operation,
    pub result: f64,
}

/// Runs a batch of operations in order with first-failure semantics.
///
/// Each item is validated, evaluated over its full operand sequence, and
/// persisted before the next item starts. The first invalid item aborts the
/// batch; records written for earlier items stay persisted (at-least-once,
/// not atomic).
///
/// # Errors
/// Returns [`CalcError::EmptyBatch`] for an empty list,
/// [`CalcError::InvalidOperationKind`] and
/// [`CalcError::InsufficientOperands`] for structurally invalid items, and
/// propagates evaluation and store failures.
pub fn run_batch(
    store: &mut dyn HistoryStore,
    items: &[BatchItem],
) -> Result<Vec<BatchOutcome>, CalcError> {
    if items.is_empty() {
        return Err(CalcError::EmptyBatch);
    }

    let mut outcomes = Vec::with_capacity(items.len());
    for item in items {
        let op_raw = item.op.trim();
        let operation = Operation::parse(op_raw)
            .ok_or_else(|| CalcError::InvalidOperationKind(op_raw.to_string()))?;

        if item.nums.len() < 2 {
            return Err(CalcError::InsufficientOperands);
        }

        let resultado = evaluate(operation, &item.nums)?;
        store.insert(NewHistoryRecord {
            operation,
            operands: item.nums.clone(),
            resultado,
        })?;

        outcomes.push(BatchOutcome {
            op: operation,
            result: resultado,
        });
    }

    Ok(outcomes)
}

/// In-memory [`HistoryStore`] for tests and local experiments.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Vec<HistoryRecord>,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn insert(&mut self, record: NewHistoryRecord) -> Result<HistoryRecord, StoreError> {
        let record_seq = i64::try_from(self.records.len())
            .map_err(|_| StoreError("record_seq overflow".to_string()))?
            + 1;
        let stored = HistoryRecord {
            record_seq,
            record_id: Ulid::new(),
            operation: record.operation,
            operands: record.operands,
            resultado: record.resultado,
            date: now_utc(),
        };
        self.records.push(stored.clone());
        Ok(stored)
    }

    fn find(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, StoreError> {
        let mut matches: Vec<HistoryRecord> = self
            .records
            .iter()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        sort_records(&mut matches, query.sort_field, query.sort_order);
        Ok(matches)
    }
}

fn sort_records(records: &mut [HistoryRecord], field: SortField, order: SortOrder) {
    records.sort_by(|left, right| {
        let ordering = match field {
            SortField::Date => left
                .date
                .cmp(&right.date)
                .then(left.record_seq.cmp(&right.record_seq)),
            SortField::Result => left
                .resultado
                .total_cmp(&right.resultado)
                .then(left.record_seq.cmp(&right.record_seq)),
        };
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

/// Parses an RFC3339 timestamp and normalizes it to UTC. Any offset is
/// accepted; unparseable input yields `None` so callers can ignore it.
#[must_use]
pub fn parse_rfc3339(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns the underlying formatting error for out-of-range timestamps.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, time::error::Format> {
    value.to_offset(UtcOffset::UTC).format(&Rfc3339)
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
