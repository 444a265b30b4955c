use std::fmt::Write as _;
use thiserror::Error;

/// Number of fields in every record of the stats CSV.
pub const FIELD_COUNT: usize = 63;

pub const FIELD_GROUP: usize = 0;
pub const FIELD_NAME: usize = 1;
pub const FIELD_CURRENT_SESSIONS: usize = 4;
pub const FIELD_BYTES_IN: usize = 8;
pub const FIELD_BYTES_OUT: usize = 9;
pub const FIELD_STATUS: usize = 17;

const AGGREGATE_MARKERS: [&str; 2] = ["BACKEND", "FRONTEND"];
const STATUS_UP: &str = "UP";
const COLUMN_SEPARATOR: &str = " | ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Column {
    name: &'static str,
    position: usize,
    width: usize,
}

/// Projected display columns, in drawing order.
const COLUMNS: [Column; 6] = [
    Column {
        name: "group",
        position: FIELD_GROUP,
        width: 23,
    },
    Column {
        name: "name",
        position: FIELD_NAME,
        width: 35,
    },
    Column {
        name: "scur",
        position: FIELD_CURRENT_SESSIONS,
        width: 6,
    },
    Column {
        name: "bin",
        position: FIELD_BYTES_IN,
        width: 10,
    },
    Column {
        name: "bout",
        position: FIELD_BYTES_OUT,
        width: 10,
    },
    Column {
        name: "status",
        position: FIELD_STATUS,
        width: 7,
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatError {
    #[error("{0}")]
    Parse(String),
    #[error("expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },
}

/// One server record with all of its fields kept in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRow {
    fields: Vec<String>,
}

impl StatRow {
    pub fn new(fields: Vec<String>) -> Result<Self, StatError> {
        if fields.len() != FIELD_COUNT {
            return Err(StatError::FieldCount {
                expected: FIELD_COUNT,
                actual: fields.len(),
            });
        }
        Ok(Self { fields })
    }

    pub fn field(&self, position: usize) -> &str {
        self.fields.get(position).map(String::as_str).unwrap_or("")
    }

    pub fn group(&self) -> &str {
        self.field(FIELD_GROUP)
    }

    pub fn name(&self) -> &str {
        self.field(FIELD_NAME)
    }

    pub fn current_sessions(&self) -> &str {
        self.field(FIELD_CURRENT_SESSIONS)
    }

    pub fn bytes_in(&self) -> &str {
        self.field(FIELD_BYTES_IN)
    }

    pub fn bytes_out(&self) -> &str {
        self.field(FIELD_BYTES_OUT)
    }

    pub fn status(&self) -> &str {
        self.field(FIELD_STATUS)
    }

    pub fn is_up(&self) -> bool {
        self.status() == STATUS_UP
    }

    /// Whole-backend and whole-frontend rollups are not individual servers.
    pub fn is_aggregate(&self) -> bool {
        AGGREGATE_MARKERS.contains(&self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotLine {
    Row(StatRow),
    Invalid(StatError),
}

/// Lazily decodes one snapshot body. Malformed lines come out as
/// `SnapshotLine::Invalid` in place; aggregate rows are dropped.
fn parse_snapshot(raw: &[u8]) -> impl Iterator<Item = SnapshotLine> + '_ {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(raw)
        .into_records()
        .filter_map(|record| {
            let record = match record {
                Ok(record) => record,
                Err(err) => return Some(SnapshotLine::Invalid(StatError::Parse(err.to_string()))),
            };
            let fields = record.iter().map(str::to_string).collect::<Vec<_>>();
            match StatRow::new(fields) {
                Ok(row) if row.is_aggregate() => None,
                Ok(row) => Some(SnapshotLine::Row(row)),
                Err(err) => Some(SnapshotLine::Invalid(err)),
            }
        })
}

/// A fully parsed snapshot. Only ever built whole; never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    lines: Vec<SnapshotLine>,
    rows: Vec<usize>,
}

impl Snapshot {
    pub fn parse(raw: &[u8]) -> Self {
        parse_snapshot(raw).collect()
    }

    /// Rows and error markers in display order.
    pub fn lines(&self) -> &[SnapshotLine] {
        &self.lines
    }

    pub fn row(&self, index: usize) -> Option<&StatRow> {
        let line = self.rows.get(index)?;
        match &self.lines[*line] {
            SnapshotLine::Row(row) => Some(row),
            SnapshotLine::Invalid(_) => None,
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &StatRow> {
        self.lines.iter().filter_map(|line| match line {
            SnapshotLine::Row(row) => Some(row),
            SnapshotLine::Invalid(_) => None,
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn errors(&self) -> impl Iterator<Item = &StatError> {
        self.lines.iter().filter_map(|line| match line {
            SnapshotLine::Invalid(err) => Some(err),
            SnapshotLine::Row(_) => None,
        })
    }
}

impl FromIterator<SnapshotLine> for Snapshot {
    fn from_iter<I: IntoIterator<Item = SnapshotLine>>(iter: I) -> Self {
        let mut snapshot = Snapshot::default();
        for line in iter {
            if matches!(line, SnapshotLine::Row(_)) {
                snapshot.rows.push(snapshot.lines.len());
            }
            snapshot.lines.push(line);
        }
        snapshot
    }
}

pub fn format_header() -> String {
    let mut out = String::new();
    for column in &COLUMNS {
        push_cell(&mut out, column.name, column.width);
    }
    out
}

pub fn format_row(row: &StatRow) -> String {
    let mut out = String::new();
    for column in &COLUMNS {
        push_cell(&mut out, row.field(column.position), column.width);
    }
    out
}

fn push_cell(out: &mut String, text: &str, width: usize) {
    let clipped = text.chars().take(width).collect::<String>();
    let _ = write!(out, "{clipped:>width$}{COLUMN_SEPARATOR}");
}
