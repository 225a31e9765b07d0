//! Wire formats consumed by ingestion.
//!
//! Two row layouts exist: the live decoder's CSV output (timestamp in
//! column 0, meter ID in column 3, cumulative counter in column 7, eight or
//! more columns per data line) and the 3-column backup schema
//! `meter_id,timestamp,cumulative_raw` produced by the export operation.
//! The decoder interleaves its own Go log lines with data on stdout, so the
//! live parser has to tell "not a data line" apart from "corrupt data
//! line".

use monitor_client::Reading;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Header row of the backup export schema.
pub const BACKUP_HEADER: &str = "meter_id,timestamp,cumulative_raw";

const LIVE_TIMESTAMP_COL: usize = 0;
const LIVE_METER_ID_COL: usize = 3;
const LIVE_CUMULATIVE_COL: usize = 7;
const LIVE_MIN_COLUMNS: usize = 8;

/// What one line of live decoder output turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveLine {
    Reading(Reading),
    /// Decoder chatter (Go log lines, short status rows, blanks). Expected
    /// traffic, skipped without counting.
    Diagnostic,
    /// Looked like a data row but would not parse.
    Malformed,
}

/// Outcome of parsing one data row during an import.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Reading(Reading),
    /// Blank line or repeated header; not a data row.
    Skip,
    /// Structurally broken row; counted, never fatal.
    Invalid,
}

/// The two recognised bulk-import layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSchema {
    /// 3-column backup export with a header row.
    Backup,
    /// Live-protocol bulk export (rtlamr CSV column layout).
    LiveExport,
}

impl RowSchema {
    /// Strict per-row parse for imports; decoder chatter is not expected
    /// inside an uploaded file, so anything unparsable is `Invalid`.
    pub fn parse_row(&self, line: &str) -> RowOutcome {
        let line = line.trim();
        if line.is_empty() {
            return RowOutcome::Skip;
        }
        match self {
            RowSchema::Backup => {
                if line == BACKUP_HEADER {
                    return RowOutcome::Skip;
                }
                match parse_backup_fields(line) {
                    Some(reading) => RowOutcome::Reading(reading),
                    None => RowOutcome::Invalid,
                }
            }
            RowSchema::LiveExport => match parse_live_fields(line) {
                Some(reading) => RowOutcome::Reading(reading),
                None => RowOutcome::Invalid,
            },
        }
    }
}

/// Decide which import schema a file uses from its first non-empty line.
/// `None` means the file matches neither layout and the import must be
/// rejected wholesale before anything is committed.
pub fn detect_schema(first_line: &str) -> Option<RowSchema> {
    let line = first_line.trim();
    if line == BACKUP_HEADER {
        return Some(RowSchema::Backup);
    }
    if parse_live_fields(line).is_some() {
        return Some(RowSchema::LiveExport);
    }
    None
}

/// Lenient classification for the live decoder stream and capture replays.
pub fn classify_live_line(line: &str) -> LiveLine {
    let line = line.trim();
    if line.is_empty() {
        return LiveLine::Diagnostic;
    }
    // The decoder mixes its own log lines (".go:" source locations) with
    // CSV records on stdout.
    if line.contains(".go:") {
        return LiveLine::Diagnostic;
    }

    let fields = match split_csv(line) {
        Some(fields) => fields,
        None => return LiveLine::Malformed,
    };
    if fields.len() < LIVE_MIN_COLUMNS {
        // Short rows are status output, not data.
        return LiveLine::Diagnostic;
    }

    match live_fields_to_reading(&fields) {
        Some(reading) => LiveLine::Reading(reading),
        None => LiveLine::Malformed,
    }
}

fn parse_live_fields(line: &str) -> Option<Reading> {
    let fields = split_csv(line)?;
    if fields.len() < LIVE_MIN_COLUMNS {
        return None;
    }
    live_fields_to_reading(&fields)
}

fn live_fields_to_reading(fields: &[String]) -> Option<Reading> {
    let timestamp = parse_timestamp(fields.get(LIVE_TIMESTAMP_COL)?)?;
    let meter_id = fields.get(LIVE_METER_ID_COL)?.trim();
    let cumulative_raw: i64 = fields.get(LIVE_CUMULATIVE_COL)?.trim().parse().ok()?;
    if meter_id.is_empty() || cumulative_raw < 0 {
        return None;
    }
    Some(Reading {
        meter_id: meter_id.to_string(),
        timestamp,
        cumulative_raw,
    })
}

fn parse_backup_fields(line: &str) -> Option<Reading> {
    let fields = split_csv(line)?;
    if fields.len() != 3 {
        return None;
    }
    let meter_id = fields[0].trim();
    let timestamp = parse_timestamp(&fields[1])?;
    let cumulative_raw: i64 = fields[2].trim().parse().ok()?;
    if meter_id.is_empty() || cumulative_raw < 0 {
        return None;
    }
    Some(Reading {
        meter_id: meter_id.to_string(),
        timestamp,
        cumulative_raw,
    })
}

/// Timestamps arrive as RFC 3339, with the decoder emitting nanosecond
/// fractions and whatever UTC offset the host is configured for.
fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s.trim(), &Rfc3339).ok()
}

fn split_csv(line: &str) -> Option<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    let mut record = csv::StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => Some(record.iter().map(str::to_string).collect()),
        _ => None,
    }
}
