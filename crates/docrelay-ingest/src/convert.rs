//! Spreadsheet to CSV conversion
//!
//! An `.xlsx` file is a zip archive of SpreadsheetML parts. Only what is
//! needed to recover the cell text of the first worksheet is read:
//!
//! - `xl/workbook.xml` and `xl/_rels/workbook.xml.rels` locate the first sheet
//! - `xl/sharedStrings.xml` holds the string table (optional)
//! - `xl/styles.xml` tells which number formats are dates (optional)
//! - the worksheet part holds `<row>`/`<c>` cells
//!
//! Numbers keep their serialized form unless the cell carries a date or time
//! format, in which case the serial is written as `YYYY-MM-DD`,
//! `YYYY-MM-DD HH:MM:SS` or `HH:MM:SS`. Booleans become `TRUE`/`FALSE`,
//! error cells keep their code (`#N/A`).
//!
//! References past `XFD1048576` are rejected rather than allocated.

use chrono::{Duration, NaiveDate, NaiveTime};
use docrelay_common::{RelayError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Seek};
use std::path::Path;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

/// Extension of the spreadsheet container format.
pub const SPREADSHEET_EXTENSION: &str = "xlsx";

/// Extension of the delimited-text format the loader expects.
pub const DELIMITED_EXTENSION: &str = "csv";

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
const STYLES_PART: &str = "xl/styles.xml";
const FALLBACK_SHEET_PART: &str = "xl/worksheets/sheet1.xml";

/// Columns `A..=XFD`
const MAX_COLUMNS: usize = 16_384;
const MAX_ROWS: usize = 1_048_576;

/// Serial of 9999-12-31, the last date a workbook can hold
const MAX_SERIAL: f64 = 2_958_465.0;

/// Rectangular cell grid, first row is the header
pub type Grid = Vec<Vec<String>>;

/// Convert the first worksheet of `source` to CSV at `target`
///
/// Returns the number of records written, header included.
pub fn xlsx_to_csv(source: &Path, target: &Path) -> Result<usize> {
    let file = std::fs::File::open(source)?;
    let grid = read_first_sheet(BufReader::new(file))?;
    write_csv(&grid, target)?;

    debug!(
        source = %source.display(),
        target = %target.display(),
        records = grid.len(),
        "Converted spreadsheet to CSV"
    );
    Ok(grid.len())
}

/// Read the first worksheet of an xlsx archive into a rectangular grid
pub fn read_first_sheet<R: Read + Seek>(reader: R) -> Result<Grid> {
    let mut archive = ZipArchive::new(reader)
        .map_err(|e| RelayError::conversion(format!("not an xlsx archive: {}", e)))?;

    let workbook = read_workbook(&mut archive)?;

    let shared = match open_part(&mut archive, SHARED_STRINGS_PART)? {
        Some(part) => parse_shared_strings(part)?,
        None => Vec::new(),
    };

    let dates = match open_part(&mut archive, STYLES_PART)? {
        Some(part) => parse_styles(part, workbook.date_system)?,
        None => DateStyles::new(workbook.date_system),
    };

    let sheet = open_part(&mut archive, &workbook.sheet_part)?.ok_or_else(|| {
        RelayError::conversion(format!("worksheet part '{}' is missing", workbook.sheet_part))
    })?;

    let mut grid = parse_sheet(sheet, &shared, &dates)?;
    squash(&mut grid);
    Ok(grid)
}

/// Write a grid as CSV
pub fn write_csv(grid: &[Vec<String>], target: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(target).map_err(csv_error)?;
    for row in grid {
        writer.write_record(row).map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

fn csv_error(err: csv::Error) -> RelayError {
    match err.into_kind() {
        csv::ErrorKind::Io(io) => RelayError::Io(io),
        other => RelayError::conversion(format!("cannot write CSV: {:?}", other)),
    }
}

fn malformed(part: &str, err: impl std::fmt::Display) -> RelayError {
    RelayError::conversion(format!("malformed {}: {}", part, err))
}

fn open_part<'a, R: Read + Seek>(
    archive: &'a mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Reader<BufReader<zip::read::ZipFile<'a>>>>> {
    match archive.by_name(name) {
        Ok(file) => Ok(Some(Reader::from_reader(BufReader::new(file)))),
        Err(ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(malformed(name, e)),
    }
}

fn attribute(start: &BytesStart<'_>, local: &[u8], part: &str) -> Result<Option<String>> {
    for attr in start.attributes() {
        let attr = attr.map_err(|e| malformed(part, e))?;
        if attr.key.local_name().as_ref() == local {
            let value = attr.unescape_value().map_err(|e| malformed(part, e))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Day zero of the workbook's serial dates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum DateSystem {
    #[default]
    Epoch1900,
    Epoch1904,
}

struct Workbook {
    sheet_part: String,
    date_system: DateSystem,
}

/// Resolve the archive path of the first `<sheet>` and the date system
fn read_workbook<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<Workbook> {
    let mut date_system = DateSystem::default();
    let relationship_id = match open_part(archive, WORKBOOK_PART)? {
        Some(mut xml) => {
            let mut buf = Vec::new();
            let mut found = None;
            loop {
                match xml.read_event_into(&mut buf).map_err(|e| malformed(WORKBOOK_PART, e))? {
                    Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                        b"workbookPr" => {
                            let flag = attribute(&e, b"date1904", WORKBOOK_PART)?;
                            if matches!(flag.as_deref(), Some("1" | "true")) {
                                date_system = DateSystem::Epoch1904;
                            }
                        },
                        b"sheet" => {
                            found = attribute(&e, b"id", WORKBOOK_PART)?;
                            break;
                        },
                        _ => {},
                    },
                    Event::Eof => break,
                    _ => {},
                }
                buf.clear();
            }
            found
        },
        None => None,
    };

    let sheet_part = match relationship_id {
        Some(id) => sheet_target(archive, &id)?,
        None => FALLBACK_SHEET_PART.to_string(),
    };
    Ok(Workbook {
        sheet_part,
        date_system,
    })
}

fn sheet_target<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    relationship_id: &str,
) -> Result<String> {
    let mut targets = HashMap::new();
    if let Some(mut xml) = open_part(archive, WORKBOOK_RELS_PART)? {
        let mut buf = Vec::new();
        loop {
            match xml
                .read_event_into(&mut buf)
                .map_err(|e| malformed(WORKBOOK_RELS_PART, e))?
            {
                Event::Start(e) | Event::Empty(e)
                    if e.local_name().as_ref() == b"Relationship" =>
                {
                    let id = attribute(&e, b"Id", WORKBOOK_RELS_PART)?;
                    let target = attribute(&e, b"Target", WORKBOOK_RELS_PART)?;
                    if let (Some(id), Some(target)) = (id, target) {
                        targets.insert(id, target);
                    }
                },
                Event::Eof => break,
                _ => {},
            }
            buf.clear();
        }
    }

    Ok(match targets.get(relationship_id) {
        Some(target) if target.starts_with('/') => target.trim_start_matches('/').to_string(),
        Some(target) => format!("xl/{}", target),
        None => FALLBACK_SHEET_PART.to_string(),
    })
}

/// Parse the shared string table; rich-text runs are concatenated and
/// phonetic hints (`rPh`) dropped
fn parse_shared_strings<B: BufRead>(mut xml: Reader<B>) -> Result<Vec<String>> {
    let mut strings = Vec::new();
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    let mut in_phonetic = false;

    loop {
        match xml
            .read_event_into(&mut buf)
            .map_err(|e| malformed(SHARED_STRINGS_PART, e))?
        {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"rPh" => in_phonetic = true,
                b"t" => in_text = !in_phonetic,
                _ => {},
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Text(e) if in_text => {
                let text = e.unescape().map_err(|e| malformed(SHARED_STRINGS_PART, e))?;
                if let Some(s) = current.as_mut() {
                    s.push_str(&text);
                }
            },
            Event::CData(e) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&String::from_utf8_lossy(&e));
                }
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"rPh" => in_phonetic = false,
                b"t" => in_text = false,
                _ => {},
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    Ok(strings)
}

/// Date flag for every `cellXfs` entry, indexed by a cell's `s` attribute
#[derive(Debug)]
struct DateStyles {
    system: DateSystem,
    formats: Vec<bool>,
}

impl DateStyles {
    fn new(system: DateSystem) -> Self {
        Self {
            system,
            formats: Vec::new(),
        }
    }

    fn is_date(&self, style: Option<usize>) -> bool {
        style
            .and_then(|s| self.formats.get(s).copied())
            .unwrap_or(false)
    }
}

fn parse_styles<B: BufRead>(mut xml: Reader<B>, system: DateSystem) -> Result<DateStyles> {
    let mut custom: HashMap<u32, bool> = HashMap::new();
    let mut format_ids: Vec<u32> = Vec::new();
    let mut in_cell_xfs = false;
    let mut buf = Vec::new();

    let format_id = |e: &BytesStart<'_>| -> Result<Option<u32>> {
        Ok(attribute(e, b"numFmtId", STYLES_PART)?.and_then(|v| v.trim().parse().ok()))
    };

    loop {
        match xml.read_event_into(&mut buf).map_err(|e| malformed(STYLES_PART, e))? {
            Event::Start(e) if e.local_name().as_ref() == b"cellXfs" => in_cell_xfs = true,
            Event::End(e) if e.local_name().as_ref() == b"cellXfs" => in_cell_xfs = false,
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"numFmt" => {
                    let code = attribute(&e, b"formatCode", STYLES_PART)?;
                    if let (Some(id), Some(code)) = (format_id(&e)?, code) {
                        custom.insert(id, is_date_format(&code));
                    }
                },
                b"xf" if in_cell_xfs => format_ids.push(format_id(&e)?.unwrap_or(0)),
                _ => {},
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    let formats = format_ids
        .into_iter()
        .map(|id| {
            custom
                .get(&id)
                .copied()
                .unwrap_or_else(|| matches!(id, 14..=22 | 45..=47))
        })
        .collect();
    Ok(DateStyles { system, formats })
}

/// Whether a custom number format shows a date or time
///
/// Only the first section counts. Quoted text, escaped characters and
/// bracketed colours or locales are skipped; `[h]`, `[mm]` and `[ss]` are
/// elapsed-time tokens.
fn is_date_format(code: &str) -> bool {
    let section = code.split(';').next().unwrap_or_default();
    let mut chars = section.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                for quoted in chars.by_ref() {
                    if quoted == '"' {
                        break;
                    }
                }
            },
            '\\' | '_' | '*' => {
                chars.next();
            },
            '[' => {
                let inner: String = chars.by_ref().take_while(|&b| b != ']').collect();
                if !inner.is_empty()
                    && inner
                        .chars()
                        .all(|b| matches!(b.to_ascii_lowercase(), 'h' | 'm' | 's'))
                {
                    return true;
                }
            },
            _ if matches!(c.to_ascii_lowercase(), 'd' | 'm' | 'y' | 'h' | 's') => return true,
            _ => {},
        }
    }
    false
}

/// Render a serial day number as an ISO date, datetime or time of day
///
/// `None` when the value is not a number the workbook could hold as a date.
fn format_serial(value: &str, system: DateSystem) -> Option<String> {
    let serial: f64 = value.trim().parse().ok()?;
    if !serial.is_finite() || !(0.0..=MAX_SERIAL).contains(&serial) {
        return None;
    }
    let seconds = (serial * 86_400.0).round() as i64;

    if serial < 1.0 {
        let time = NaiveTime::from_num_seconds_from_midnight_opt((seconds % 86_400) as u32, 0)?;
        return Some(time.format("%H:%M:%S").to_string());
    }

    // 1900 serials count a 29 February that never happened
    let (year, month, day) = match system {
        DateSystem::Epoch1900 if serial < 60.0 => (1899, 12, 31),
        DateSystem::Epoch1900 => (1899, 12, 30),
        DateSystem::Epoch1904 => (1904, 1, 1),
    };
    let epoch = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
    let at = epoch.checked_add_signed(Duration::seconds(seconds))?;

    Some(if seconds % 86_400 == 0 {
        at.format("%Y-%m-%d").to_string()
    } else {
        at.format("%Y-%m-%d %H:%M:%S").to_string()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Number,
    Shared,
    Inline,
    FormulaString,
    Boolean,
    Error,
}

impl CellKind {
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("s") => CellKind::Shared,
            Some("inlineStr") => CellKind::Inline,
            Some("str") => CellKind::FormulaString,
            Some("b") => CellKind::Boolean,
            Some("e") => CellKind::Error,
            _ => CellKind::Number,
        }
    }
}

struct PendingCell {
    column: usize,
    kind: CellKind,
    style: Option<usize>,
    value: String,
}

impl PendingCell {
    fn open(start: &BytesStart<'_>, next_column: usize, part: &str) -> Result<Self> {
        let column = match attribute(start, b"r", part)? {
            Some(reference) => column_index(&reference).ok_or_else(|| {
                RelayError::conversion(format!("bad cell reference '{}' in {}", reference, part))
            })?,
            None if next_column < MAX_COLUMNS => next_column,
            None => {
                return Err(RelayError::conversion(format!(
                    "row in {} has more than {} cells",
                    part, MAX_COLUMNS
                )))
            },
        };
        let kind = CellKind::from_attr(attribute(start, b"t", part)?.as_deref());
        let style = attribute(start, b"s", part)?.and_then(|s| s.trim().parse().ok());
        Ok(Self {
            column,
            kind,
            style,
            value: String::new(),
        })
    }

    fn resolve(self, shared: &[String], dates: &DateStyles) -> Result<String> {
        match self.kind {
            CellKind::Shared => {
                if self.value.is_empty() {
                    return Ok(String::new());
                }
                let index: usize = self.value.trim().parse().map_err(|_| {
                    RelayError::conversion(format!("bad shared string index '{}'", self.value))
                })?;
                shared.get(index).cloned().ok_or_else(|| {
                    RelayError::conversion(format!(
                        "shared string {} out of range ({} strings)",
                        index,
                        shared.len()
                    ))
                })
            },
            CellKind::Boolean => Ok(match self.value.trim() {
                "1" => "TRUE".to_string(),
                "0" => "FALSE".to_string(),
                other => other.to_string(),
            }),
            CellKind::Number if dates.is_date(self.style) => {
                Ok(format_serial(&self.value, dates.system).unwrap_or(self.value))
            },
            CellKind::Number
            | CellKind::Inline
            | CellKind::FormulaString
            | CellKind::Error => Ok(self.value),
        }
    }
}

/// Zero-based column of an A1-style reference (`"AB12"` -> 27), `None`
/// past `XFD`
fn column_index(reference: &str) -> Option<usize> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    letters
        .iter()
        .try_fold(0usize, |acc, b| {
            acc.checked_mul(26)?
                .checked_add((b.to_ascii_uppercase() - b'A') as usize + 1)
        })
        .map(|n| n - 1)
        .filter(|&column| column < MAX_COLUMNS)
}

fn place(row: &mut Vec<String>, column: usize, value: String) {
    if row.len() <= column {
        row.resize(column + 1, String::new());
    }
    row[column] = value;
}

/// Pad `rows` with empty rows so the next pushed row lands at 1-based `number`
fn align_rows(rows: &mut Grid, number: Option<usize>) {
    if let Some(number) = number {
        while rows.len() + 1 < number {
            rows.push(Vec::new());
        }
    }
}

fn row_number(start: &BytesStart<'_>, part: &str) -> Result<Option<usize>> {
    let Some(number) = attribute(start, b"r", part)?.and_then(|r| r.trim().parse::<u64>().ok())
    else {
        return Ok(None);
    };
    match usize::try_from(number) {
        Ok(number) if (1..=MAX_ROWS).contains(&number) => Ok(Some(number)),
        _ => Err(RelayError::conversion(format!(
            "row number {} in {} is outside 1..={}",
            number, part, MAX_ROWS
        ))),
    }
}

/// Position the next row, refusing to grow past the sheet limit
fn open_row(rows: &mut Grid, start: &BytesStart<'_>, part: &str) -> Result<()> {
    align_rows(rows, row_number(start, part)?);
    if rows.len() >= MAX_ROWS {
        return Err(RelayError::conversion(format!(
            "{} has more than {} rows",
            part, MAX_ROWS
        )));
    }
    Ok(())
}

enum Capture {
    Nothing,
    Value,
    InlineText,
}

fn parse_sheet<B: BufRead>(
    mut xml: Reader<B>,
    shared: &[String],
    dates: &DateStyles,
) -> Result<Grid> {
    const PART: &str = "worksheet";

    let mut rows: Grid = Vec::new();
    let mut row: Option<Vec<String>> = None;
    let mut cell: Option<PendingCell> = None;
    let mut capture = Capture::Nothing;
    let mut in_phonetic = false;
    let mut buf = Vec::new();

    loop {
        match xml.read_event_into(&mut buf).map_err(|e| malformed(PART, e))? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => {
                    open_row(&mut rows, &e, PART)?;
                    row = Some(Vec::new());
                },
                b"c" => {
                    let next = row.as_ref().map_or(0, Vec::len);
                    cell = Some(PendingCell::open(&e, next, PART)?);
                },
                b"v" if cell.is_some() => capture = Capture::Value,
                b"t" if cell.is_some() && !in_phonetic => capture = Capture::InlineText,
                b"rPh" => in_phonetic = true,
                _ => {},
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"row" => {
                    open_row(&mut rows, &e, PART)?;
                    rows.push(Vec::new());
                },
                b"c" => {
                    if let Some(current) = row.as_mut() {
                        let pending = PendingCell::open(&e, current.len(), PART)?;
                        place(current, pending.column, String::new());
                    }
                },
                _ => {},
            },
            Event::Text(e) => {
                if let (Some(pending), Capture::Value | Capture::InlineText) =
                    (cell.as_mut(), &capture)
                {
                    let text = e.unescape().map_err(|e| malformed(PART, e))?;
                    pending.value.push_str(&text);
                }
            },
            Event::CData(e) => {
                if let (Some(pending), Capture::Value | Capture::InlineText) =
                    (cell.as_mut(), &capture)
                {
                    pending.value.push_str(&String::from_utf8_lossy(&e));
                }
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = Capture::Nothing,
                b"rPh" => in_phonetic = false,
                b"c" => {
                    if let (Some(pending), Some(current)) = (cell.take(), row.as_mut()) {
                        let column = pending.column;
                        let value = pending.resolve(shared, dates)?;
                        place(current, column, value);
                    }
                },
                b"row" => rows.extend(row.take()),
                _ => {},
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    Ok(rows)
}

/// Drop trailing blank rows and columns, then pad every row to the same width
fn squash(grid: &mut Grid) {
    let blank = |row: &Vec<String>| row.iter().all(|v| v.is_empty());
    while grid.last().is_some_and(blank) {
        grid.pop();
    }

    let width = grid
        .iter()
        .map(|row| row.iter().rposition(|v| !v.is_empty()).map_or(0, |i| i + 1))
        .max()
        .unwrap_or(0);

    for row in grid.iter_mut() {
        row.resize(width, String::new());
    }
}
