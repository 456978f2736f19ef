//! Shared test doubles for pipeline tests
//!
//! A [`World`] holds the state of every external system a run touches: the
//! remote document library, the secret store, the object store and a
//! simulated warehouse table. The doubles are thin handles onto one world so
//! tests can assert on what happened everywhere after a run.
//!
//! The simulated warehouse understands the four load statements. `COPY INTO`
//! reads the staged CSV (header skipped) and keeps the first three values of
//! each record.

#![allow(dead_code)]

use async_trait::async_trait;
use docrelay_common::{RelayError, Result};
use docrelay_ingest::config::{
    JobConfig, WarehouseConfig, DEFAULT_SHAREPOINT_SECRET_NAME, DEFAULT_SNOWFLAKE_SECRET_NAME,
};
use docrelay_ingest::loader::TARGET_COLUMNS;
use docrelay_ingest::pipeline::Pipeline;
use docrelay_ingest::secrets::{
    SecretFields, SecretStore, SharePointCredentials, WarehouseCredentials,
};
use docrelay_ingest::sharepoint::{DocumentRepository, DocumentSession};
use docrelay_ingest::storage::ObjectStore;
use docrelay_ingest::warehouse::{Warehouse, WarehouseConnector};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const FOLDER: &str = "/sites/marketing/Shared Documents";

#[derive(Default)]
pub struct World {
    pub remote_files: Mutex<HashMap<String, Vec<u8>>>,
    pub secrets: Mutex<HashMap<String, SecretFields>>,
    pub reject_credentials: AtomicBool,
    pub fail_upload: AtomicBool,
    pub fail_copy: AtomicBool,
    pub downloads: Mutex<Vec<String>>,
    /// `bucket/key` -> content
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
    pub statements: Mutex<Vec<String>>,
    /// `None` until created
    pub table: Mutex<Option<Vec<Vec<String>>>>,
}

impl World {
    pub fn new() -> Arc<Self> {
        let world = World::default();
        world.set_secret(
            DEFAULT_SHAREPOINT_SECRET_NAME,
            &[("client_id", "app-id"), ("client_secret", "app-secret")],
        );
        world.set_secret(
            DEFAULT_SNOWFLAKE_SECRET_NAME,
            &[("account", "org-acct"), ("token", "t0k")],
        );
        Arc::new(world)
    }

    pub fn set_secret(&self, name: &str, fields: &[(&str, &str)]) {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.secrets.lock().unwrap().insert(name.to_string(), fields);
    }

    pub fn put_remote(&self, file_name: &str, content: Vec<u8>) {
        self.remote_files
            .lock()
            .unwrap()
            .insert(format!("{}/{}", FOLDER, file_name), content);
    }

    pub fn seed_table(&self, rows: &[&[&str]]) {
        *self.table.lock().unwrap() = Some(to_rows(rows));
    }

    pub fn table_rows(&self) -> Option<Vec<Vec<String>>> {
        self.table.lock().unwrap().clone()
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn executed(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn pipeline(self: &Arc<Self>) -> Pipeline {
        Pipeline::new(
            Arc::new(MemorySecrets(self.clone())),
            Arc::new(MemoryRepository(self.clone())),
            Arc::new(MemoryStore(self.clone())),
            Arc::new(SimulatedConnector(self.clone())),
        )
    }
}

pub fn to_rows(rows: &[&[&str]]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|r| r.iter().map(|v| v.to_string()).collect())
        .collect()
}

/// Configuration for a run with `file_name` staged under `work_dir`
pub fn job_config(file_name: &str, work_dir: &Path, extra: &[(&str, &str)]) -> JobConfig {
    let mut vars: HashMap<String, String> = [
        ("SHAREPOINT_FILE_NAME", file_name),
        ("SHAREPOINT_SITE_URL", "https://contoso.sharepoint.com/sites/marketing"),
        ("SHAREPOINT_FOLDER", FOLDER),
        ("S3_BUCKET", "b"),
        ("SNOWFLAKE_DATABASE", "ANALYTICS"),
        ("SNOWFLAKE_WAREHOUSE", "LOAD_WH"),
        ("SNOWFLAKE_STAGE", "SHAREPOINT_STAGE"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert("WORK_DIR".to_string(), work_dir.display().to_string());
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    JobConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

// ============================================================================
// Doubles
// ============================================================================

pub struct MemorySecrets(pub Arc<World>);

#[async_trait]
impl SecretStore for MemorySecrets {
    async fn get(&self, name: &str) -> Result<SecretFields> {
        self.0
            .secrets
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::Secret(format!("secret '{}' not found", name)))
    }
}

pub struct MemoryRepository(pub Arc<World>);

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn authenticate(
        &self,
        _site_url: &str,
        credentials: &SharePointCredentials,
    ) -> Result<Box<dyn DocumentSession>> {
        if self.0.reject_credentials.load(Ordering::SeqCst) {
            return Err(RelayError::Authentication(format!(
                "client {} rejected",
                credentials.client_id
            )));
        }
        Ok(Box::new(MemorySession(self.0.clone())))
    }
}

struct MemorySession(Arc<World>);

#[async_trait]
impl DocumentSession for MemorySession {
    async fn download(&self, remote_path: &str) -> Result<Vec<u8>> {
        self.0.downloads.lock().unwrap().push(remote_path.to_string());
        self.0
            .remote_files
            .lock()
            .unwrap()
            .get(remote_path)
            .cloned()
            .ok_or_else(|| RelayError::RemoteFileNotFound(remote_path.to_string()))
    }
}

pub struct MemoryStore(pub Arc<World>);

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn upload_file(&self, local_path: &Path, bucket: &str, key: &str) -> Result<()> {
        if self.0.fail_upload.load(Ordering::SeqCst) {
            return Err(RelayError::Upload(format!("bucket {} unreachable", bucket)));
        }
        let content = std::fs::read(local_path)?;
        self.0
            .objects
            .lock()
            .unwrap()
            .insert(format!("{}/{}", bucket, key), content);
        Ok(())
    }
}

pub struct SimulatedConnector(pub Arc<World>);

#[async_trait]
impl WarehouseConnector for SimulatedConnector {
    async fn connect(
        &self,
        _credentials: &WarehouseCredentials,
        _config: &WarehouseConfig,
    ) -> Result<Box<dyn Warehouse>> {
        Ok(Box::new(SimulatedWarehouse(self.0.clone())))
    }
}

struct SimulatedWarehouse(Arc<World>);

#[async_trait]
impl Warehouse for SimulatedWarehouse {
    async fn execute(&self, sql: &str) -> Result<()> {
        let world = &self.0;
        world.statements.lock().unwrap().push(sql.to_string());

        if sql.starts_with("CREATE TABLE IF NOT EXISTS") {
            world.table.lock().unwrap().get_or_insert_with(Vec::new);
        } else if sql.starts_with("TRUNCATE TABLE") {
            match world.table.lock().unwrap().as_mut() {
                Some(rows) => rows.clear(),
                None => return Err(RelayError::statement("table does not exist")),
            }
        } else if sql.starts_with("COPY INTO") {
            if world.fail_copy.load(Ordering::SeqCst) {
                return Err(RelayError::Statement {
                    message: "Insert value list does not match column list".to_string(),
                    sql_state: Some("21S01".to_string()),
                });
            }
            let rows = copy_rows(world, sql)?;
            match world.table.lock().unwrap().as_mut() {
                Some(table) => table.extend(rows),
                None => return Err(RelayError::statement("table does not exist")),
            }
        }
        Ok(())
    }
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let rest = &text[from..];
    Some(&rest[..rest.find(end)?])
}

fn copy_rows(world: &World, sql: &str) -> Result<Vec<Vec<String>>> {
    let bucket = between(sql, "'s3://", "/'").ok_or_else(|| RelayError::statement("no bucket"))?;
    let path =
        between(sql, "PATTERN = '.*", "'").ok_or_else(|| RelayError::statement("no pattern"))?;

    let objects = world.objects.lock().unwrap();
    let content = objects
        .get(&format!("{}/{}", bucket, path))
        .ok_or_else(|| RelayError::statement(format!("no files match {}", path)))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_slice());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| RelayError::statement(e.to_string()))?;
        let mut row: Vec<String> = record
            .iter()
            .take(TARGET_COLUMNS.len())
            .map(str::to_string)
            .collect();
        row.resize(TARGET_COLUMNS.len(), String::new());
        rows.push(row);
    }
    Ok(rows)
}

// ============================================================================
// Fixtures
// ============================================================================

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap()
}

/// Minimal single-sheet workbook; numeric-looking values are stored as numbers,
/// everything else through the shared string table
pub fn xlsx_bytes(rows: &[&[&str]]) -> Vec<u8> {
    let mut shared: Vec<String> = Vec::new();
    let mut sheet = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );

    for (r, row) in rows.iter().enumerate() {
        sheet.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, value) in row.iter().enumerate() {
            let reference = format!("{}{}", column_letter(c), r + 1);
            if value.is_empty() {
                continue;
            }
            if value.parse::<f64>().is_ok() {
                sheet.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, reference, value));
            } else {
                let index = shared.iter().position(|s| s == value).unwrap_or_else(|| {
                    shared.push(value.to_string());
                    shared.len() - 1
                });
                sheet.push_str(&format!(r#"<c r="{}" t="s"><v>{}</v></c>"#, reference, index));
            }
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");

    let mut sst = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="{0}" uniqueCount="{0}">"#,
        shared.len()
    );
    for s in &shared {
        sst.push_str(&format!("<si><t xml:space=\"preserve\">{}</t></si>", escape(s)));
    }
    sst.push_str("</sst>");

    let workbook = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#;
    let rels = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in [
        ("xl/workbook.xml", workbook.to_string()),
        ("xl/_rels/workbook.xml.rels", rels.to_string()),
        ("xl/sharedStrings.xml", sst),
        ("xl/worksheets/sheet1.xml", sheet),
    ] {
        zip.start_file(name, zip::write::FileOptions::default()).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// The same rows as RFC 4180 CSV
pub fn csv_bytes(rows: &[&[&str]]) -> Vec<u8> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.write_record(*row).unwrap();
    }
    writer.into_inner().unwrap()
}
