//! Load stage: rebuild the target table from the staged object
//!
//! The load is four independent statements with no transaction around them.
//! A failure after `TRUNCATE` leaves the table empty.

use docrelay_common::{RelayError, Result};
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, instrument, warn};

use crate::config::WarehouseConfig;
use crate::warehouse::Warehouse;

/// Unqualified name of the target table.
pub const TARGET_TABLE: &str = "SHAREPOINT_FILE";

/// Declared columns of the target table, all `VARCHAR`.
pub const TARGET_COLUMNS: [&str; 3] = ["COLUMN_1", "COLUMN_2", "COLUMN_3"];

/// What to do when the copy projection does not fit the declared columns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchemaCheck {
    /// Refuse to run any load statement
    #[default]
    Enforce,
    /// Log the mismatch and let the database decide
    Warn,
}

impl FromStr for SchemaCheck {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "enforce" => Ok(SchemaCheck::Enforce),
            "warn" => Ok(SchemaCheck::Warn),
            other => Err(RelayError::config(format!(
                "SNOWFLAKE_SCHEMA_CHECK must be 'enforce' or 'warn', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SchemaCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaCheck::Enforce => write!(f, "enforce"),
            SchemaCheck::Warn => write!(f, "warn"),
        }
    }
}

/// The ordered statements that reload the target table from one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    /// Fully qualified `<db>.<schema>.SHAREPOINT_FILE`
    pub table: String,
    pub create_table: String,
    pub use_warehouse: String,
    pub truncate: String,
    pub copy: String,
    /// Items selected from the staged file by `copy`
    pub projection: Vec<String>,
}

impl LoadPlan {
    pub fn new(config: &WarehouseConfig, bucket: &str, object_path: &str) -> Self {
        let table = format!("{}.{}.{}", config.database, config.schema, TARGET_TABLE);
        let columns = TARGET_COLUMNS.join(", ");
        let column_defs = TARGET_COLUMNS
            .iter()
            .map(|c| format!("{} VARCHAR", c))
            .collect::<Vec<_>>()
            .join(", ");

        let projection = vec![
            "t.$1".to_string(),
            "t.$2".to_string(),
            "t.$3".to_string(),
            format!("'s3://{}/' || metadata$filename", bucket),
            "metadata$file_row_number".to_string(),
        ];

        let copy = format!(
            "COPY INTO {table}({columns}) FROM (SELECT {select} FROM @\"{stage}\".\"{path}\" \
             FILE_FORMAT = (FORMAT_NAME = '{format}', PATTERN = '.*{path}')) AS t;",
            table = table,
            columns = columns,
            select = projection.join(", "),
            stage = config.stage,
            path = object_path,
            format = config.file_format,
        );

        Self {
            create_table: format!("CREATE TABLE IF NOT EXISTS {} ({});", table, column_defs),
            use_warehouse: format!("USE WAREHOUSE {};", config.warehouse),
            truncate: format!("TRUNCATE TABLE {};", table),
            copy,
            projection,
            table,
        }
    }

    /// Statements in execution order
    pub fn statements(&self) -> [&str; 4] {
        [
            self.create_table.as_str(),
            self.use_warehouse.as_str(),
            self.truncate.as_str(),
            self.copy.as_str(),
        ]
    }

    /// `SchemaMismatch` when the copy selects a different number of values
    /// than the table declares
    pub fn check_schema(&self) -> Result<()> {
        let declared = TARGET_COLUMNS.len();
        let projected = self.projection.len();
        if declared == projected {
            return Ok(());
        }
        Err(RelayError::SchemaMismatch {
            table: self.table.clone(),
            declared,
            projected,
        })
    }
}

/// Execute `plan` against `warehouse`, one statement at a time
#[instrument(skip(warehouse, plan), fields(table = %plan.table))]
pub async fn load(warehouse: &dyn Warehouse, plan: &LoadPlan, policy: SchemaCheck) -> Result<()> {
    if let Err(mismatch) = plan.check_schema() {
        match policy {
            SchemaCheck::Enforce => {
                error!(error = %mismatch, "Refusing to load");
                return Err(mismatch);
            },
            SchemaCheck::Warn => warn!(error = %mismatch, "Loading despite schema mismatch"),
        }
    }

    for (step, sql) in plan.statements().into_iter().enumerate() {
        info!(step = step + 1, "{}", sql);
        if let Err(e) = warehouse.execute(sql).await {
            error!(step = step + 1, error = %e, "Error ingesting data into Snowflake");
            return Err(e);
        }
    }

    info!("Load complete");
    Ok(())
}
