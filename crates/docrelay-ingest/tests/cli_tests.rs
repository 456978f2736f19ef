//! Tests for the docrelay-ingest binary
//!
//! Only `plan` and configuration errors are exercised; `run` needs live services.

use assert_cmd::Command;
use predicates::prelude::*;

fn command() -> Command {
    let mut cmd = Command::cargo_bin("docrelay-ingest").unwrap();
    cmd.env_clear()
        .env("SHAREPOINT_FILE_NAME", "report.xlsx")
        .env("SHAREPOINT_SITE_URL", "https://contoso.sharepoint.com/sites/marketing")
        .env("SHAREPOINT_FOLDER", "/sites/marketing/Shared Documents")
        .env("S3_BUCKET", "b")
        .env("SNOWFLAKE_DATABASE", "ANALYTICS")
        .env("SNOWFLAKE_WAREHOUSE", "LOAD_WH")
        .env("SNOWFLAKE_STAGE", "SHAREPOINT_STAGE")
        .env("LOG_LEVEL", "warn");
    cmd
}

#[test]
fn test_plan_prints_load_statements() {
    command()
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "CREATE TABLE IF NOT EXISTS ANALYTICS.SCHEMA.SHAREPOINT_FILE",
        ))
        .stdout(predicate::str::contains("USE WAREHOUSE LOAD_WH;"))
        .stdout(predicate::str::contains("TRUNCATE TABLE ANALYTICS.SCHEMA.SHAREPOINT_FILE;"))
        .stdout(predicate::str::contains("PATTERN = '.*sharepoint/report.csv'"));
}

#[test]
fn test_plan_honours_prefix_and_schema() {
    command()
        .env("S3_PREFIX", "landing/marketing")
        .env("SNOWFLAKE_SCHEMA", "RAW")
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("ANALYTICS.RAW.SHAREPOINT_FILE"))
        .stdout(predicate::str::contains("\"landing/marketing/report.csv\""));
}

#[test]
fn test_missing_variable_fails() {
    command()
        .env_remove("SNOWFLAKE_STAGE")
        .arg("plan")
        .assert()
        .failure()
        .stderr(predicate::str::contains("SNOWFLAKE_STAGE"));
}

#[test]
fn test_subcommand_required() {
    command().assert().failure();
}

#[test]
fn test_invalid_log_level_fails() {
    command()
        .env("LOG_LEVEL", "loud")
        .arg("plan")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid log level: loud"));
}

#[test]
fn test_dotenv_log_settings_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".env"), "LOG_LEVEL=loud\n").unwrap();

    command()
        .current_dir(dir.path())
        .env_remove("LOG_LEVEL")
        .arg("plan")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid log level: loud"));
}
