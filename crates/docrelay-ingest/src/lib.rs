//! docrelay ingest library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Moves one file from SharePoint to S3 and bulk-loads it into Snowflake.
//!
//! # Stages
//!
//! - **Fetch** ([`sharepoint`]): app-only authentication, download to local storage
//! - **Stage** ([`stager`]): `.xlsx` to `.csv` conversion ([`convert`]), upload ([`storage`])
//! - **Load** ([`loader`]): create, truncate and `COPY INTO` over the SQL API ([`warehouse`])
//!
//! [`pipeline::Pipeline`] runs them in order. Every external system sits behind
//! a trait so runs can be assembled from doubles.
//!
//! # Example
//!
//! ```no_run
//! use docrelay_ingest::{config::JobConfig, pipeline::Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = JobConfig::from_env()?;
//!     let pipeline = Pipeline::from_config(&config).await?;
//!     println!("{}", pipeline.run(&config).await?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod convert;
pub mod loader;
pub mod pipeline;
pub mod secrets;
pub mod sharepoint;
pub mod stager;
pub mod storage;
pub mod warehouse;
