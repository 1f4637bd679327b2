// Library root
// -----------
// This crate exposes the Concentriq client as a library; the `concentriq`
// binary (`main.rs`) is a thin command line front end on top of it.
//
// Module responsibilities:
// - `config`: credentials file and `CONCENTRIQ_*` environment overrides.
// - `transport`: authenticated HTTP, response envelope, pagination.
// - `api`: typed operations per resource plus upload and annotation flows.
// - `models`: records, filters and pagination types.
// - `annotations`: GeoJSON <-> Concentriq annotation conversion.
// - `upload`: server-signed S3 multipart uploads.
// - `cli`, `ui`, `table`: argument grammar, command handlers, rendering.
pub mod annotations;
pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod table;
pub mod transport;
pub mod ui;
pub mod upload;

pub use api::ApiClient;
pub use error::{ApiError, Error, Result};
