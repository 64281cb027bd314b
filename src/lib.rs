//! WebPub Server Library
//!
//! Serves publications stored on local disk, S3, GCS or HTTP(S) as Readium Web
//! Publications. The binary in main.rs wires these modules together; the
//! library target exists so integration tests can build the router.
//!
//! # Modules
//!
//! - `auth`: token validators turning a URL token into a canonical path
//! - `client`: outbound HTTP client guarded against SSRF
//! - `storage`: canonical path parsing and per-scheme backends
//! - `cache`: bounded single-flight cache of opened publications
//! - `publication`: default engine for ZIP containers and PDF
//! - `routes`: axum handlers

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod publication;
pub mod routes;
pub mod state;
pub mod storage;
