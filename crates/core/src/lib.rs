//! Core crate for the pdfdesk document service.

pub mod archive;
pub mod config;
pub mod jobs;
pub mod logging;
pub mod operations;
pub mod preview;
pub mod runtime;
pub mod scripts;
pub mod server;
pub mod tools;
pub mod upload;
