//! Incremental face identity indexing for photo folders.
//!
//! Images are scanned, faces are detected and embedded on a worker pool, and
//! each embedding is resolved to a stable identity through a flat
//! nearest-neighbour [`index`]. Occurrences of identities in images are kept
//! in a SQLite [`db`] that answers membership queries and merges identities.

pub mod config;
pub mod db;
pub mod faces;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod scanner;
