//! In-memory data model: arrays, data sets, metadata and storage locations.
pub mod array;
pub mod dataset;
pub mod io;
pub mod location;
pub mod metadata;
