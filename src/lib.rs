pub mod config;
pub mod dataset;
pub mod error;
pub mod geometry;
pub mod inference;
pub mod io;
