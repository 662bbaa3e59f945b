#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod catalog;
pub mod config;
pub mod download;
pub mod genotype_convert;
pub mod harmonize;
pub mod kit_store;
pub mod pipeline;
pub mod reformat;
pub mod remap;
pub mod results;
pub mod scorer;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod stats;
pub mod tool;
pub mod types;
pub mod shared {
    pub use super::shared_files as files;
}
