//! Utility functions shared by the configuration and storage layers.
//!
//! - **Filename derivation**: deterministic cache file names from feed URLs
//! - **URL validation**: sanity checks for configured feed sources

mod filename;
mod url_validator;

pub use filename::{
    cache_file_name, cache_path, legacy_file_name, lock_path, LOCK_SUFFIX, TEMP_INFIX,
};
pub use url_validator::{validate_feed_url, UrlValidationError};
