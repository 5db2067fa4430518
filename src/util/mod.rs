//! Utility functions shared by the harvest pipeline and the feed writer.
//!
//! - **URL validation**: SSRF guards applied before following user-posted links
//! - **Text processing**: title cleanup and truncation

mod text;
mod url_validator;

pub use text::{clean_title, decode_entities, truncate_chars};
pub use url_validator::{canonical_address, check_public, validate_url, UrlValidationError};
