//! Utility modules
//!
//! - [`email`]: Email address validation and normalisation (RFC 5321)

pub mod email;

pub use email::{domain_of, local_part, normalize_address, validate_email};
