pub mod action;
pub mod entity;
pub mod intent;
pub mod session;

pub use action::*;
pub use entity::*;
pub use intent::*;
pub use session::*;

use crate::error::{ParleyError, Result};

pub const MAX_QUERY_LENGTH: usize = 2000;

/// Validate a raw chat query: non-empty and at most `max_chars` characters.
pub fn validate_query(text: &str, max_chars: usize) -> Result<()> {
    if text.trim().is_empty() {
        return Err(ParleyError::Validation("query cannot be empty".into()));
    }
    let chars = text.chars().count();
    if chars > max_chars {
        return Err(ParleyError::Validation(format!(
            "query exceeds maximum length of {max_chars} characters ({chars} given)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
