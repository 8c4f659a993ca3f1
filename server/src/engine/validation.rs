use crate::error::ChatError;

/// Maximum tag length.
pub const MAX_TAG_LENGTH: usize = 64;

/// Validate message text. Must be non-blank and at most `max_len` characters.
pub fn validate_message(text: &str, max_len: usize) -> Result<(), ChatError> {
    if text.trim().is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    if text.chars().count() > max_len {
        return Err(ChatError::MessageTooLong(max_len));
    }
    Ok(())
}

/// Validate a tag. Must be 1-64 chars with no whitespace or control chars.
pub fn validate_tag(tag: &str) -> Result<(), ChatError> {
    if tag.is_empty()
        || tag.len() > MAX_TAG_LENGTH
        || tag.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ChatError::TagDenied(tag.to_string()));
    }
    Ok(())
}
