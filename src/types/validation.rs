//! Validation functions for topic, subscription and queue names.

use crate::error::ValidationError;
use crate::Result;

/// Minimum topic/subscription name length.
pub const MIN_NAME_LENGTH: usize = 3;

/// Maximum topic/subscription name length.
pub const MAX_NAME_LENGTH: usize = 255;

/// Names may not continue with this token right after the first character.
const RESERVED_PREFIX: &str = "oog";

/// Maximum task queue name length.
pub const MAX_QUEUE_NAME_LENGTH: usize = 100;

/// Whether `name` is a valid Pub/Sub topic or subscription name.
///
/// Names must:
/// - Be 3-255 characters
/// - Start with a lowercase letter
/// - Not start with `goog` (any first letter followed by `oog`)
/// - Contain only lowercase letters, digits, `-`, `_`, `.`, `~`, `+` and `%`
pub fn is_valid_name(name: &str) -> bool {
    if name.len() < MIN_NAME_LENGTH || name.len() > MAX_NAME_LENGTH {
        return false;
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if name[1..].starts_with(RESERVED_PREFIX) {
        return false;
    }

    chars.all(|ch| {
        ch.is_ascii_lowercase()
            || ch.is_ascii_digit()
            || matches!(ch, '-' | '_' | '.' | '~' | '+' | '%')
    })
}

/// Validate a topic or subscription name.
pub fn validate_resource_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidResourceName(name.to_string()).into())
    }
}

/// Task queue name validation (1-100 chars, ASCII letters, digits and hyphens).
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LENGTH {
        return Err(ValidationError::InvalidQueueName {
            name: name.to_string(),
            reason: format!(
                "must be 1-{} characters, got {}",
                MAX_QUEUE_NAME_LENGTH,
                name.len()
            ),
        }
        .into());
    }

    if let Some(ch) = name
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '-')
    {
        return Err(ValidationError::InvalidQueueName {
            name: name.to_string(),
            reason: format!("contains invalid character: '{}'", ch),
        }
        .into());
    }

    Ok(())
}

/// Validate a decoded payload size against an optional limit.
pub fn validate_message_size(size: usize, max_size: Option<usize>) -> Result<()> {
    match max_size {
        Some(max) if size > max => Err(ValidationError::MessageTooLarge { size, max }.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("abc"));
        assert!(is_valid_name("my-topic"));
        assert!(is_valid_name("my_topic_123"));
        assert!(is_valid_name("a.b~c+d%e"));
        assert!(is_valid_name("gogo"));
        assert!(is_valid_name("aoo"));
        assert!(is_valid_name(&"a".repeat(255)));
    }

    #[test]
    fn test_invalid_first_character() {
        assert!(!is_valid_name("123topic"));
        assert!(!is_valid_name("_topic"));
        assert!(!is_valid_name("Topic"));
        assert!(!is_valid_name("-topic"));
    }

    #[test]
    fn test_reserved_prefix() {
        assert!(!is_valid_name("google-topic"));
        assert!(!is_valid_name("goog"));
        assert!(!is_valid_name("xoog-anything"));
    }

    #[test]
    fn test_length_bounds() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("ab"));
        assert!(!is_valid_name(&"a".repeat(256)));
    }

    #[test]
    fn test_disallowed_characters() {
        assert!(!is_valid_name("my topic"));
        assert!(!is_valid_name("my/topic"));
        assert!(!is_valid_name("my@topic"));
        assert!(!is_valid_name("myTopic"));
        assert!(!is_valid_name("topicé"));
    }

    #[test]
    fn test_validate_resource_name_message() {
        let err = validate_resource_name("Bad").unwrap_err();
        assert!(err
            .to_string()
            .contains("https://cloud.google.com/pubsub/docs/admin#resource_names"));
    }

    #[test]
    fn test_queue_name_validation() {
        assert!(validate_queue_name("mail-queue").is_ok());
        assert!(validate_queue_name("Queue1").is_ok());
        assert!(validate_queue_name(&"q".repeat(100)).is_ok());

        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name(&"q".repeat(101)).is_err());
        assert!(validate_queue_name("mail_queue").is_err());
        assert!(validate_queue_name("mail queue").is_err());
    }

    #[test]
    fn test_message_size_validation() {
        assert!(validate_message_size(1024, None).is_ok());
        assert!(validate_message_size(1024, Some(1024)).is_ok());
        assert!(validate_message_size(1025, Some(1024)).is_err());
    }
}
