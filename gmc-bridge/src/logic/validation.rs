/// Parameter keys a GMC counter is allowed to send
pub const KNOWN_PARAMETERS: [&str; 5] = ["GID", "CPM", "ACPM", "uSV", "AID"];

/// Longest accepted `GID` / `AID` value
pub const MAX_ID_LENGTH: usize = 50;

/// True if `topic` only contains `[A-Za-z0-9/_-]` and is not empty.
///
/// Applied to a fully joined topic string, so `/` is allowed anywhere.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'_' | b'-'))
}

/// Case-sensitive membership check against [`KNOWN_PARAMETERS`].
pub fn is_known_parameter(key: &str) -> bool {
    KNOWN_PARAMETERS.contains(&key)
}

/// Validate a parameter value according to its key's type.
pub fn is_valid_value(key: &str, value: &str) -> bool {
    if value.is_empty() {
        return false;
    }

    match key {
        // text and numeric identifiers
        "GID" | "AID" => is_alphanumeric(value) && value.len() <= MAX_ID_LENGTH,
        "CPM" => is_digits(value),
        "ACPM" | "uSV" => is_decimal(value),
        _ => false,
    }
}

fn is_alphanumeric(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// `\d+(\.\d+)?` without a regex
fn is_decimal(value: &str) -> bool {
    match value.split_once('.') {
        Some((whole, fraction)) => is_digits(whole) && is_digits(fraction),
        None => is_digits(value),
    }
}
