//! Topic names and MQTT-style wildcard matching.

/// Root segment shared by every topic in the system.
pub const ROOT: &str = "presence";

/// Keepalive ping topic. Payload is ignored by consumers.
pub const PING_TOPIC: &str = "presence/system/ping";

/// Derived notifications published by the hub after applying an update.
pub const NOTIFICATIONS_TOPIC: &str = "presence/system/notifications";

/// Pattern matching every subject's structured status topic.
pub const STATUS_PATTERN: &str = "presence/+/status";

/// Subject id reserved for system topics.
const RESERVED_SUBJECT: &str = "system";

/// `presence/{S}/status`
pub fn status_topic(subject_id: &str) -> String {
    format!("{ROOT}/{subject_id}/status")
}

/// `presence/{S}/status.legacy`
pub fn legacy_status_topic(subject_id: &str) -> String {
    format!("{ROOT}/{subject_id}/status.legacy")
}

/// Extract the subject id from `presence/<S>/status`.
pub fn parse_status_topic(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3
        && parts[0] == ROOT
        && parts[2] == "status"
        && !parts[1].is_empty()
        && parts[1] != RESERVED_SUBJECT
    {
        Some(parts[1])
    } else {
        None
    }
}

/// A subject id must be a single, non-empty, wildcard-free topic level.
pub fn is_valid_subject_id(subject_id: &str) -> bool {
    !subject_id.is_empty()
        && subject_id != RESERVED_SUBJECT
        && !subject_id.contains(['/', '+', '#'])
        && !subject_id.chars().any(char::is_whitespace)
}

/// True if a concrete publish topic is acceptable (non-empty, no wildcards).
pub fn is_valid_publish_topic(topic: &str) -> bool {
    !topic.trim().is_empty() && !topic.contains(['+', '#'])
}

/// MQTT wildcard match: `+` matches exactly one level, a trailing `#`
/// matches the parent level and everything below it.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if !pattern.contains(['+', '#']) {
        return pattern == topic;
    }

    let mut pat = pattern.split('/');
    let mut top = topic.split('/');

    loop {
        match (pat.next(), top.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
