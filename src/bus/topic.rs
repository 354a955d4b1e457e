//! MQTT topic names and filters.
//!
//! Matching rules:
//! - `+` matches exactly one level
//! - `#` matches the remaining levels, including none (`a/#` matches `a`)
//! - Wildcards at the first level never match topics starting with `$`

/// Check a topic name used for publishing. Wildcards are not allowed.
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic must not be empty");
    }
    if topic.contains(['+', '#']) {
        return Err("wildcards are not allowed in a publish topic");
    }
    if topic.contains('\0') {
        return Err("topic must not contain NUL");
    }
    Ok(())
}

/// Check a topic filter used for subscribing.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter must not be empty");
    }
    if filter.contains('\0') {
        return Err("topic filter must not contain NUL");
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err("'#' must occupy the whole last level");
        }
        if level.contains('+') && *level != "+" {
            return Err("'+' must occupy a whole level");
        }
    }
    Ok(())
}

/// Check whether `topic` matches `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
