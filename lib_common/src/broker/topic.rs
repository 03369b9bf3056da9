//! Conversions between Canary paths and MQTT topics.
//!
//! Canary separates path levels with `.`, MQTT with `/`.

/// `Plant.Area.Tank1` → `Plant/Area/Tank1`.
pub fn from_canary_path(path: &str) -> String {
    path.replace('.', "/")
}

/// `Plant/Area/Tank1` → `Plant.Area.Tank1`.
pub fn to_canary_path(topic: &str) -> String {
    topic.replace('/', ".")
}

/// Checks that `topic` is usable as a *publish* topic: non-empty, no
/// wildcards, no NUL characters and short enough for the length prefix.
pub fn validate_publish_topic(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("MQTT topic is empty".to_string());
    }
    if topic.contains(['+', '#']) {
        return Err(format!("MQTT topic '{}' contains wildcards", topic));
    }
    if topic.contains('\0') {
        return Err("MQTT topic contains a NUL character".to_string());
    }
    if topic.len() > u16::MAX as usize {
        return Err("MQTT topic is longer than 65535 bytes".to_string());
    }
    Ok(())
}
