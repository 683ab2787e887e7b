use std::time::Duration;

/// Shortest temporary directive a moderator may issue.
pub const MIN_DURATION: Duration = Duration::from_secs(2 * 60);

/// Longest temporary role persist.
pub const MAX_ROLE_PERSIST_DURATION: Duration = Duration::from_secs(60 * 60);

/// Longest temporary channel mute.
pub const MAX_CHANNEL_MUTE_DURATION: Duration = Duration::from_secs(60 * 60);

/// Longest jail.
pub const MAX_JAIL_DURATION: Duration = Duration::from_secs(4 * 60 * 60);

/// Validate a temporary duration against inclusive bounds.
pub fn validate_duration(duration: Duration, min: Duration, max: Duration) -> Result<(), String> {
    if duration < min {
        return Err(format!("Duration too short (min {})", format_duration(min)));
    }
    if duration > max {
        return Err(format!("Duration too long (max {})", format_duration(max)));
    }
    Ok(())
}

/// Human-readable duration, largest units first, e.g. `1 hour 30 minutes`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let parts = [
        (total / 86_400, "day"),
        (total % 86_400 / 3_600, "hour"),
        (total % 3_600 / 60, "minute"),
        (total % 60, "second"),
    ];

    let words: Vec<String> = parts
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| {
            if *n == 1 {
                format!("1 {unit}")
            } else {
                format!("{n} {unit}s")
            }
        })
        .collect();

    if words.is_empty() {
        "0 seconds".into()
    } else {
        words.join(" ")
    }
}

/// Fill the `{0}` placeholder of a preset message.
pub fn render_preset(template: &str, duration: Option<Duration>) -> String {
    match duration {
        Some(d) => template.replace("{0}", &format_duration(d)),
        None => template.replace("{0}", "indefinitely"),
    }
}
