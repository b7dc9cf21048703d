use std::collections::HashMap;

use regex_lite::Regex;

use crate::error::{MilepostError, Result};

/// Replace all `${key}` placeholders in the given script body.
///
/// Lookup is case-insensitive. If a placeholder key is not found in the map,
/// an error is returned listing available placeholders.
pub fn replace_placeholders(body: &str, placeholders: &HashMap<String, String>) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}").unwrap();

    // Build a lowercase lookup map
    let lower_map: HashMap<String, &String> = placeholders
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();

    let mut result = String::with_capacity(body.len());
    let mut last_end = 0;

    for caps in re.captures_iter(body) {
        let full_match = caps.get(0).unwrap();
        let key = caps.get(1).unwrap().as_str();
        let key_lower = key.to_lowercase();

        result.push_str(&body[last_end..full_match.start()]);

        if let Some(value) = lower_map.get(&key_lower) {
            result.push_str(value);
        } else {
            let mut available: Vec<&str> = placeholders.keys().map(|k| k.as_str()).collect();
            available.sort();
            return Err(MilepostError::InvalidConfig(format!(
                "placeholder '{}' not found; available placeholders: {}",
                key,
                if available.is_empty() {
                    "(none)".to_string()
                } else {
                    available.join(", ")
                }
            )));
        }

        last_end = full_match.end();
    }

    result.push_str(&body[last_end..]);
    Ok(result)
}

/// Build the full placeholder map including built-in milepost placeholders.
pub fn build_placeholders(
    user_placeholders: &HashMap<String, String>,
    table: &str,
    user: &str,
    filename: &str,
) -> HashMap<String, String> {
    let mut map = user_placeholders.clone();

    map.insert("milepost:table".to_string(), table.to_string());
    map.insert("milepost:user".to_string(), user.to_string());
    map.insert(
        "milepost:timestamp".to_string(),
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    );
    map.insert("milepost:filename".to_string(), filename.to_string());

    map
}
