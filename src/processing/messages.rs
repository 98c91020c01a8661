use super::triggers::{SourceId, TriggerSourceRegistry, TriggerType};
use serde::Deserialize;

// REMOTE CONFIGURATION MESSAGES -----------------------------------------------
//
// Structured key-value payloads that reconfigure a trigger source by its
// numeric index. Everything is validated up front; a rejected message leaves
// the registry untouched.

/// Parsed remote configuration request.
///
/// `ttl_line` is 1-based on the wire (1-256) and stored 0-based;
/// `trigger_type` uses the numeric indices 1 = TTL, 2 = message,
/// 3 = TTL + message.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigMessage {
    pub source_index: usize,
    #[serde(default)]
    pub ttl_line: Option<u32>,
    #[serde(default)]
    pub trigger_type: Option<u8>,
    #[serde(default)]
    pub name: Option<String>,
}

pub fn parse_config_message(text: &str) -> Result<ConfigMessage, String> {
    serde_json::from_str(text).map_err(|e| format!("Malformed config message: {}", e))
}

/// Validates and applies a configuration message. On any rejection the
/// registry is left exactly as it was.
pub fn apply_config_message(
    registry: &mut TriggerSourceRegistry,
    message: &ConfigMessage,
) -> Result<(), String> {
    let source_id = resolve_source(registry, message.source_index)?;

    let line = match message.ttl_line {
        Some(line) if (1..=256).contains(&line) => Some(line as i32 - 1),
        Some(line) => {
            return Err(format!(
                "ttl_line {} out of range, expected 1-256",
                line
            ))
        }
        None => None,
    };

    let trigger_type = match message.trigger_type {
        Some(index) => Some(TriggerType::from_index(index).ok_or_else(|| {
            format!("trigger_type {} out of range, expected 1-3", index)
        })?),
        None => None,
    };

    let name = match &message.name {
        Some(name) if name.trim().is_empty() => {
            return Err("name must not be empty".to_string())
        }
        Some(name) => Some(registry.ensure_unique_name(name.trim(), Some(source_id))),
        None => None,
    };

    // All inputs are valid; apply them. The setters below cannot fail for a
    // resolved id.
    if let Some(line) = line {
        registry.set_line(source_id, line)?;
    }
    if let Some(trigger_type) = trigger_type {
        registry.set_type(source_id, trigger_type)?;
    }
    if let Some(name) = name {
        registry.set_name(source_id, &name)?;
    }

    Ok(())
}

fn resolve_source(
    registry: &TriggerSourceRegistry,
    source_index: usize,
) -> Result<SourceId, String> {
    registry
        .sources()
        .get(source_index)
        .map(|s| s.id)
        .ok_or_else(|| {
            format!(
                "source index {} out of range, {} sources configured",
                source_index,
                registry.sources().len()
            )
        })
}
