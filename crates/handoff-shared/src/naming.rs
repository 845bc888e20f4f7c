//! # Message-Type Naming Helpers
//!
//! Canonical patterns: `channel.<provider>.<action>.v<n>`, `agent.<action>.v<n>`,
//! `system.<action>.v<n>`, `plugin.<domain>.<action>.v<n>`. Enforcement only
//! applies at these construction helpers — arbitrary strings are still
//! accepted at runtime for plugin extensibility, so `HandoffMessage` never
//! calls into this module on the dispatch path.

fn is_segment(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_version(s: &str) -> bool {
    let Some(rest) = s.strip_prefix('v') else {
        return false;
    };
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    !rest.starts_with('0')
}

/// Validate a fully-formed message type against one of the four canonical
/// dotted patterns.
pub fn is_canonical_message_type(message_type: &str) -> bool {
    let parts: Vec<&str> = message_type.split('.').collect();
    let Some((version, segments)) = parts.split_last() else {
        return false;
    };
    if !is_version(version) {
        return false;
    }
    match segments {
        [prefix, _action] if *prefix == "agent" || *prefix == "system" => {
            is_segment(segments[1])
        }
        [prefix, _provider, _action] if *prefix == "channel" => {
            is_segment(segments[1]) && is_segment(segments[2])
        }
        [prefix, _domain, _action] if *prefix == "plugin" => {
            is_segment(segments[1]) && is_segment(segments[2])
        }
        _ => false,
    }
}

pub fn channel_type(provider: &str, action: &str, version: u32) -> String {
    format!("channel.{provider}.{action}.v{version}")
}

pub fn agent_type(action: &str, version: u32) -> String {
    format!("agent.{action}.v{version}")
}

pub fn system_type(action: &str, version: u32) -> String {
    format!("system.{action}.v{version}")
}

pub fn plugin_type(domain: &str, action: &str, version: u32) -> String {
    format!("plugin.{domain}.{action}.v{version}")
}
