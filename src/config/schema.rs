//! Session schema resolution.

use super::settings::SchemaConfig;

/// Pick the schema for the per-connection `search_path`.
///
/// Priority: explicit override, rotating-credential schema, username-derived schema
/// (rotating credentials, then local development), fixed default.
pub fn resolve_schema(config: &SchemaConfig, username: Option<&str>, rotating: bool) -> String {
    if let Some(schema) = non_blank(config.schema_override.as_deref()) {
        return schema.to_string();
    }
    if let Some(schema) = non_blank(config.rotating_schema.as_deref()) {
        return schema.to_string();
    }
    if (rotating || config.local_dev)
        && let Some(derived) = username.and_then(|u| derive_from_username(u, &config.namespace_prefix))
    {
        return derived;
    }
    config.default_schema.clone()
}

/// `jane.doe@example.com` with prefix `app_` becomes `app_jane_doe`.
pub fn derive_from_username(username: &str, prefix: &str) -> Option<String> {
    let local = username.split('@').next().unwrap_or_default();
    let sanitized: String = local
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches('_');
    if sanitized.is_empty() {
        return None;
    }
    Some(format!("{}{}", prefix, sanitized))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
