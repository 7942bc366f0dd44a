//! Allow-list resolution from process configuration.
//!
//! Kept outside the guard: the result is a plain list of hostnames handed to
//! [`AgentOptions::allow_list`](crate::AgentOptions::allow_list).

/// Preferred variable name.
pub const ALLOW_LIST_VAR: &str = "EXTERNAL_YAML_URL_ALLOW_LIST";

/// Legacy name, honored when [`ALLOW_LIST_VAR`] is not set.
pub const LEGACY_ALLOW_LIST_VAR: &str = "EXTERNAL_YAML_URL_WHITE_LIST";

/// Read the allow list from the environment. `None` when neither variable is set.
pub fn allow_list_from_env() -> Option<Vec<String>> {
    allow_list_from(|name| std::env::var(name).ok())
}

/// Read the allow list through `lookup` (variable name to value).
pub fn allow_list_from<F>(lookup: F) -> Option<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let (name, raw) = [ALLOW_LIST_VAR, LEGACY_ALLOW_LIST_VAR]
        .into_iter()
        .find_map(|name| lookup(name).map(|value| (name, value)))?;
    let domains = parse_allow_list(&raw);
    tracing::debug!(source = name, count = domains.len(), "loaded allow list");
    Some(domains)
}

/// Parse a JSON array of strings (`["a.com","b.com"]`) or a comma-separated list.
///
/// Entries are trimmed but otherwise kept verbatim; matching is exact.
pub fn parse_allow_list(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        if let Ok(domains) = serde_json::from_str::<Vec<String>>(raw) {
            return domains;
        }
    }

    raw.trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|entry| entry.trim().trim_matches(|c| c == '"' || c == '\''))
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}
