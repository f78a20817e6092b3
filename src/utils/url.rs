//! URL utilities for consistent URL handling
//!
//! This module provides utilities for normalizing URLs to prevent issues
//! with trailing slashes when constructing API endpoints, plus the
//! streamable-endpoint detection used by the MCP client.

/// Normalize a base URL by removing trailing slashes
///
/// This ensures consistent URL construction when appending endpoints,
/// preventing double slashes in the final URLs.
///
/// # Examples
///
/// ```
/// use scenario_chat::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://api.example.com/v1"), "https://api.example.com/v1");
/// assert_eq!(normalize_base_url("https://api.example.com/v1/"), "https://api.example.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete API endpoint URL from a base URL and endpoint path
///
/// # Examples
///
/// ```
/// use scenario_chat::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1/", "chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Returns true when a tool-server URL addresses a streamable MCP endpoint
/// (path ending in an `/mcp` segment, with or without a trailing slash).
pub fn is_streamable_endpoint(url: &str) -> bool {
    let trimmed = url.trim_end_matches('/');
    trimmed.to_ascii_lowercase().ends_with("/mcp")
}

/// Derives the streamable fallback URL a legacy endpoint retries against.
///
/// Appending the `/mcp` segment to an URL that already carries it returns the
/// normalized original, which callers use to detect that no fallback exists.
pub fn streamable_fallback_url(url: &str) -> String {
    let base = normalize_base_url(url);
    if is_streamable_endpoint(&base) {
        base
    } else {
        format!("{}/mcp", base)
    }
}
