//! The API endpoints URIs.
//!
//! For endpoints that take a parameter, e.g., '/api/connections/{connection_id}/sync', use [format_endpoint].

/// The route to check that the server is up.
pub const HEALTH: &str = "/api/health";
/// The route to trigger a manual sync of a bank connection.
pub const SYNC_CONNECTION: &str = "/api/connections/{connection_id}/sync";
/// The route to get the sync history of a bank connection.
pub const SYNC_HISTORY: &str = "/api/connections/{connection_id}/sync_history";

/// Replace the parameter in `endpoint_path` with `id`.
///
/// A parameter is a string that starts with a left brace, followed by
/// lowercase letters or underscores, and ends with a right brace.
/// For example, in the endpoint path '/connections/{connection_id}', '{connection_id}' is the parameter.
///
/// This function assumes that an endpoint path only contains ASCII characters
/// and a single parameter.
///
/// If no parameter is found in `endpoint_path`, the function returns the
/// the original `endpoint_path`.
pub fn format_endpoint(endpoint_path: &str, id: i64) -> String {
    let Some(param_start) = endpoint_path.find('{') else {
        return endpoint_path.to_string();
    };

    let param_end = endpoint_path[param_start..]
        .find('}')
        .map(|end| param_start + end + 1)
        .unwrap_or(endpoint_path.len());

    format!(
        "{}{}{}",
        &endpoint_path[..param_start],
        id,
        &endpoint_path[param_end..]
    )
}
