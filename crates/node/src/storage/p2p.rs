//! Fetching content from the API servers of other nodes.

use std::time::Duration;

use rand::seq::SliceRandom;

/// Tries the known API servers in random order and returns the first
/// successful response. Individual failures only demote a server for this
/// call; the next source in the lookup chain is tried by the caller.
pub async fn request_hash(
    http: &reqwest::Client,
    api_servers: &[String],
    item_hash: &str,
    timeout: Duration,
) -> Option<Vec<u8>> {
    let mut servers: Vec<&String> = api_servers.iter().collect();
    servers.shuffle(&mut rand::thread_rng());

    for server in servers {
        let url = format!(
            "{}/api/v0/storage/raw/{item_hash}",
            server.trim_end_matches('/')
        );
        match http.get(&url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => match response.bytes().await {
                Ok(bytes) => return Some(bytes.to_vec()),
                Err(err) => {
                    tracing::debug!(%server, %err, "failed reading peer response body");
                }
            },
            Ok(response) => {
                tracing::debug!(%server, status = %response.status(), "peer miss");
            }
            Err(err) => {
                tracing::debug!(%server, %err, "peer request failed");
            }
        }
    }
    None
}
