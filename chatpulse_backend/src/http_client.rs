use anyhow::{Context, Result};
use std::time::Duration;

/// Builds the shared client used for model and embedding calls.
///
/// System proxy discovery is opt-in through `CHATPULSE_ENABLE_SYSTEM_PROXY`;
/// if it fails we fall back to a client without proxy support.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let allow_system_proxy = std::env::var("CHATPULSE_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(timeout, false) {
            Ok(client) => return Ok(client),
            Err(error) => tracing::warn!(
                "HTTP client initialization with system proxy discovery failed ({}); retrying with no_proxy",
                error
            ),
        }
    }

    attempt_build(timeout, true).context("Failed to initialize HTTP client")
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
