use std::time::Duration;

/// How long the probe waits for the bridge to answer
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Build the URL the liveness probe hits
pub fn health_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/", port)
}

/// Probe a locally running bridge.
///
/// Any HTTP answer counts as alive; only connection failures and timeouts
/// fail the probe. Nothing is printed so container health checks stay quiet.
pub async fn run(port: u16) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(HEALTH_CHECK_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };

    client.get(health_url(port)).send().await.is_ok()
}
