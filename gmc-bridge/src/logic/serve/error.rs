use std::time::Duration;
use thiserror::Error;

/// Failure of a single publish towards the broker
#[derive(Debug, Error)]
pub enum PublishError {
    /// The client did not accept the publish before the deadline
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    /// The MQTT client rejected the request (event loop gone, queue closed)
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Startup failures that keep the bridge from serving
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("mqtt connect failed: {0}")]
    Connect(#[from] rumqttc::ConnectionError),

    #[error("mqtt broker refused connection: {0:?}")]
    Refused(rumqttc::ConnectReturnCode),

    #[error("mqtt connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}
