//! Pure MQTT connection configuration
//!
//! Builds `MqttOptions` from the `[mqtt]` config section. Credentials are read
//! from the environment variables the section names, never from the file.

use crate::config::MqttSection;
use crate::transport::TransportError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Broker endpoint extracted from a `mqtt://` or `mqtts://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, TransportError> {
    let url =
        Url::parse(broker_url).map_err(|_| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;

    let use_tls = match url.scheme() {
        "mqtts" | "ssl" => true,
        "mqtt" | "tcp" => false,
        _ => return Err(TransportError::InvalidBrokerUrl(broker_url.to_string())),
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if use_tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

/// Unique client id per connection attempt so a stale session on the broker
/// never collides with the new one
pub fn generate_client_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// Resolve `(username, password)` from the environment variables named in config
pub fn resolve_credentials(config: &MqttSection) -> Option<(String, String)> {
    let username_env = config.username_env.as_ref()?;
    let username = std::env::var(username_env).ok()?;
    let password = config
        .password_env
        .as_ref()
        .and_then(|env_name| std::env::var(env_name).ok())
        .unwrap_or_default();
    Some((username, password))
}

pub fn configure_mqtt_options(config: &MqttSection) -> Result<MqttOptions, TransportError> {
    let endpoint = parse_broker_url(&config.broker_url)?;
    let client_id = generate_client_id(&config.client_id_prefix);
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host, endpoint.port);

    if endpoint.use_tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = resolve_credentials(config) {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_max_packet_size(Some(config.max_packet_size));
    // Subscriptions are re-issued on every connect.
    mqtt_options.set_clean_start(true);

    Ok(mqtt_options)
}
