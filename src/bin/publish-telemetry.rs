//! Device simulator: publishes sample raw, sensor and vehicle logs
//!
//! ## Usage
//!
//! ```bash
//! # One round of all three classes for USV-01 against a local broker
//! publish-telemetry --vehicle USV-01
//!
//! # Ten rounds for two vehicles over TLS, one second apart
//! MQTT_USERNAME=device MQTT_PASSWORD=secret publish-telemetry \
//!   --broker-url mqtts://broker.example.com:8883 \
//!   --vehicle USV-01 --vehicle USV-02 --count 10 --interval-ms 1000
//! ```

use chrono::Utc;
use clap::Parser;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event};
use seano_ingest::config::MqttSection;
use seano_ingest::protocol::{MessageClass, DEFAULT_NAMESPACE};
use seano_ingest::transport::mqtt::configure_mqtt_options;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "publish-telemetry",
    about = "Publish simulated device telemetry for the ingestion pipeline"
)]
struct Args {
    /// Broker URL, mqtt:// or mqtts://
    #[arg(long, default_value = "mqtt://localhost:1883")]
    broker_url: String,

    /// Topic namespace (first topic segment)
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Vehicle code to publish for; repeat for several vehicles
    #[arg(long = "vehicle", default_value = "USV-01")]
    vehicles: Vec<String>,

    /// Sensor id carried by sensor_log messages
    #[arg(long, default_value_t = 1)]
    sensor_id: i64,

    /// Number of rounds to publish
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Delay between rounds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Environment variable holding the username
    #[arg(long, default_value = "MQTT_USERNAME")]
    username_env: String,

    /// Environment variable holding the password
    #[arg(long, default_value = "MQTT_PASSWORD")]
    password_env: String,
}

fn sensor_log(sensor_id: i64, round: u32) -> Value {
    json!({
        "sensor_id": sensor_id,
        "data": {
            "temperature": 25.5 + f64::from(round % 10) * 0.1,
            "humidity": 60.2,
            "timestamp": Utc::now().to_rfc3339(),
        }
    })
}

fn vehicle_log(index: usize, round: u32) -> Value {
    let offset = index as f64 * 0.03 + f64::from(round) * 0.0001;
    json!({
        "battery_voltage": 12.6 - f64::from(round % 20) * 0.01,
        "battery_current": 2.5,
        "rssi": -45 - (index as i64) * 7,
        "mode": if index % 2 == 0 { "AUTO" } else { "MANUAL" },
        "latitude": -6.2088 + offset,
        "longitude": 106.8456 + offset,
        "heading": (45.0 + f64::from(round) * 5.0) % 360.0,
        "armed": index % 2 == 0,
        "guided": index % 2 == 1,
        "system_status": "ACTIVE",
        "speed": 15.5,
    })
}

fn round_messages(args: &Args, round: u32) -> Vec<(String, Vec<u8>)> {
    let topic = |code: &str, class: MessageClass| format!("{}/{code}/{class}", args.namespace);
    let mut messages = Vec::new();

    for (index, code) in args.vehicles.iter().enumerate() {
        messages.push((
            topic(code, MessageClass::RawLog),
            format!("Raw log test message for {code} at {}", Utc::now()).into_bytes(),
        ));
        messages.push((
            topic(code, MessageClass::SensorLog),
            sensor_log(args.sensor_id, round).to_string().into_bytes(),
        ));
        messages.push((
            topic(code, MessageClass::VehicleLog),
            vehicle_log(index, round).to_string().into_bytes(),
        ));
    }
    messages
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let section = MqttSection {
        broker_url: args.broker_url.clone(),
        username_env: Some(args.username_env.clone()),
        password_env: Some(args.password_env.clone()),
        client_id_prefix: "publish-telemetry".to_string(),
        ..MqttSection::default()
    };
    let options = configure_mqtt_options(&section)?;
    let (client, mut event_loop) = AsyncClient::new(options, 64);

    let rounds: Vec<Vec<(String, Vec<u8>)>> =
        (0..args.count).map(|round| round_messages(&args, round)).collect();
    let expected: usize = rounds.iter().map(Vec::len).sum();
    let interval = Duration::from_millis(args.interval_ms);

    println!("Connecting to {}...", args.broker_url);

    let publisher = {
        let client = client.clone();
        tokio::spawn(async move {
            for (round, messages) in rounds.into_iter().enumerate() {
                if round > 0 {
                    tokio::time::sleep(interval).await;
                }
                for (topic, payload) in messages {
                    println!("Publishing {} bytes to {topic}", payload.len());
                    client
                        .publish(topic, QoS::AtLeastOnce, false, payload)
                        .await?;
                }
            }
            Ok::<_, rumqttc::v5::ClientError>(())
        })
    };

    let mut acked = 0;
    while acked < expected {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => println!("Connected"),
            Ok(Event::Incoming(Packet::PubAck(_))) => acked += 1,
            Ok(_) => {}
            Err(e) => {
                eprintln!("MQTT error: {e}");
                publisher.abort();
                return Err(e.into());
            }
        }
    }

    publisher.await??;
    client.disconnect().await?;
    println!("Published {expected} messages");
    Ok(())
}
