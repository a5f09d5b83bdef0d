//! Message-bus detection sink.
//!
//! Publishes detections to an MQTT broker:
//! - `<base>/available`: `online`/`offline`, retained, with a Last Will
//! - `<base>/plate`: the normalized plate string per match, retained
//! - `<base>/image`: the cropped plate JPEG per match, retained
//! - `<base>/detect`: the full detection JSON (plate images stripped)

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use std::sync::Mutex;
use std::time::Duration;

use super::PlateRecorder;
use crate::detect::DetectionResult;
use crate::frame::RawImage;
use crate::ingest::CaptureSource;

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";
const DEFAULT_BASE_TOPIC: &str = "plate-sentry";
const DEFAULT_CLIENT_ID: &str = "plate-sentry";

/// Broker connection settings.
#[derive(Clone, Debug)]
pub struct MqttRecorderConfig {
    pub url: String,
    pub base_topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttRecorderConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Clone, Debug)]
struct Endpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

/// Owns the broker client plus the thread driving its connection events.
struct MqttRuntime {
    client: Client,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttRuntime {
    fn new(client: Client, mut connection: Connection) -> Self {
        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        log::warn!("mqtt connection error: {}", e);
                        break;
                    }
                }
            }
        });
        Self {
            client,
            connection_handle: Some(handle),
        }
    }

    fn disconnect(mut self) {
        let _ = self.client.disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

/// MQTT detection sink. The broker session lives from `start` to `stop`.
pub struct MqttPlateRecorder {
    config: MqttRecorderConfig,
    endpoint: Endpoint,
    runtime: Mutex<Option<MqttRuntime>>,
}

impl MqttPlateRecorder {
    pub fn new(config: MqttRecorderConfig) -> Result<Self> {
        let endpoint = parse_endpoint(&config.url)?;
        Ok(Self {
            config,
            endpoint,
            runtime: Mutex::new(None),
        })
    }

    fn availability_topic(&self) -> String {
        format!("{}/available", self.config.base_topic)
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        let runtime = self.runtime.lock().expect("mqtt runtime lock");
        let runtime = runtime
            .as_ref()
            .ok_or_else(|| anyhow!("mqtt recorder is not started"))?;
        runtime
            .client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .with_context(|| format!("publish to {}", topic))?;
        Ok(())
    }
}

impl PlateRecorder for MqttPlateRecorder {
    fn kind(&self) -> &'static str {
        "mqtt"
    }

    fn start(&self) -> Result<()> {
        let mut guard = self.runtime.lock().expect("mqtt runtime lock");
        if guard.is_some() {
            return Ok(());
        }

        let mut options = MqttOptions::new(
            &self.config.client_id,
            &self.endpoint.host,
            self.endpoint.port,
        );
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = &self.config.username {
            options.set_credentials(user, self.config.password.as_deref().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            self.availability_topic(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        options.set_transport(if self.endpoint.use_tls {
            Transport::tls_with_default_config()
        } else {
            Transport::tcp()
        });

        let (client, connection) = Client::new(options, 10);
        *guard = Some(MqttRuntime::new(client, connection));
        drop(guard);

        self.publish(
            &self.availability_topic(),
            PAYLOAD_ONLINE.as_bytes().to_vec(),
            true,
        )?;
        log::info!(
            "mqtt recorder connected to {}:{} (base topic {})",
            self.endpoint.host,
            self.endpoint.port,
            self.config.base_topic
        );
        Ok(())
    }

    fn record(
        &self,
        detection: &DetectionResult,
        _source: &CaptureSource,
        _original: &RawImage,
        _filtered: &RawImage,
    ) -> Result<()> {
        let base = &self.config.base_topic;
        for plate in &detection.results {
            self.publish(
                &format!("{}/plate", base),
                plate.plate.clone().into_bytes(),
                true,
            )?;
            if let Some(jpeg) = &plate.jpeg {
                self.publish(&format!("{}/image", base), jpeg.clone(), true)?;
            }
        }
        // The detect payload serializes without the attached plate images;
        // those already went out on their own topic.
        let payload = serde_json::to_vec(detection)?;
        self.publish(&format!("{}/detect", base), payload, true)?;
        Ok(())
    }

    fn stop(&self) {
        let runtime = self.runtime.lock().expect("mqtt runtime lock").take();
        if let Some(runtime) = runtime {
            let _ = runtime.client.publish(
                self.availability_topic(),
                QoS::AtLeastOnce,
                true,
                PAYLOAD_OFFLINE.as_bytes().to_vec(),
            );
            runtime.disconnect();
        }
    }
}

fn parse_endpoint(addr: &str) -> Result<Endpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported mqtt scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing mqtt port in {}", addr))?;
    let port: u16 = port.parse().context("invalid mqtt port")?;
    if host.is_empty() {
        return Err(anyhow!("missing mqtt host in {}", addr));
    }
    Ok(Endpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Corner, PlateResult};

    #[test]
    fn endpoint_parsing_handles_schemes() -> Result<()> {
        let plain = parse_endpoint("mqtt://broker.local:1883")?;
        assert_eq!(plain.host, "broker.local");
        assert_eq!(plain.port, 1883);
        assert!(!plain.use_tls);

        let tls = parse_endpoint("mqtts://broker.local:8883")?;
        assert!(tls.use_tls);

        let bare = parse_endpoint("127.0.0.1:1883")?;
        assert_eq!(bare.host, "127.0.0.1");

        assert!(parse_endpoint("http://broker:1883").is_err());
        assert!(parse_endpoint("broker-without-port").is_err());
        Ok(())
    }

    #[test]
    fn detect_payload_strips_plate_images() -> Result<()> {
        let detection = DetectionResult {
            epoch_time: 1,
            img_width: 10,
            img_height: 10,
            results: vec![PlateResult {
                plate: "AAA111".to_string(),
                confidence: 90.0,
                processing_time_ms: 5.0,
                coordinates: [Corner::default(); 4],
                jpeg: Some(vec![0xFF, 0xD8, 0xFF, 0xD9]),
            }],
        };
        let payload = serde_json::to_string(&detection)?;
        assert!(payload.contains("AAA111"));
        assert!(!payload.contains("jpeg"));
        Ok(())
    }

    #[test]
    fn publishing_before_start_is_an_error() -> Result<()> {
        let recorder = MqttPlateRecorder::new(MqttRecorderConfig::new("mqtt://localhost:1883"))?;
        assert!(recorder
            .publish("plate-sentry/plate", b"X".to_vec(), false)
            .is_err());
        Ok(())
    }
}
