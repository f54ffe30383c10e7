use anyhow::Context;
use cloudevents::{AttributesReader, Event};
use futures::stream::StreamExt;
use paho_mqtt as mqtt;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone, Debug, serde::Deserialize)]
pub struct EventsConfig {
    /// Mqtt server uri (tcp://host:port)
    pub mqtt_uri: String,

    /// Topic to subscribe to
    pub topic: String,

    /// Mqtt group id for shared subscription
    #[serde(default)]
    pub mqtt_group_id: Option<String>,

    /// Only handle events of this type
    #[serde(default)]
    pub event_type: Option<String>,

    /// Extension attribute carrying the test case name, the subject is used when not set
    #[serde(default)]
    pub name_extension: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// Path to CA
    pub ca_path: Option<String>,

    /// Disable TLS
    #[serde(default)]
    pub disable_tls: bool,

    /// Ignore cert validation
    #[serde(default)]
    pub insecure_tls: bool,
}

impl EventsConfig {
    fn subscription(&self) -> String {
        match &self.mqtt_group_id {
            Some(group_id) => format!("$shared/{}/{}", group_id, self.topic),
            None => self.topic.clone(),
        }
    }
}

pub struct EventSource {
    client: mqtt::AsyncClient,
    config: EventsConfig,
}

impl EventSource {
    pub async fn connect(config: EventsConfig) -> anyhow::Result<Self> {
        let mqtt_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(config.mqtt_uri.clone())
            .client_id("stormforge-operator")
            .persistence(mqtt::PersistenceType::None)
            .finalize();
        let client = mqtt::AsyncClient::new(mqtt_opts)?;

        let mut conn_opts = mqtt::ConnectOptionsBuilder::new();
        if let Some(user) = &config.user {
            conn_opts.user_name(user.clone());
        }
        if let Some(token) = &config.token {
            conn_opts.password(token.clone());
        }
        conn_opts.keep_alive_interval(Duration::from_secs(30));
        conn_opts.automatic_reconnect(Duration::from_millis(100), Duration::from_secs(5));

        if !config.disable_tls {
            let ca = config
                .ca_path
                .clone()
                .unwrap_or_else(|| "/etc/ssl/certs/ca-bundle.crt".to_string());
            let ssl_opts = if config.insecure_tls {
                mqtt::SslOptionsBuilder::new()
                    .trust_store(&ca)?
                    .enable_server_cert_auth(false)
                    .verify(false)
                    .finalize()
            } else {
                mqtt::SslOptionsBuilder::new().trust_store(&ca)?.finalize()
            };
            conn_opts.ssl_options(ssl_opts);
        }

        let conn_opts = conn_opts.finalize();

        client.set_connection_lost_callback(|_| {
            log::warn!("Connection lost, reconnecting");
        });

        client
            .connect(conn_opts)
            .await
            .context("Failed to connect to MQTT endpoint")?;

        Ok(Self { client, config })
    }

    /// Forward the names of changed test cases, until the receiver is dropped.
    pub async fn run(mut self, triggers: mpsc::Sender<String>) -> anyhow::Result<()> {
        let mut stream = self.client.get_stream(100);
        let subscription = self.config.subscription();
        log::info!("Subscribing to: {subscription}");
        self.client
            .subscribe(subscription.clone(), 1)
            .await
            .context("Failed to subscribe")?;

        // the session is clean, subscriptions are gone after reconnecting
        self.client.set_connected_callback(move |c| {
            log::info!("Connected, subscribing to: {subscription}");
            drop(c.subscribe(subscription.clone(), 1));
        });

        while let Some(message) = stream.next().await {
            let message = match message {
                Some(message) => message,
                // disconnected, reconnecting
                None => continue,
            };

            let event = match serde_json::from_slice::<Event>(message.payload()) {
                Ok(event) => event,
                Err(err) => {
                    log::info!("Skipping message which is not a cloud event: {err}");
                    continue;
                }
            };

            if let Some(name) = test_case_name(&self.config, &event) {
                if triggers.send(name).await.is_err() {
                    break;
                }
            }
        }

        Ok(())
    }
}

/// The name of the test case an event refers to, if it is relevant.
fn test_case_name(config: &EventsConfig, event: &Event) -> Option<String> {
    if let Some(ty) = &config.event_type {
        if event.ty() != ty.as_str() {
            return None;
        }
    }

    match &config.name_extension {
        Some(extension) => event.extension(extension).map(|e| e.to_string()),
        None => event.subject().map(ToString::to_string),
    }
}
