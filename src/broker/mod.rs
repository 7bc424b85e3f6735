use std::convert::From as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use rmqtt::codec::v5::PublishProperties;
use rmqtt::context::ServerContext;
use rmqtt::hook::Type;
use rmqtt::net::Builder;
use rmqtt::server::MqttServer;
use rmqtt::session::SessionState;
use rmqtt::types::{ClientId, CodecPublish, From, Id, Publish, QoS, TopicName, UserName};
use rmqtt::utils::timestamp_millis;

use crate::store;
use crate::Result;

mod auth;
mod capture;
mod logging;
mod persist;

//queue bound per client; overflow is the engine's concern (drop per policy)
const MAX_MQUEUE_LEN: usize = 8192;
//per-client QoS 1/2 flight window
const MAX_INFLIGHT: std::num::NonZeroU16 = nonzero!(1024u16);

/// The unit of notification, as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client: String,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub session_expiry: u32,
    pub message_expiry: u32,
    //empty disables auth, which this server treats as a config error
    pub token: String,
    pub storage_enabled: bool,
    pub storage_path: String,
    pub default_topic: String,
}

/// Wraps the MQTT engine: binds listeners, registers the hook chain in
/// order (persistence, auth, logging, message capture) and exposes the
/// inline publish path the webhook uses.
pub struct Broker {
    scx: ServerContext,
    cfg: BrokerConfig,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    pub async fn start(
        cfg: BrokerConfig,
        store: Arc<store::Manager>,
        tcp_laddr: SocketAddr,
        ws_laddr: SocketAddr,
    ) -> Result<Broker> {
        if cfg.token.is_empty() {
            return Err(anyhow!("mqtt auth token must not be empty"));
        }

        let scx = ServerContext::new().build().await;
        log::info!(
            "mqtt config loaded, session_expiry: {}, message_expiry: {}",
            cfg.session_expiry,
            cfg.message_expiry
        );

        let register = scx.extends.hook_mgr().register();

        // persistence must come first so stored sessions and their offline
        // queues are rebuilt before any listener accepts connections
        if cfg.storage_enabled && !cfg.storage_path.is_empty() {
            persist::setup(&scx, register.as_ref(), &cfg.storage_path).await?;
            log::info!("mqtt persistence enabled, path: {}/mqtt", cfg.storage_path);
        }

        let auth = auth::AuthHandler::new(cfg.token.clone());
        register.add(Type::ClientAuthenticate, Box::new(auth.clone())).await;
        register.add(Type::ClientSubscribeCheckAcl, Box::new(auth.clone())).await;
        register.add(Type::MessagePublishCheckAcl, Box::new(auth)).await;
        log::info!("mqtt token authentication enabled");

        for typ in [
            Type::ClientConnected,
            Type::ClientDisconnected,
            Type::SessionSubscribed,
            Type::MessagePublish,
            Type::MessageAcked,
            Type::OfflineMessage,
            Type::OfflineInflightMessages,
        ] {
            register.add(typ, Box::new(logging::LogHandler)).await;
        }

        if store.is_enabled() {
            register
                .add(
                    Type::MessagePublish,
                    Box::new(capture::CaptureHandler::new(store, cfg.token.clone())),
                )
                .await;
            log::info!("message history capture enabled");
        }

        register.start().await;

        let tcp = listener_builder(&cfg)
            .name("external/tcp")
            .laddr(tcp_laddr)
            .bind()
            .map_err(|e| anyhow!("mqtt tcp listener bind failed on {tcp_laddr}, {e}"))?
            .tcp()?;
        let ws = listener_builder(&cfg)
            .name("external/ws")
            .laddr(ws_laddr)
            .bind()
            .map_err(|e| anyhow!("mqtt ws listener bind failed on {ws_laddr}, {e}"))?
            .ws()?;
        log::info!("mqtt tcp listening on {tcp_laddr}");
        log::info!("mqtt websocket listening on {ws_laddr}");

        // the rebuild pass and any other startup hooks run before the
        // accept loops exist
        scx.listen_cfgs.insert(tcp_laddr.port(), tcp.cfg.clone());
        scx.listen_cfgs.insert(ws_laddr.port(), ws.cfg.clone());
        scx.extends.hook_mgr().before_startup().await;

        let server = MqttServer::new(scx.clone()).listener(tcp).listener(ws).build();
        let serve_task = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                log::error!("mqtt broker serve error, {e:?}");
            }
        });

        log::info!("mqtt broker started");
        Ok(Broker { scx, cfg, serve_task: Mutex::new(Some(serve_task)) })
    }

    /// Serialize and fan out a message on `topic` through the engine's
    /// inline path: QoS 1, not retained, subject to the message-publish
    /// hook chain like any client publish.
    pub async fn publish(&self, topic: &str, msg: &PushMessage) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;

        let from = From::from_admin(Id::new(
            self.scx.node.id(),
            0,
            None,
            None,
            ClientId::from("webhook"),
            Some(UserName::from("webhook")),
        ));

        let codec_publish = CodecPublish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: TopicName::from(topic),
            packet_id: None,
            payload: Bytes::from(payload),
            properties: Some(PublishProperties::default()),
        };
        let publish = Publish::from(codec_publish).create_time(timestamp_millis());

        let expiry = Duration::from_secs(self.cfg.message_expiry as u64);

        //hook, message_publish
        let publish = self
            .scx
            .extends
            .hook_mgr()
            .message_publish(None, from.clone(), &publish)
            .await
            .unwrap_or(publish);

        SessionState::forwards(&self.scx, from, publish, false, Some(expiry))
            .await
            .map_err(|e| anyhow!("mqtt publish failed, {e:?}"))?;
        Ok(())
    }

    pub async fn publish_to_default(&self, msg: &PushMessage) -> Result<()> {
        self.publish(&self.cfg.default_topic, msg).await
    }

    /// Connected client count; internal clients and any client-id starting
    /// with `$` are excluded.
    pub async fn client_count(&self) -> usize {
        let shared = self.scx.extends.shared().await;
        let mut count = 0;
        for entry in shared.iter() {
            if let Some(s) = entry.session() {
                if s.id.client_id.starts_with('$') {
                    continue;
                }
                if entry.online().await {
                    count += 1;
                }
            }
        }
        count
    }

    /// Stop the accept/serve loops. In-flight engine work drains per the
    /// engine's own policy.
    pub fn close(&self) {
        if let Some(task) = self.serve_task.lock().take() {
            task.abort();
        }
        log::info!("mqtt broker closed");
    }
}

fn listener_builder(cfg: &BrokerConfig) -> Builder {
    Builder::new()
        .max_connections(usize::MAX)
        .allow_anonymous(false)
        .max_mqueue_len(MAX_MQUEUE_LEN)
        .max_inflight(MAX_INFLIGHT)
        .max_qos_allowed(QoS::ExactlyOnce)
        .session_expiry_interval(Duration::from_secs(cfg.session_expiry as u64))
        .message_expiry_interval(Duration::from_secs(cfg.message_expiry as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_message_wire_shape() {
        let msg = PushMessage {
            title: "t".into(),
            content: "hello".into(),
            extra: None,
            timestamp: Utc::now(),
            client: String::new(),
        };
        let v: serde_json::Value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(v["title"], "t");
        assert_eq!(v["content"], "hello");
        // optional fields are omitted when unset
        assert!(v.get("extra").is_none());
        assert!(v.get("client").is_none());
        assert!(v.get("timestamp").is_some());
    }

    #[test]
    fn test_push_message_parses_partial_payloads() {
        // subscriber-published payloads may omit most fields
        let msg: PushMessage = serde_json::from_str(r#"{"content":"hi"}"#).expect("parse");
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.title, "");
        assert!(msg.extra.is_none());

        let msg: PushMessage = serde_json::from_str("{}").expect("parse");
        assert_eq!(msg.content, "");

        // a bare JSON string is not a message object
        assert!(serde_json::from_str::<PushMessage>(r#""just text""#).is_err());
    }

    #[test]
    fn test_empty_token_is_a_config_error() {
        let cfg = BrokerConfig {
            session_expiry: 60,
            message_expiry: 60,
            token: String::new(),
            storage_enabled: false,
            storage_path: String::new(),
            default_topic: "notice".into(),
        };
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let res = rt.block_on(Broker::start(
            cfg,
            Arc::new(store::Manager::new("unused", false)),
            ([127, 0, 0, 1], 0).into(),
            ([127, 0, 0, 1], 0).into(),
        ));
        assert!(res.is_err());
    }
}
