use async_trait::async_trait;

use rmqtt::hook::{Handler, HookResult, Parameter, ReturnType};

/// Structured log events for the client lifecycle and message flow.
pub(crate) struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn hook(&self, param: &Parameter, acc: Option<HookResult>) -> ReturnType {
        match param {
            Parameter::ClientConnected(session) => {
                log::info!("mqtt client connected, client_id: {}", session.id.client_id);
                // pending inflight messages mean an offline session was resumed
                let pending = session.out_inflight().read().await.len();
                if pending > 0 {
                    log::info!(
                        "mqtt session resumed, client_id: {}, pending_messages: {}",
                        session.id.client_id,
                        pending
                    );
                }
            }
            Parameter::ClientDisconnected(session, reason) => {
                log::info!(
                    "mqtt client disconnected, client_id: {}, reason: {:?}",
                    session.id.client_id,
                    reason
                );
            }
            Parameter::SessionSubscribed(session, subscribe) => {
                log::debug!(
                    "mqtt client subscribed, client_id: {}, topic: {}",
                    session.id.client_id,
                    subscribe.topic_filter
                );
            }
            Parameter::MessagePublish(_session, from, publish) => {
                log::debug!(
                    "mqtt message published, topic: {}, payload_size: {}, from: {:?}",
                    publish.topic,
                    publish.payload.len(),
                    from
                );
            }
            Parameter::MessageAcked(session, _from, publish) => {
                log::debug!(
                    "mqtt qos message completed, client_id: {}, packet_id: {:?}",
                    session.id.client_id,
                    publish.packet_id
                );
            }
            Parameter::OfflineMessage(session, _from, publish) => {
                log::debug!(
                    "offline message queued, client_id: {}, topic: {}",
                    session.id.client_id,
                    publish.topic
                );
            }
            Parameter::OfflineInflightMessages(session, inflights) => {
                log::debug!(
                    "inflight messages retained for offline delivery, client_id: {}, count: {}",
                    session.id.client_id,
                    inflights.len()
                );
            }
            _ => {}
        }
        (true, acc)
    }
}
