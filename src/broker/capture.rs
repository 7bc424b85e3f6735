use std::sync::Arc;

use async_trait::async_trait;

use rmqtt::hook::{Handler, HookResult, Parameter, ReturnType};

use super::PushMessage;
use crate::store;

/// Copies published messages into the history store. System topics
/// (leading `$`) are skipped; a save failure never blocks delivery.
pub(crate) struct CaptureHandler {
    store: Arc<store::Manager>,
    //the single tenant this server is configured with; a multi-credential
    //server would have to derive this from the publishing client instead
    token: String,
}

impl CaptureHandler {
    pub(crate) fn new(store: Arc<store::Manager>, token: String) -> Self {
        Self { store, token }
    }
}

#[async_trait]
impl Handler for CaptureHandler {
    async fn hook(&self, param: &Parameter, acc: Option<HookResult>) -> ReturnType {
        if let Parameter::MessagePublish(_session, _from, publish) = param {
            let topic: &str = publish.topic.as_ref();
            if topic.as_bytes().first() == Some(&b'$') {
                return (true, acc);
            }

            let saved = match serde_json::from_slice::<PushMessage>(&publish.payload) {
                Ok(msg) => {
                    self.store.save(&self.token, topic, &msg.title, &msg.content, msg.extra)
                }
                Err(_) => {
                    // not our JSON shape, keep the raw payload as content
                    let raw = String::from_utf8_lossy(&publish.payload);
                    self.store.save(&self.token, topic, "", raw.as_ref(), None)
                }
            };

            if let Err(e) = saved {
                log::warn!("failed to store message, topic: {topic}, {e:?}");
            }
        }
        (true, acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use rmqtt::codec::v5::PublishProperties;
    use rmqtt::types::{ClientId, From, Id, Publish, QoS, TopicName, UserName};
    use rmqtt::utils::timestamp_millis;

    fn make_publish(topic: &str, payload: &[u8]) -> (From, Publish) {
        let from = From::from_custom(Id::new(
            1,
            0,
            None,
            None,
            ClientId::from("test-client"),
            Some(UserName::from("tester")),
        ));
        let publish = Publish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: TopicName::from(topic),
            packet_id: None,
            payload: Bytes::from(payload.to_vec()),
            properties: Some(PublishProperties::default()),
            delay_interval: None,
            create_time: Some(timestamp_millis()),
        };
        (from, publish)
    }

    #[tokio::test]
    async fn test_capture_stores_json_and_raw_payloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(store::Manager::new(dir.path(), true));
        let handler = CaptureHandler::new(store.clone(), "tok".into());

        // a well-formed push message keeps its fields
        let (from, publish) =
            make_publish("notice", br#"{"title":"t1","content":"hello","extra":{"n":1}}"#);
        handler.hook(&Parameter::MessagePublish(None, from, &publish), None).await;

        // anything else is stored raw
        let (from, publish) = make_publish("notice/raw", b"plain text payload");
        handler.hook(&Parameter::MessagePublish(None, from, &publish), None).await;

        // system topics are not captured
        let (from, publish) = make_publish("$SYS/stats", br#"{"content":"ignored"}"#);
        handler.hook(&Parameter::MessagePublish(None, from, &publish), None).await;

        let page = store.list("tok", 0, 10).expect("list");
        assert_eq!(page.total, 2);
        assert_eq!(page.messages.len(), 2);
        // newest first: the raw payload
        assert_eq!(page.messages[0].topic, "notice/raw");
        assert_eq!(page.messages[0].title, "");
        assert_eq!(page.messages[0].content, "plain text payload");
        assert_eq!(page.messages[1].topic, "notice");
        assert_eq!(page.messages[1].title, "t1");
        assert_eq!(page.messages[1].content, "hello");
        assert_eq!(page.messages[1].extra, Some(serde_json::json!({"n": 1})));
        store.close();
    }
}
