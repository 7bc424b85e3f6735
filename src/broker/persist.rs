use std::collections::HashMap;
use std::convert::From as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

use rmqtt::context::ServerContext;
use rmqtt::fitter::Fitter;
use rmqtt::hook::{Handler, HookResult, Parameter, Register, ReturnType, Type};
use rmqtt::inflight::OutInflightMessage;
use rmqtt::session::{Session, SessionState};
use rmqtt::types::{
    ConnectInfo, DisconnectInfo, From, Id, Publish, SessionSubMap, SessionSubs, TimestampMillis,
};
use rmqtt::utils::timestamp_millis;
use rmqtt_storage::{init_db, DefaultStorageDB, List, Map};

use crate::Result;

const MQTT_STORAGE_DIR: &str = "mqtt";

const LAST_TIME: &[u8] = b"1";
const DISCONNECT_INFO: &[u8] = b"2";
const SESSION_SUB_MAP: &[u8] = b"3";
const BASIC: &[u8] = b"4";
const INFLIGHT_MESSAGES: &[u8] = b"5";

type OfflineMessage = (From, Publish);

/// Durable per-session state: connection basics, the subscription map,
/// disconnect info and queued offline/inflight messages. Keyed by client id
/// so a reconnecting client finds its previous session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Basic {
    id: Id,
    #[serde(
        serialize_with = "Basic::serialize_conn_info",
        deserialize_with = "Basic::deserialize_conn_info"
    )]
    conn_info: Arc<ConnectInfo>,
    created_at: TimestampMillis,
    connected_at: TimestampMillis,
}

impl Basic {
    fn serialize_conn_info<S>(
        conn_info: &Arc<ConnectInfo>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        conn_info.as_ref().serialize(s)
    }

    fn deserialize_conn_info<'de, D>(
        deserializer: D,
    ) -> std::result::Result<Arc<ConnectInfo>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Arc::new(ConnectInfo::deserialize(deserializer)?))
    }
}

struct StoredSession {
    key: Bytes,
    basic: Basic,
    last_time: TimestampMillis,
    subs: Option<SessionSubMap>,
    disconnect_info: Option<DisconnectInfo>,
    inflight_messages: Vec<OutInflightMessage>,
    offline_messages: Vec<OfflineMessage>,
}

fn make_map_key<T: AsRef<[u8]>>(client_id: T) -> Bytes {
    let mut key = Vec::from("map-");
    key.extend_from_slice(client_id.as_ref());
    Bytes::from(key)
}

fn make_list_key<T: AsRef<[u8]>>(client_id: T) -> Bytes {
    let mut key = Vec::from("list-");
    key.extend_from_slice(client_id.as_ref());
    Bytes::from(key)
}

fn map_key_client_id(stored_key: &[u8]) -> &[u8] {
    stored_key.strip_prefix(b"map-").unwrap_or(stored_key)
}

fn list_key_client_id(stored_key: &[u8]) -> &[u8] {
    stored_key.strip_prefix(b"list-").unwrap_or(stored_key)
}

/// Open the engine-state db under `<storage_path>/mqtt`, load previously
/// stored sessions and register the persistence hooks. Runs before any
/// other hook so the rebuild pass precedes the accept loops.
pub(crate) async fn setup(
    scx: &ServerContext,
    register: &dyn Register,
    storage_path: &str,
) -> Result<()> {
    let db_cfg: rmqtt_storage::Config = serde_json::from_value(json!({
        "type": "sled",
        "sled": { "path": format!("{storage_path}/{MQTT_STORAGE_DIR}") }
    }))?;
    let storage_db = init_db(&db_cfg).await.map_err(|e| anyhow!("init mqtt storage db, {e:?}"))?;

    let stored = load_stored_sessions(&storage_db).await?;
    log::info!("stored mqtt sessions loaded, count: {}", stored.len());

    let rebuild_tx = start_rebuild_runtime(scx.clone());
    register
        .add(
            Type::BeforeStartup,
            Box::new(RebuildHandler {
                scx: scx.clone(),
                storage_db: storage_db.clone(),
                stored: Mutex::new(stored),
                rebuild_tx,
            }),
        )
        .await;

    for typ in [
        Type::SessionCreated,
        Type::ClientConnected,
        Type::ClientDisconnected,
        Type::SessionSubscribed,
        Type::SessionUnsubscribed,
        Type::SessionTerminated,
        Type::OfflineMessage,
        Type::OfflineInflightMessages,
    ] {
        register.add(typ, Box::new(PersistHandler { storage_db: storage_db.clone() })).await;
    }

    Ok(())
}

async fn load_stored_sessions(storage_db: &DefaultStorageDB) -> Result<Vec<StoredSession>> {
    let mut sessions: HashMap<Vec<u8>, StoredSession> = HashMap::new();

    let cleanup_db = storage_db.clone();
    let mut iter_db = storage_db.clone();

    let mut map_iter = iter_db.map_iter().await.map_err(|e| anyhow!(e))?;
    while let Some(m) = map_iter.next().await {
        let m = match m {
            Ok(m) => m,
            Err(e) => {
                log::warn!("load stored session error, {e:?}");
                continue;
            }
        };
        let client_id = map_key_client_id(m.name()).to_vec();

        let basic = match m.get::<_, Basic>(BASIC).await {
            Ok(Some(basic)) => basic,
            Ok(None) | Err(_) => {
                // unreadable entry, drop it rather than carry it forever
                if let Err(e) = cleanup_db.map_remove(m.name()).await {
                    log::warn!("remove stored session error, {e:?}");
                }
                continue;
            }
        };

        let mut stored = StoredSession {
            key: Bytes::from(client_id.clone()),
            last_time: basic.connected_at,
            basic,
            subs: None,
            disconnect_info: None,
            inflight_messages: Vec::new(),
            offline_messages: Vec::new(),
        };

        match m.get::<_, TimestampMillis>(LAST_TIME).await {
            Ok(Some(last_time)) => stored.last_time = last_time,
            Ok(None) => {}
            Err(e) => log::warn!("{:?} load session last time error, {e:?}", stored.basic.id),
        }
        match m.get::<_, SessionSubMap>(SESSION_SUB_MAP).await {
            Ok(subs) => stored.subs = subs,
            Err(e) => log::warn!("{:?} load session subscriptions error, {e:?}", stored.basic.id),
        }
        match m.get::<_, DisconnectInfo>(DISCONNECT_INFO).await {
            Ok(info) => stored.disconnect_info = info,
            Err(e) => log::warn!("{:?} load session disconnect info error, {e:?}", stored.basic.id),
        }
        match m.get::<_, Vec<OutInflightMessage>>(INFLIGHT_MESSAGES).await {
            Ok(Some(inflights)) => stored.inflight_messages = inflights,
            Ok(None) => {}
            Err(e) => log::warn!("{:?} load session inflights error, {e:?}", stored.basic.id),
        }

        sessions.insert(client_id, stored);
    }
    drop(map_iter);

    let mut list_iter = iter_db.list_iter().await.map_err(|e| anyhow!(e))?;
    while let Some(l) = list_iter.next().await {
        let l = match l {
            Ok(l) => l,
            Err(e) => {
                log::warn!("load offline messages error, {e:?}");
                continue;
            }
        };
        let client_id = list_key_client_id(l.name()).to_vec();
        match l.all::<OfflineMessage>().await {
            Ok(msgs) => match sessions.get_mut(&client_id) {
                Some(stored) => stored.offline_messages = msgs,
                None => {
                    // orphaned queue without a session
                    if let Err(e) = cleanup_db.list_remove(l.name()).await {
                        log::warn!("remove offline messages error, {e:?}");
                    }
                }
            },
            Err(e) => {
                log::warn!("load offline messages error, {e:?}");
                if let Err(e) = cleanup_db.list_remove(l.name()).await {
                    log::warn!("remove offline messages error, {e:?}");
                }
            }
        }
    }
    drop(list_iter);

    Ok(sessions.into_values().collect())
}

enum RebuildChanType {
    Session(Session, Duration),
    Done(oneshot::Sender<()>),
}

/// Session rebuild runs on a dedicated current-thread runtime; the restart
/// path is not Send.
fn start_rebuild_runtime(scx: ServerContext) -> mpsc::Sender<RebuildChanType> {
    let (tx, mut rx) = mpsc::channel::<RebuildChanType>(100_000);
    std::thread::spawn(move || {
        let local_rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("session rebuild runtime build failed, {e:?}");
                return;
            }
        };
        let local_set = tokio::task::LocalSet::new();
        local_set.block_on(&local_rt, async {
            while let Some(msg) = rx.next().await {
                match msg {
                    RebuildChanType::Session(session, session_expiry_interval) => {
                        match SessionState::offline_restart(session.clone(), session_expiry_interval)
                            .await
                        {
                            Err(e) => {
                                log::warn!("rebuild offline session error, {e:?}");
                            }
                            Ok(msg_tx) => {
                                let mut entry =
                                    scx.extends.shared().await.entry(session.id.clone());
                                if let Err(e) = entry.set(session, msg_tx).await {
                                    log::warn!(
                                        "{:?} rebuild offline session error, {e:?}",
                                        entry.id()
                                    );
                                }
                            }
                        }
                    }
                    RebuildChanType::Done(done_tx) => {
                        let _ = done_tx.send(());
                    }
                }
            }
        });
        log::debug!("session rebuild runtime ends");
    });
    tx
}

struct RebuildHandler {
    scx: ServerContext,
    storage_db: DefaultStorageDB,
    stored: Mutex<Vec<StoredSession>>,
    rebuild_tx: mpsc::Sender<RebuildChanType>,
}

impl RebuildHandler {
    async fn rebuild_offline_sessions(&self) {
        let stored_sessions = {
            let mut stored = self.stored.lock();
            std::mem::take(&mut *stored)
        };

        let mut rebuilt = 0;
        for mut stored in stored_sessions {
            let id = stored.basic.id.clone();

            let listen_cfg =
                match self.scx.listen_cfgs.get(&id.lid).map(|c| c.value().clone()) {
                    Some(cfg) => cfg,
                    None => {
                        log::warn!(
                            "listener config not found for stored session, local addr: {:?}",
                            id.local_addr
                        );
                        continue;
                    }
                };

            let fitter = self.scx.extends.fitter_mgr().await.create(
                stored.basic.conn_info.clone(),
                id.clone(),
                listen_cfg.clone(),
            );

            let expiry =
                session_expiry_interval(fitter.as_ref(), stored.disconnect_info.as_ref(), stored.last_time);
            if expiry <= 0 {
                log::debug!("{id:?} stored session is expired, dropping");
                if let Err(e) = self.storage_db.map_remove(make_map_key(&stored.key)).await {
                    log::warn!("{id:?} remove stored session error, {e:?}");
                }
                if let Err(e) = self.storage_db.list_remove(make_list_key(&stored.key)).await {
                    log::warn!("{id:?} remove offline messages error, {e:?}");
                }
                continue;
            }

            let disconnect_info =
                Some(stored.disconnect_info.take().unwrap_or_else(|| DisconnectInfo::new(stored.last_time)));
            let max_inflight = fitter.max_inflight();
            let max_mqueue_len = fitter.max_mqueue_len();
            let subs = stored.subs.take().map(SessionSubs::from).unwrap_or_else(SessionSubs::new);

            let session = match Session::new(
                id.clone(),
                self.scx.clone(),
                max_mqueue_len,
                listen_cfg,
                fitter,
                None,
                max_inflight,
                stored.basic.created_at,
                stored.basic.conn_info.clone(),
                false,
                false,
                false,
                stored.basic.connected_at,
                subs,
                disconnect_info,
                None,
            )
            .await
            {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("{id:?} rebuild session error, {e:?}");
                    continue;
                }
            };

            let deliver_queue = session.deliver_queue();
            for item in stored.offline_messages.drain(..) {
                if let Err((f, p)) = deliver_queue.push(item) {
                    log::warn!("rebuild session, deliver queue is full, from: {f:?}, publish: {p:?}");
                }
            }
            {
                let mut inflight_win = session.out_inflight().write().await;
                for item in stored.inflight_messages.drain(..) {
                    inflight_win.push_back(item);
                }
            }

            if let Err(e) = self
                .rebuild_tx
                .clone()
                .send(RebuildChanType::Session(session, Duration::from_millis(expiry as u64)))
                .await
            {
                log::error!("rebuild offline sessions error, {e:?}");
            }
            rebuilt += 1;
        }
        log::info!("offline sessions rebuilt, count: {rebuilt}");

        let (done_tx, done_rx) = oneshot::channel::<()>();
        if self.rebuild_tx.clone().send(RebuildChanType::Done(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[async_trait]
impl Handler for RebuildHandler {
    async fn hook(&self, param: &Parameter, acc: Option<HookResult>) -> ReturnType {
        if let Parameter::BeforeStartup = param {
            self.rebuild_offline_sessions().await;
        }
        (true, acc)
    }
}

fn session_expiry_interval(
    fitter: &dyn Fitter,
    disconnect_info: Option<&DisconnectInfo>,
    last_time: TimestampMillis,
) -> TimestampMillis {
    let disconnected_at = disconnect_info.map(|d| d.disconnected_at).unwrap_or_default();
    let disconnected_at = if disconnected_at <= 0 { last_time } else { disconnected_at };
    fitter.session_expiry_interval(disconnect_info.and_then(|d| d.mqtt_disconnect.as_ref())).as_millis()
        as TimestampMillis
        - (timestamp_millis() - disconnected_at)
}

struct PersistHandler {
    storage_db: DefaultStorageDB,
}

impl PersistHandler {
    /// Only sessions with clean_session=false / clean_start=false persist.
    async fn is_transient(session: &Session) -> bool {
        match session.connect_info().await {
            Ok(conn_info) => conn_info.clean_start(),
            Err(_) => true,
        }
    }

    async fn save_basic(&self, session: &Session) {
        let conn_info = match session.connect_info().await {
            Ok(ci) => ci,
            Err(e) => {
                log::warn!("{:?} connect info unavailable, {e:?}", session.id);
                return;
            }
        };
        let basic = Basic {
            id: session.id.clone(),
            conn_info,
            created_at: session.created_at().await.unwrap_or_else(|_| timestamp_millis()),
            connected_at: session.connected_at().await.unwrap_or_else(|_| timestamp_millis()),
        };
        match self.storage_db.map(make_map_key(session.id.client_id.as_bytes()).as_ref(), None).await {
            Ok(m) => {
                if let Err(e) = m.insert(BASIC, &basic).await {
                    log::warn!("{:?} save session basic error, {e:?}", session.id);
                }
                if let Err(e) = m.insert(LAST_TIME, &timestamp_millis()).await {
                    log::warn!("{:?} save session last time error, {e:?}", session.id);
                }
            }
            Err(e) => log::warn!("{:?} save session basic error, {e:?}", session.id),
        }
    }

    async fn save_subs(&self, session: &Session) {
        let subs: SessionSubMap = match session.subscriptions().await {
            Ok(subs) => subs.read().await.clone(),
            Err(e) => {
                log::warn!("{:?} subscriptions unavailable, {e:?}", session.id);
                return;
            }
        };
        match self.storage_db.map(make_map_key(session.id.client_id.as_bytes()).as_ref(), None).await {
            Ok(m) => {
                if let Err(e) = m.insert(SESSION_SUB_MAP, &subs).await {
                    log::warn!("{:?} save session subscriptions error, {e:?}", session.id);
                }
            }
            Err(e) => log::warn!("{:?} save session subscriptions error, {e:?}", session.id),
        }
    }

    async fn mark_connected(&self, session: &Session) {
        match self.storage_db.map(make_map_key(session.id.client_id.as_bytes()).as_ref(), None).await {
            Ok(m) => {
                if let Err(e) = m.remove(DISCONNECT_INFO).await {
                    log::warn!("{:?} clear disconnect info error, {e:?}", session.id);
                }
                if let Err(e) = m.insert(LAST_TIME, &timestamp_millis()).await {
                    log::warn!("{:?} save session last time error, {e:?}", session.id);
                }
            }
            Err(e) => log::warn!("{:?} mark connected error, {e:?}", session.id),
        }
    }

    async fn mark_disconnected(&self, session: &Session) {
        match self.storage_db.map(make_map_key(session.id.client_id.as_bytes()).as_ref(), None).await {
            Ok(m) => {
                let info = DisconnectInfo::new(timestamp_millis());
                if let Err(e) = m.insert(DISCONNECT_INFO, &info).await {
                    log::warn!("{:?} save disconnect info error, {e:?}", session.id);
                }
                if let Err(e) = m.insert(LAST_TIME, &timestamp_millis()).await {
                    log::warn!("{:?} save session last time error, {e:?}", session.id);
                }
            }
            Err(e) => log::warn!("{:?} mark disconnected error, {e:?}", session.id),
        }
    }

    async fn remove_session(&self, session: &Session) {
        let client_id = session.id.client_id.as_bytes();
        if let Err(e) = self.storage_db.map_remove(make_map_key(client_id)).await {
            log::warn!("{:?} remove stored session error, {e:?}", session.id);
        }
        if let Err(e) = self.storage_db.list_remove(make_list_key(client_id)).await {
            log::warn!("{:?} remove offline messages error, {e:?}", session.id);
        }
    }

    async fn save_offline_message(&self, session: &Session, from: &From, publish: &Publish) {
        let key = make_list_key(session.id.client_id.as_bytes());
        match self.storage_db.list(key.as_ref(), None).await {
            Ok(offlines) => {
                let item: OfflineMessage = (from.clone(), publish.clone());
                if let Err(e) = offlines
                    .push_limit::<OfflineMessage>(&item, session.listen_cfg().max_mqueue_len, true)
                    .await
                {
                    log::warn!("{:?} save offline message error, {e:?}", session.id);
                }
            }
            Err(e) => log::warn!("{:?} save offline message error, {e:?}", session.id),
        }
    }

    async fn save_inflights(&self, session: &Session, inflights: &Vec<OutInflightMessage>) {
        match self.storage_db.map(make_map_key(session.id.client_id.as_bytes()).as_ref(), None).await {
            Ok(m) => {
                if let Err(e) = m.insert(INFLIGHT_MESSAGES, inflights).await {
                    log::warn!("{:?} save inflight messages error, {e:?}", session.id);
                }
            }
            Err(e) => log::warn!("{:?} save inflight messages error, {e:?}", session.id),
        }
    }
}

#[async_trait]
impl Handler for PersistHandler {
    async fn hook(&self, param: &Parameter, acc: Option<HookResult>) -> ReturnType {
        match param {
            Parameter::SessionCreated(session) => {
                if Self::is_transient(session).await {
                    // a clean session replaces any stored predecessor
                    self.remove_session(session).await;
                } else {
                    self.save_basic(session).await;
                }
            }
            Parameter::ClientConnected(session) => {
                if !Self::is_transient(session).await {
                    self.mark_connected(session).await;
                }
            }
            Parameter::ClientDisconnected(session, _reason) => {
                if !Self::is_transient(session).await {
                    self.mark_disconnected(session).await;
                }
            }
            Parameter::SessionSubscribed(session, _subscribe) => {
                if !Self::is_transient(session).await {
                    self.save_subs(session).await;
                }
            }
            Parameter::SessionUnsubscribed(session, _unsubscribe) => {
                if !Self::is_transient(session).await {
                    self.save_subs(session).await;
                }
            }
            Parameter::SessionTerminated(session, _reason) => {
                self.remove_session(session).await;
            }
            Parameter::OfflineMessage(session, from, publish) => {
                if !Self::is_transient(session).await {
                    self.save_offline_message(session, from, publish).await;
                }
            }
            Parameter::OfflineInflightMessages(session, inflights) => {
                if !Self::is_transient(session).await {
                    self.save_inflights(session, inflights).await;
                }
            }
            _ => {}
        }
        (true, acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_keys() {
        let m = make_map_key(b"client-1");
        assert_eq!(m.as_ref(), b"map-client-1");
        assert_eq!(map_key_client_id(&m), b"client-1");

        let l = make_list_key(b"client-1");
        assert_eq!(l.as_ref(), b"list-client-1");
        assert_eq!(list_key_client_id(&l), b"client-1");

        // keys without a prefix pass through unchanged
        assert_eq!(map_key_client_id(b"plain"), b"plain");
    }
}
