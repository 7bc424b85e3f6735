use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const STORE_DIR_NAME: &str = "store";

const META_TOKEN_KEY: &[u8] = b"meta:token";
const META_COUNT_KEY: &[u8] = b"meta:count";
const SEQ_KEY: &[u8] = b"seq:msg";
const MSG_KEY_PREFIX: &[u8] = b"msg:";

//ids are leased in batches so allocation amortizes the sync cost; unused
//ids in a batch are lost on crash, which only produces gaps
const SEQ_BANDWIDTH: u64 = 100;
//persist meta:count every this many saves
const COUNT_CHECKPOINT_EVERY: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("token collision: storage directory is owned by another token")]
    TokenCollision,
    #[error(transparent)]
    Db(#[from] sled::Error),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A message as kept in a tenant's history. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: u64,
    pub topic: String,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// One page of a descending-id cursor walk.
#[derive(Debug, Clone, Serialize)]
pub struct CursorResult {
    pub messages: Vec<StoredMessage>,
    pub total: usize,
    pub page_size: usize,
    pub has_more: bool,
    pub next_id: u64,
}

impl CursorResult {
    fn empty(page_size: usize) -> Self {
        Self { messages: Vec::new(), total: 0, page_size, has_more: false, next_id: 0 }
    }
}

/// First 128 bits of SHA-256, rendered as 32 lowercase hex characters.
/// Used as the on-disk directory name for a token's store.
fn token_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(32);
    for b in &digest[..16] {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Two-level fan-out: `<base>/<hash[0:2]>/<hash>` keeps per-directory entry
/// counts bounded.
fn token_path(base: &Path, hash: &str) -> PathBuf {
    if hash.len() < 2 {
        return base.join(hash);
    }
    base.join(&hash[..2]).join(hash)
}

fn make_key(id: u64) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(MSG_KEY_PREFIX);
    key[4..].copy_from_slice(&id.to_be_bytes());
    key
}

fn decode_u64(val: &[u8]) -> u64 {
    if val.len() != 8 {
        return 0;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(val);
    u64::from_be_bytes(buf)
}

/// Monotonic id allocator over a db key, leasing `SEQ_BANDWIDTH` ids at a
/// time. Ids start at 1 and may skip across process restarts.
struct Sequence {
    db: sled::Db,
    next: u64,
    leased: u64,
}

impl Sequence {
    fn new(db: sled::Db) -> Result<Self> {
        let next = match db.get(SEQ_KEY)? {
            Some(val) => decode_u64(&val).max(1),
            None => 1,
        };
        Ok(Self { db, next, leased: next })
    }

    fn next(&mut self) -> Result<u64> {
        if self.next >= self.leased {
            let leased = self.next + SEQ_BANDWIDTH;
            self.db.insert(SEQ_KEY, &leased.to_be_bytes())?;
            self.leased = leased;
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    /// Hand back the unconsumed tail of the current lease.
    fn release(&mut self) -> Result<()> {
        self.db.insert(SEQ_KEY, &self.next.to_be_bytes())?;
        self.leased = self.next;
        Ok(())
    }
}

/// Message history for a single token. Owns the db handle and the sequence.
pub struct TokenStore {
    db: sled::Db,
    seq: Mutex<Sequence>,
    count: RwLock<u64>,
}

impl TokenStore {
    fn open(path: &Path, token: &str) -> Result<TokenStore> {
        std::fs::create_dir_all(path)?;
        let db = sled::Config::default().path(path).mode(sled::Mode::HighThroughput).open()?;

        // the directory binds to exactly one token for its lifetime
        match db.get(META_TOKEN_KEY)? {
            None => {
                db.insert(META_TOKEN_KEY, token.as_bytes())?;
            }
            Some(stored) => {
                if stored.as_ref() != token.as_bytes() {
                    return Err(StoreError::TokenCollision);
                }
            }
        }

        let seq = Sequence::new(db.clone())?;
        let store = TokenStore { db, seq: Mutex::new(seq), count: RwLock::new(0) };
        store.load_count()?;
        Ok(store)
    }

    fn load_count(&self) -> Result<()> {
        match self.db.get(META_COUNT_KEY)? {
            Some(val) if val.len() == 8 => {
                *self.count.write() = decode_u64(&val);
            }
            _ => {
                let count = self.count_messages();
                *self.count.write() = count;
                self.save_count(count);
            }
        }
        Ok(())
    }

    fn count_messages(&self) -> u64 {
        self.db.scan_prefix(MSG_KEY_PREFIX).filter(|item| item.is_ok()).count() as u64
    }

    fn save_count(&self, count: u64) {
        if let Err(e) = self.db.insert(META_COUNT_KEY, &count.to_be_bytes()) {
            log::warn!("failed to checkpoint message count, {e:?}");
        }
    }

    pub fn save(
        &self,
        topic: &str,
        title: &str,
        content: &str,
        extra: Option<serde_json::Value>,
    ) -> Result<StoredMessage> {
        let id = self.seq.lock().next()?;

        let msg = StoredMessage {
            id,
            topic: topic.to_owned(),
            title: title.to_owned(),
            content: content.to_owned(),
            extra,
            timestamp: Utc::now(),
        };

        let data = serde_json::to_vec(&msg)?;
        self.db.insert(make_key(id), data)?;

        let count = {
            let mut count = self.count.write();
            *count += 1;
            *count
        };

        if count % COUNT_CHECKPOINT_EVERY == 0 {
            let db = self.db.clone();
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn_blocking(move || {
                    if let Err(e) = db.insert(META_COUNT_KEY, &count.to_be_bytes()) {
                        log::warn!("failed to checkpoint message count, {e:?}");
                    }
                });
            } else {
                self.save_count(count);
            }
        }

        Ok(msg)
    }

    /// Page of messages in descending id order, starting strictly below
    /// `before_id` (0 means from the newest). `page_size` is clamped to
    /// [1, 100]; 0 selects the default of 20.
    pub fn list(&self, before_id: u64, page_size: isize) -> Result<CursorResult> {
        let page_size = clamp_page_size(page_size);
        let total = *self.count.read() as usize;

        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            if before_id > 0 {
                Box::new(self.db.range(make_key(0).to_vec()..make_key(before_id).to_vec()).rev())
            } else {
                Box::new(self.db.range(make_key(0).to_vec()..=make_key(u64::MAX).to_vec()).rev())
            };

        let mut messages: Vec<StoredMessage> = Vec::with_capacity(page_size);
        let mut has_more = false;
        for item in iter {
            let (_, val) = item?;
            if messages.len() == page_size {
                // a page_size+1-th entry exists, so another page follows
                has_more = true;
                break;
            }
            messages.push(serde_json::from_slice(&val)?);
        }

        // the cursor is an exclusive upper bound: handing back the last
        // delivered id makes a walk gap-free
        let next_id = if has_more { messages.last().map(|m| m.id).unwrap_or(0) } else { 0 };

        Ok(CursorResult { messages, total, page_size, has_more, next_id })
    }

    pub fn count(&self) -> usize {
        *self.count.read() as usize
    }

    /// Release the sequence lease, checkpoint the count and flush the db.
    /// Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        self.seq.lock().release()?;
        self.save_count(*self.count.read());
        self.db.flush()?;
        Ok(())
    }
}

fn clamp_page_size(page_size: isize) -> usize {
    if page_size < 1 {
        20
    } else if page_size > 100 {
        100
    } else {
        page_size as usize
    }
}

/// Keeps one `TokenStore` per token hash, opening lazily on first access.
pub struct Manager {
    base_path: PathBuf,
    enabled: bool,
    stores: RwLock<HashMap<String, Arc<TokenStore>>>,
}

impl Manager {
    pub fn new(path: impl AsRef<Path>, enabled: bool) -> Self {
        Self {
            base_path: path.as_ref().join(STORE_DIR_NAME),
            enabled,
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get_store(&self, token: &str) -> Result<Option<Arc<TokenStore>>> {
        if !self.enabled {
            return Ok(None);
        }

        let hash = token_hash(token);

        if let Some(ts) = self.stores.read().get(&hash) {
            return Ok(Some(ts.clone()));
        }

        let mut stores = self.stores.write();
        // double-check: another caller may have opened it meanwhile
        if let Some(ts) = stores.get(&hash) {
            return Ok(Some(ts.clone()));
        }

        let path = token_path(&self.base_path, &hash);
        let ts = Arc::new(TokenStore::open(&path, token)?);
        stores.insert(hash, ts.clone());
        Ok(Some(ts))
    }

    pub fn save(
        &self,
        token: &str,
        topic: &str,
        title: &str,
        content: &str,
        extra: Option<serde_json::Value>,
    ) -> Result<Option<StoredMessage>> {
        match self.get_store(token)? {
            Some(ts) => ts.save(topic, title, content, extra).map(Some),
            None => Ok(None),
        }
    }

    pub fn list(&self, token: &str, before_id: u64, page_size: isize) -> Result<CursorResult> {
        match self.get_store(token)? {
            Some(ts) => ts.list(before_id, page_size),
            None => Ok(CursorResult::empty(clamp_page_size(page_size))),
        }
    }

    pub fn count(&self, token: &str) -> usize {
        if !self.enabled {
            return 0;
        }
        let hash = token_hash(token);
        match self.stores.read().get(&hash) {
            Some(ts) => ts.count(),
            None => 0,
        }
    }

    /// Close every open store. Idempotent; called on shutdown.
    pub fn close(&self) {
        let mut stores = self.stores.write();
        for (hash, ts) in stores.drain() {
            if let Err(e) = ts.close() {
                log::warn!("failed to close token store, hash: {hash}, {e:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_hash() {
        let h1 = token_hash("test-token");
        let h2 = token_hash("test-token");
        assert_eq!(h1, h2);

        let h3 = token_hash("another-token");
        assert_ne!(h1, h3);

        assert_eq!(h1.len(), 32);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_token_path_fanout() {
        let p = token_path(Path::new("base"), "a1b2c3");
        assert_eq!(p, PathBuf::from("base/a1/a1b2c3"));
        let p = token_path(Path::new("base"), "x");
        assert_eq!(p, PathBuf::from("base/x"));
    }

    #[test]
    fn test_save_and_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ts = TokenStore::open(dir.path(), "test-token").expect("open");
        assert_eq!(ts.count(), 0);

        let msg = ts
            .save("test/topic", "a title", "some content", Some(serde_json::json!({"k": "v"})))
            .expect("save");
        assert_eq!(msg.topic, "test/topic");
        assert_eq!(msg.title, "a title");
        assert_eq!(msg.content, "some content");
        assert_eq!(msg.id, 1);
        assert_eq!(ts.count(), 1);

        for _ in 0..5 {
            ts.save("test/topic", "t", "c", None).expect("save");
        }
        assert_eq!(ts.count(), 6);
        ts.close().expect("close");
    }

    #[test]
    fn test_ids_strictly_increasing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ts = TokenStore::open(dir.path(), "test-token").expect("open");
        let mut last = 0;
        for _ in 0..150 {
            let msg = ts.save("t", "", "c", None).expect("save");
            assert!(msg.id > last, "id {} not greater than {}", msg.id, last);
            last = msg.id;
        }
        ts.close().expect("close");
    }

    #[test]
    fn test_token_collision() {
        let dir = tempfile::tempdir().expect("tempdir");

        let ts1 = TokenStore::open(dir.path(), "token-a").expect("open");
        ts1.close().expect("close");
        drop(ts1);

        // same token reopens fine
        let ts2 = TokenStore::open(dir.path(), "token-a").expect("reopen with same token");
        ts2.close().expect("close");
        drop(ts2);

        // a different token must be refused
        match TokenStore::open(dir.path(), "token-b") {
            Err(StoreError::TokenCollision) => {}
            other => panic!("expected TokenCollision, got {other:?}"),
        }
    }

    #[test]
    fn test_list_pagination() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ts = TokenStore::open(dir.path(), "test-token").expect("open");
        for i in 0..25 {
            ts.save("t", "", &format!("msg-{i}"), None).expect("save");
        }

        // first page, newest first
        let page1 = ts.list(0, 10).expect("list");
        assert_eq!(page1.messages.len(), 10);
        assert_eq!(page1.total, 25);
        assert!(page1.has_more);
        assert!(page1.next_id > 0);
        assert_eq!(page1.messages[0].content, "msg-24");
        for w in page1.messages.windows(2) {
            assert!(w[0].id > w[1].id);
        }

        // second page continues strictly below the cursor, no overlap
        let page2 = ts.list(page1.next_id, 10).expect("list");
        assert_eq!(page2.messages.len(), 10);
        assert!(page2.has_more);
        let ids1: Vec<u64> = page1.messages.iter().map(|m| m.id).collect();
        let ids2: Vec<u64> = page2.messages.iter().map(|m| m.id).collect();
        assert!(ids1.iter().all(|id| !ids2.contains(id)));
        assert!(ids1.iter().min() > ids2.iter().max());

        // last page is short and final
        let page3 = ts.list(page2.next_id, 10).expect("list");
        assert_eq!(page3.messages.len(), 5);
        assert!(!page3.has_more);
        assert_eq!(page3.next_id, 0);

        ts.close().expect("close");
    }

    #[test]
    fn test_list_page_size_clamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ts = TokenStore::open(dir.path(), "test-token").expect("open");
        for _ in 0..3 {
            ts.save("t", "", "c", None).expect("save");
        }

        // zero and negative select the default of 20
        assert_eq!(ts.list(0, 0).expect("list").page_size, 20);
        assert_eq!(ts.list(0, -5).expect("list").page_size, 20);
        // above 100 is clamped
        assert_eq!(ts.list(0, 1000).expect("list").page_size, 100);
        assert_eq!(ts.list(0, 1).expect("list").messages.len(), 1);
        ts.close().expect("close");
    }

    #[test]
    fn test_exact_page_boundary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ts = TokenStore::open(dir.path(), "test-token").expect("open");
        for _ in 0..10 {
            ts.save("t", "", "c", None).expect("save");
        }
        // exactly one full page: no further page exists
        let page = ts.list(0, 10).expect("list");
        assert_eq!(page.messages.len(), 10);
        assert!(!page.has_more);
        assert_eq!(page.next_id, 0);
        ts.close().expect("close");
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let last_id = {
            let ts = TokenStore::open(dir.path(), "test-token").expect("open");
            let mut last = 0;
            for _ in 0..5 {
                last = ts.save("t", "", "c", None).expect("save").id;
            }
            ts.close().expect("close");
            last
        };

        let ts = TokenStore::open(dir.path(), "test-token").expect("reopen");
        assert_eq!(ts.count(), 5);
        let page = ts.list(0, 10).expect("list");
        assert_eq!(page.messages.len(), 5);
        // ids keep increasing after a restart; gaps are allowed
        let msg = ts.save("t", "", "after-reopen", None).expect("save");
        assert!(msg.id > last_id);
        ts.close().expect("close");
    }

    #[test]
    fn test_count_recomputed_when_checkpoint_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let ts = TokenStore::open(dir.path(), "test-token").expect("open");
            for _ in 0..7 {
                ts.save("t", "", "c", None).expect("save");
            }
            // drop the checkpoint to force a rescan on reopen
            ts.db.remove(META_COUNT_KEY).expect("remove");
            ts.db.flush().expect("flush");
            ts.seq.lock().release().expect("release");
        }
        let ts = TokenStore::open(dir.path(), "test-token").expect("reopen");
        assert_eq!(ts.count(), 7);
        ts.close().expect("close");
    }

    #[test]
    fn test_count_checkpoint_drift_is_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ts = TokenStore::open(dir.path(), "test-token").expect("open");
        for _ in 0..250 {
            ts.save("t", "", "c", None).expect("save");
        }
        assert_eq!(ts.count(), 250);

        // the checkpoint lands every 100 saves, so the persisted count may
        // lag the live one by at most 99
        let persisted = ts
            .db
            .get(META_COUNT_KEY)
            .expect("get")
            .map(|v| decode_u64(&v))
            .unwrap_or_default();
        assert_eq!(persisted, 200);
        assert!(ts.count() as u64 - persisted < 100);
        ts.close().expect("close");
    }

    #[test]
    fn test_manager_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m = Manager::new(dir.path(), false);
        assert!(!m.is_enabled());
        assert!(m.save("tok", "t", "", "c", None).expect("save").is_none());
        let result = m.list("tok", 0, 10).expect("list");
        assert!(result.messages.is_empty());
        assert_eq!(m.count("tok"), 0);
        // nothing was written to disk
        assert!(!dir.path().join(STORE_DIR_NAME).exists());
    }

    #[test]
    fn test_manager_token_isolation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m = Manager::new(dir.path(), true);

        m.save("token-a", "t", "", "for-a", None).expect("save");
        m.save("token-a", "t", "", "for-a-2", None).expect("save");
        m.save("token-b", "t", "", "for-b", None).expect("save");

        assert_eq!(m.count("token-a"), 2);
        assert_eq!(m.count("token-b"), 1);

        let a = m.list("token-a", 0, 10).expect("list");
        assert_eq!(a.messages.len(), 2);
        assert!(a.messages.iter().all(|msg| msg.content.starts_with("for-a")));

        let b = m.list("token-b", 0, 10).expect("list");
        assert_eq!(b.messages.len(), 1);
        assert_eq!(b.messages[0].content, "for-b");

        m.close();
    }

    #[test]
    fn test_manager_concurrent_saves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m = Arc::new(Manager::new(dir.path(), true));

        let mut handles = Vec::new();
        for t in 0..4 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    m.save("shared-token", "t", "", &format!("{t}-{i}"), None).expect("save");
                }
            }));
        }
        for h in handles {
            h.join().expect("join");
        }

        assert_eq!(m.count("shared-token"), 100);
        let page = m.list("shared-token", 0, 100).expect("list");
        assert_eq!(page.messages.len(), 100);
        // ids are unique across all writers
        let mut ids: Vec<u64> = page.messages.iter().map(|msg| msg.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 100);
        m.close();
    }

    #[test]
    fn test_manager_close_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m = Manager::new(dir.path(), true);
        m.save("tok", "t", "", "c", None).expect("save");
        m.close();
        m.close();
        // reopen after close works
        assert_eq!(m.list("tok", 0, 10).expect("list").messages.len(), 1);
        m.close();
    }
}
