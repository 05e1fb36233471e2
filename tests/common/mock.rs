//! Mock sources, destinations, and sessions for engine tests.
//!
//! `MockDirectory` stores entries in a shared `MockBackend` keyed by store
//! name, so shadow creation, drop, and promote behave like a real backend
//! with named tables. `MockSessionProvider` counts opens and closes so tests
//! can assert the engine releases its session on every exit path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use source_sync::source::{
    AdminSession, CookieMode, Destination, DestinationError, RawRecord, SearchReply,
    SearchRequest, SessionProvider, Source, SourceError,
};
use source_sync::{Attributes, Identity, Modification, ModifyOp, Result, SyncError};

// =============================================================================
// Sessions
// =============================================================================

pub struct MockSession {
    id: String,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl AdminSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Session provider counting opens and closes.
#[derive(Default)]
pub struct MockSessionProvider {
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    fail: AtomicBool,
}

impl MockSessionProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_open(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every opened session must have been closed.
    pub fn assert_balanced(&self) {
        assert_eq!(self.opened(), self.closed(), "unbalanced session open/close");
    }
}

#[async_trait]
impl SessionProvider for MockSessionProvider {
    async fn open_admin(&self) -> Result<Box<dyn AdminSession>> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Session("mock session refused".to_string()));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            id: format!("session-{}", n),
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// A standalone session for driving feeds directly in tests.
pub fn plain_session() -> MockSession {
    MockSession {
        id: "test-session".to_string(),
        closed: Arc::new(AtomicUsize::new(0)),
    }
}

// =============================================================================
// Changelog source (numbered feed)
// =============================================================================

/// Numbered changelog rows, filtered server-side with `Filter::matches`.
pub struct MockChangelog {
    name: String,
    rows: RwLock<Vec<Attributes>>,
    fail: AtomicBool,
}

impl MockChangelog {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            rows: RwLock::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub async fn push_row(&self, row: Attributes) {
        self.rows.write().await.push(row);
    }

    pub fn fail_next_search(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

/// Build one changelog row in the shape the numbered feed expects.
pub fn changelog_row(
    sequence: u64,
    action: &str,
    target_key: &str,
    changes: &str,
    user: &str,
) -> Attributes {
    let mut row = Attributes::new();
    row.set("changeNumber", sequence.to_string());
    row.set("changeTime", "2026-08-06T12:00:00Z");
    row.set("changeAction", action);
    row.set("targetKey", target_key);
    if !changes.is_empty() {
        row.set("changes", changes);
    }
    if !user.is_empty() {
        row.set("changeUser", user);
    }
    row
}

/// A MODRDN changelog row.
pub fn modrdn_row(sequence: u64, target_key: &str, new_key: &str) -> Attributes {
    let mut row = changelog_row(sequence, "MODRDN", target_key, "", "");
    row.set("newKey", new_key);
    row
}

#[async_trait]
impl Source for MockChangelog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(
        &self,
        _session: &dyn AdminSession,
        request: &SearchRequest,
    ) -> std::result::Result<SearchReply, SourceError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(SourceError("mock changelog unavailable".to_string()));
        }

        let rows = self.rows.read().await;
        let records = rows
            .iter()
            .filter(|row| match &request.filter {
                Some(filter) => filter.matches(row),
                None => true,
            })
            .map(|row| {
                let sequence = row.get_value("changeNumber").unwrap_or("0");
                RawRecord::new(Identity::single("changeNumber", sequence), row.clone())
            })
            .collect();

        Ok(SearchReply {
            records,
            cookie: None,
        })
    }

    async fn count(
        &self,
        _session: &dyn AdminSession,
    ) -> std::result::Result<u64, SourceError> {
        Ok(self.rows.read().await.len() as u64)
    }
}

// =============================================================================
// Tree source (snapshot / load / reconcile)
// =============================================================================

/// A flat record source for full scans.
pub struct MockTreeSource {
    name: String,
    records: RwLock<Vec<RawRecord>>,
}

impl MockTreeSource {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            records: RwLock::new(Vec::new()),
        })
    }

    pub async fn push(&self, identity: Identity, attributes: Attributes) {
        self.records.write().await.push(RawRecord::new(identity, attributes));
    }
}

#[async_trait]
impl Source for MockTreeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(
        &self,
        _session: &dyn AdminSession,
        request: &SearchRequest,
    ) -> std::result::Result<SearchReply, SourceError> {
        let records = self.records.read().await;
        let records = records
            .iter()
            .filter(|r| match &request.base {
                Some(base) => r.identity.is_under(base),
                None => true,
            })
            .cloned()
            .collect();
        Ok(SearchReply {
            records,
            cookie: None,
        })
    }

    async fn count(
        &self,
        _session: &dyn AdminSession,
    ) -> std::result::Result<u64, SourceError> {
        Ok(self.records.read().await.len() as u64)
    }
}

// =============================================================================
// Cookie source (incremental feed)
// =============================================================================

struct CookieInner {
    baseline: Vec<RawRecord>,
    /// (epoch, record) pairs; a scan resumed from cookie `c` returns records
    /// with epoch > c.
    changes: Vec<(u64, RawRecord)>,
}

/// Incremental-replication source issuing epoch-counter cookies.
pub struct MockCookieSource {
    name: String,
    inner: RwLock<CookieInner>,
    epoch: AtomicU64,
}

impl MockCookieSource {
    pub fn new(name: &str, baseline: Vec<RawRecord>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            inner: RwLock::new(CookieInner {
                baseline,
                changes: Vec::new(),
            }),
            epoch: AtomicU64::new(0),
        })
    }

    /// Record a change at a new epoch.
    pub async fn push_change(&self, record: RawRecord) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.write().await.changes.push((epoch, record));
    }

    fn cookie_bytes(&self) -> Vec<u8> {
        self.epoch.load(Ordering::SeqCst).to_be_bytes().to_vec()
    }

    fn parse_cookie(cookie: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        let len = cookie.len().min(8);
        bytes[8 - len..].copy_from_slice(&cookie[cookie.len() - len..]);
        u64::from_be_bytes(bytes)
    }
}

#[async_trait]
impl Source for MockCookieSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(
        &self,
        _session: &dyn AdminSession,
        request: &SearchRequest,
    ) -> std::result::Result<SearchReply, SourceError> {
        let inner = self.inner.read().await;
        match &request.cookie {
            CookieMode::Request => Ok(SearchReply {
                records: inner.baseline.clone(),
                cookie: Some(self.cookie_bytes()),
            }),
            CookieMode::Resume(cookie) => {
                let since = Self::parse_cookie(cookie);
                let records = inner
                    .changes
                    .iter()
                    .filter(|(epoch, _)| *epoch > since)
                    .map(|(_, r)| r.clone())
                    .collect();
                Ok(SearchReply {
                    records,
                    cookie: Some(self.cookie_bytes()),
                })
            }
            CookieMode::None => Ok(SearchReply {
                records: inner.baseline.clone(),
                cookie: None,
            }),
        }
    }

    async fn count(
        &self,
        _session: &dyn AdminSession,
    ) -> std::result::Result<u64, SourceError> {
        Ok(self.inner.read().await.baseline.len() as u64)
    }
}

// =============================================================================
// Destination
// =============================================================================

type Store = BTreeMap<Identity, Attributes>;

/// Shared set of named stores, standing in for a backend with named tables.
///
/// Failure injection is keyed by store name so that tests can target stores
/// the engine creates itself (load-path shadows are named `<live>_tmp`).
#[derive(Default)]
pub struct MockBackend {
    stores: RwLock<HashMap<String, Store>>,
    fail_drop: RwLock<HashSet<String>>,
    fail_promote: RwLock<HashSet<String>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot one store's entries, or `None` if the store does not exist.
    pub async fn entries(&self, name: &str) -> Option<Store> {
        self.stores.read().await.get(name).cloned()
    }

    pub async fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Make the next `drop_store` of the named store fail.
    pub async fn fail_next_drop(&self, name: &str) {
        self.fail_drop.write().await.insert(name.to_string());
    }

    /// Make the next `promote` of the named store fail.
    pub async fn fail_next_promote(&self, name: &str) {
        self.fail_promote.write().await.insert(name.to_string());
    }
}

/// Destination over one named store in a [`MockBackend`].
pub struct MockDirectory {
    name: String,
    backend: Arc<MockBackend>,
}

impl MockDirectory {
    pub async fn create(backend: &Arc<MockBackend>, name: &str) -> Arc<Self> {
        backend
            .stores
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Arc::new(Self {
            name: name.to_string(),
            backend: Arc::clone(backend),
        })
    }

    /// Insert an entry directly, bypassing the engine.
    pub async fn insert_directly(&self, identity: Identity, attributes: Attributes) {
        let mut stores = self.backend.stores.write().await;
        stores
            .entry(self.name.clone())
            .or_default()
            .insert(identity, attributes);
    }

    fn apply_modification(current: &mut Attributes, modification: &Modification) {
        match modification.op {
            ModifyOp::Replace => {
                current.remove(&modification.attribute);
                for value in &modification.values {
                    current.add_value(modification.attribute.clone(), value.clone());
                }
            }
            ModifyOp::Add => {
                for value in &modification.values {
                    current.add_value(modification.attribute.clone(), value.clone());
                }
            }
            ModifyOp::Delete => {
                if modification.values.is_empty() {
                    current.remove(&modification.attribute);
                } else if let Some(values) = current.get(&modification.attribute) {
                    let kept: Vec<String> = values
                        .iter()
                        .filter(|v| !modification.values.contains(v))
                        .cloned()
                        .collect();
                    current.remove(&modification.attribute);
                    for value in kept {
                        current.add_value(modification.attribute.clone(), value);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Destination for MockDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(
        &self,
        _session: &dyn AdminSession,
        identity: &Identity,
        attributes: &Attributes,
    ) -> std::result::Result<(), DestinationError> {
        let mut stores = self.backend.stores.write().await;
        let store = stores
            .get_mut(&self.name)
            .ok_or_else(|| DestinationError::Other(format!("store {} missing", self.name)))?;
        // Idempotent by identity: re-adding replaces the entry.
        store.insert(identity.clone(), attributes.clone());
        Ok(())
    }

    async fn modify(
        &self,
        _session: &dyn AdminSession,
        identity: &Identity,
        modifications: &[Modification],
    ) -> std::result::Result<(), DestinationError> {
        let mut stores = self.backend.stores.write().await;
        let store = stores
            .get_mut(&self.name)
            .ok_or_else(|| DestinationError::Other(format!("store {} missing", self.name)))?;
        let current = store
            .get_mut(identity)
            .ok_or_else(|| DestinationError::NotFound(identity.clone()))?;
        for modification in modifications {
            Self::apply_modification(current, modification);
        }
        Ok(())
    }

    async fn rename(
        &self,
        _session: &dyn AdminSession,
        identity: &Identity,
        new_identity: &Identity,
    ) -> std::result::Result<(), DestinationError> {
        let mut stores = self.backend.stores.write().await;
        let store = stores
            .get_mut(&self.name)
            .ok_or_else(|| DestinationError::Other(format!("store {} missing", self.name)))?;
        let attributes = store
            .remove(identity)
            .ok_or_else(|| DestinationError::NotFound(identity.clone()))?;
        store.insert(new_identity.clone(), attributes);
        Ok(())
    }

    async fn delete(
        &self,
        _session: &dyn AdminSession,
        identity: &Identity,
    ) -> std::result::Result<(), DestinationError> {
        let mut stores = self.backend.stores.write().await;
        let store = stores
            .get_mut(&self.name)
            .ok_or_else(|| DestinationError::Other(format!("store {} missing", self.name)))?;
        store
            .remove(identity)
            .map(|_| ())
            .ok_or_else(|| DestinationError::NotFound(identity.clone()))
    }

    async fn clear(
        &self,
        _session: &dyn AdminSession,
    ) -> std::result::Result<(), DestinationError> {
        let mut stores = self.backend.stores.write().await;
        let store = stores
            .get_mut(&self.name)
            .ok_or_else(|| DestinationError::Other(format!("store {} missing", self.name)))?;
        store.clear();
        Ok(())
    }

    async fn count(
        &self,
        _session: &dyn AdminSession,
    ) -> std::result::Result<u64, DestinationError> {
        let stores = self.backend.stores.read().await;
        let store = stores
            .get(&self.name)
            .ok_or_else(|| DestinationError::Other(format!("store {} missing", self.name)))?;
        Ok(store.len() as u64)
    }

    async fn fetch(
        &self,
        _session: &dyn AdminSession,
        identity: &Identity,
    ) -> std::result::Result<Option<Attributes>, DestinationError> {
        let stores = self.backend.stores.read().await;
        let store = stores
            .get(&self.name)
            .ok_or_else(|| DestinationError::Other(format!("store {} missing", self.name)))?;
        Ok(store.get(identity).cloned())
    }

    async fn identities(
        &self,
        _session: &dyn AdminSession,
    ) -> std::result::Result<Vec<Identity>, DestinationError> {
        let stores = self.backend.stores.read().await;
        let store = stores
            .get(&self.name)
            .ok_or_else(|| DestinationError::Other(format!("store {} missing", self.name)))?;
        Ok(store.keys().cloned().collect())
    }

    async fn shadow(&self) -> std::result::Result<Arc<dyn Destination>, DestinationError> {
        let shadow_name = format!("{}_tmp", self.name);
        let mut stores = self.backend.stores.write().await;
        stores.insert(shadow_name.clone(), Store::new());
        Ok(Arc::new(Self {
            name: shadow_name,
            backend: Arc::clone(&self.backend),
        }))
    }

    async fn drop_store(
        &self,
        _session: &dyn AdminSession,
    ) -> std::result::Result<(), DestinationError> {
        if self.backend.fail_drop.write().await.remove(&self.name) {
            return Err(DestinationError::Other("mock drop refused".to_string()));
        }
        self.backend.stores.write().await.remove(&self.name);
        Ok(())
    }

    async fn promote(
        &self,
        _session: &dyn AdminSession,
        live_name: &str,
    ) -> std::result::Result<(), DestinationError> {
        if self.backend.fail_promote.write().await.remove(&self.name) {
            return Err(DestinationError::Other("mock promote refused".to_string()));
        }
        let mut stores = self.backend.stores.write().await;
        let store = stores
            .remove(&self.name)
            .ok_or_else(|| DestinationError::Other(format!("store {} missing", self.name)))?;
        stores.insert(live_name.to_string(), store);
        Ok(())
    }
}

/// Attributes with a single `cn` value, for brevity in tests.
pub fn person(cn: &str) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.set("cn", cn);
    attrs
}
