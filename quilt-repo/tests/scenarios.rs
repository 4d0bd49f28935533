//! End-to-end sync scenarios over in-process networks.
//!
//! Each test builds a small topology of repos joined by memory adapter
//! pairs and drives it to quiescence, checking convergence, availability,
//! and persistence behavior from the outside.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use quilt_repo::automerge::transaction::Transactable;
use quilt_repo::automerge::{self, ReadDoc};
use quilt_repo::{
    DocHandle, DocumentId, HandleState, MemoryNetwork, MemoryNetworkAdapter, MemoryStorage,
    NetworkAdapter, NetworkError, NetworkEvent, Repo, RepoConfig, RepoEvent, RepoMessage,
    StorageAdapter, StorageError, StorageKey, StoredChunk,
};

const QUIESCENCE: Duration = Duration::from_secs(5);

fn put(handle: &DocHandle, key: &str, value: &str) {
    handle.update(|doc| {
        doc.transact::<_, _, automerge::AutomergeError>(|tx| {
            tx.put(automerge::ROOT, key, value)?;
            Ok(())
        })
        .unwrap();
    });
}

fn get(handle: &DocHandle, key: &str) -> Option<String> {
    handle
        .with_document(|doc| match doc.get(automerge::ROOT, key).ok()? {
            Some((automerge::Value::Scalar(s), _)) => match s.as_ref() {
                automerge::ScalarValue::Str(s) => Some(s.to_string()),
                _ => None,
            },
            _ => None,
        })
        .flatten()
}

/// Join two repos with a fresh memory adapter pair, returning the
/// endpoints so tests can sever the link.
fn connect(a: &Repo, b: &Repo) -> (Arc<MemoryNetworkAdapter>, Arc<MemoryNetworkAdapter>) {
    let (a_end, b_end) = MemoryNetwork::pair(a.peer_id().clone(), b.peer_id().clone());
    let a_end = Arc::new(a_end);
    let b_end = Arc::new(b_end);
    a.add_network_adapter(a_end.clone());
    b.add_network_adapter(b_end.clone());
    (a_end, b_end)
}

async fn wait_for_state(handle: &DocHandle, state: HandleState) {
    tokio::time::timeout(QUIESCENCE, handle.wait_for_states(&[state]))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}, stuck in {:?}", handle.state()));
}

async fn wait_for_value(handle: &DocHandle, key: &str, expected: &str) {
    let deadline = tokio::time::timeout(QUIESCENCE, async {
        loop {
            if get(handle, key).as_deref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        deadline.is_ok(),
        "timed out waiting for {key}={expected}, have {:?}",
        get(handle, key)
    );
}

// ===========================================
// S1: hub and spoke
// ===========================================

#[tokio::test]
async fn hub_and_spoke_relays_documents() {
    let alice = Repo::new(RepoConfig::new("alice"));
    let bob = Repo::new(RepoConfig::new("bob"));
    let charlie = Repo::new(RepoConfig::new("charlie"));

    // Bob is the hub; alice and charlie never connect directly
    connect(&alice, &bob);
    connect(&bob, &charlie);

    let doc = alice.create();
    put(&doc, "foo", "bar");

    let at_charlie = charlie.find(&doc.url()).await.unwrap();
    wait_for_state(&at_charlie, HandleState::Ready).await;
    wait_for_value(&at_charlie, "foo", "bar").await;
}

// ===========================================
// S2: all-to-all concurrent edits
// ===========================================

#[tokio::test]
async fn full_mesh_merges_concurrent_edits() {
    let alice = Repo::new(RepoConfig::new("alice"));
    let bob = Repo::new(RepoConfig::new("bob"));
    let charlie = Repo::new(RepoConfig::new("charlie"));

    connect(&alice, &bob);
    connect(&bob, &charlie);
    connect(&alice, &charlie);

    let at_alice = alice.create();
    put(&at_alice, "seed", "planted");

    let at_bob = bob.find(&at_alice.url()).await.unwrap();
    let at_charlie = charlie.find(&at_alice.url()).await.unwrap();
    wait_for_state(&at_bob, HandleState::Ready).await;
    wait_for_state(&at_charlie, HandleState::Ready).await;

    // Concurrent edits on opposite ends of the mesh
    put(&at_alice, "x", "1");
    put(&at_charlie, "y", "2");

    for handle in [&at_alice, &at_bob, &at_charlie] {
        wait_for_value(handle, "x", "1").await;
        wait_for_value(handle, "y", "2").await;
        wait_for_value(handle, "seed", "planted").await;
    }
}

// ===========================================
// S3: unavailable document
// ===========================================

#[tokio::test]
async fn document_nobody_has_becomes_unavailable_exactly_once() {
    let alice = Repo::new(RepoConfig::new("alice"));
    let bob = Repo::new(RepoConfig::new("bob"));
    let charlie = Repo::new(RepoConfig::new("charlie"));

    connect(&alice, &bob);
    connect(&alice, &charlie);

    let mut events = alice.subscribe();
    let missing = DocumentId::random();
    let handle = alice.find_by_id(missing).await.unwrap();

    wait_for_state(&handle, HandleState::Unavailable).await;

    // Exactly one unavailable-document event for this id
    let mut unavailable_events = 0;
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events.try_recv() {
        if event == RepoEvent::UnavailableDocument(missing) {
            unavailable_events += 1;
        }
    }
    assert_eq!(unavailable_events, 1);
}

// ===========================================
// S4: reconnect resumes where sync left off
// ===========================================

/// Counts outbound messages so reconnect traffic can be bounded.
struct CountingAdapter {
    inner: Arc<MemoryNetworkAdapter>,
    sent: Arc<AtomicUsize>,
}

#[async_trait]
impl NetworkAdapter for CountingAdapter {
    async fn recv(&self) -> Result<NetworkEvent, NetworkError> {
        self.inner.recv().await
    }

    async fn send(&self, message: RepoMessage) -> Result<(), NetworkError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.inner.send(message).await
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    async fn close(&self) -> Result<(), NetworkError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn reconnect_resumes_without_message_storm() {
    let alice = Repo::new(RepoConfig::new("alice"));
    let bob = Repo::new(RepoConfig::new("bob"));

    let (alice_end, bob_end) = connect(&alice, &bob);

    let at_alice = alice.create();
    put(&at_alice, "k", "v1");
    let at_bob = bob.find(&at_alice.url()).await.unwrap();
    wait_for_value(&at_bob, "k", "v1").await;

    // Sever the link and edit while bob is away
    bob_end.close().await.unwrap();
    alice_end.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    put(&at_alice, "k", "v2");

    // Reconnect over a fresh transport, counting alice's outbound traffic
    let (alice_end, bob_end) = MemoryNetwork::pair("alice".into(), "bob".into());
    let sent = Arc::new(AtomicUsize::new(0));
    alice.add_network_adapter(Arc::new(CountingAdapter {
        inner: Arc::new(alice_end),
        sent: sent.clone(),
    }));
    bob.add_network_adapter(Arc::new(bob_end));

    wait_for_value(&at_bob, "k", "v2").await;

    // Let any runaway resend loop show itself before counting
    tokio::time::sleep(Duration::from_millis(200)).await;
    let outbound = sent.load(Ordering::SeqCst);
    assert!(
        outbound <= 10,
        "reconnect produced {outbound} outbound messages"
    );
}

// ===========================================
// S5: persistence round-trip
// ===========================================

#[tokio::test]
async fn restart_restores_documents_without_network() {
    let storage = MemoryStorage::new();
    let url;
    {
        let repo = Repo::new(RepoConfig::new("alice").with_storage(Arc::new(storage.clone())));
        let handle = repo.create();
        put(&handle, "title", "field notes");
        put(&handle, "body", "day one");
        url = handle.url();
        repo.flush().await.unwrap();
    }

    // A fresh repo over the same storage, no network anywhere
    let repo = Repo::new(RepoConfig::new("alice").with_storage(Arc::new(storage)));
    let handle = repo.find(&url).await.unwrap();

    assert_eq!(handle.state(), HandleState::Ready);
    assert_eq!(get(&handle, "title").as_deref(), Some("field notes"));
    assert_eq!(get(&handle, "body").as_deref(), Some("day one"));
}

// ===========================================
// S6: pending buffer drains after a slow load
// ===========================================

/// Storage adapter whose loads block until the test opens the gate.
#[derive(Clone)]
struct GatedStorage {
    inner: MemoryStorage,
    gate: watch::Sender<bool>,
}

impl GatedStorage {
    fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            inner: MemoryStorage::new(),
            gate,
        }
    }

    fn open(&self) {
        self.gate.send_replace(true);
    }

    async fn wait_open(&self) {
        let mut rx = self.gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl StorageAdapter for GatedStorage {
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        self.wait_open().await;
        self.inner.load(key).await
    }

    async fn save(&self, key: &StorageKey, data: &[u8]) -> Result<(), StorageError> {
        self.inner.save(key, data).await
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), StorageError> {
        self.inner.remove(key).await
    }

    async fn load_range(&self, prefix: &StorageKey) -> Result<Vec<StoredChunk>, StorageError> {
        self.wait_open().await;
        self.inner.load_range(prefix).await
    }

    async fn remove_range(&self, prefix: &StorageKey) -> Result<(), StorageError> {
        self.inner.remove_range(prefix).await
    }
}

#[tokio::test]
async fn messages_buffered_during_load_apply_after_it() {
    let alice = Repo::new(RepoConfig::new("alice"));
    let gated = GatedStorage::new();
    let bob = Repo::new(RepoConfig::new("bob").with_storage(Arc::new(gated.clone())));

    connect(&alice, &bob);
    let mut bob_events = bob.subscribe();

    // Alice announces and edits while bob's storage load is stuck
    let at_alice = alice.create();
    put(&at_alice, "foo", "bar");

    // Bob hears about the document the moment the first message arrives
    let document_id = *at_alice.document_id();
    tokio::time::timeout(QUIESCENCE, async {
        loop {
            if let Ok(RepoEvent::DocumentAdded(id)) = bob_events.recv().await {
                if id == document_id {
                    break;
                }
            }
        }
    })
    .await
    .expect("bob never heard about the document");

    put(&at_alice, "foo", "baz");
    put(&at_alice, "extra", "1");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The handle is cached, so this does not touch the gated storage
    let at_bob = bob.find_by_id(document_id).await.unwrap();
    assert_eq!(at_bob.state(), HandleState::Loading);

    gated.open();

    wait_for_state(&at_bob, HandleState::Ready).await;
    wait_for_value(&at_bob, "foo", "baz").await;
    wait_for_value(&at_bob, "extra", "1").await;
}
