use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use depot_contract::{
    AccountDirectory, Authorization, AuthorizationHandle, ChatId, CodeChallenge, ConversationId,
    DepotError, ExternalMessageId, InboundMessage, MediaKind, MessageStore, Notifier,
    SessionCredential, Transport, TransportConnection, TransportEvent, TransportEventKind,
    TRANSPORT_EVENT_CHANNEL_CAPACITY,
};
use depot_handoff::{CustodyWatcherConfig, HandoffConfig, HandoffCoordinator};
use depot_pool::{PoolReconcilerConfig, SessionPoolManager};
use depot_store::{SqliteAccountDirectory, SqliteMessageStore};
use tokio::sync::mpsc;

const DEPOSITED_CREDENTIAL: &str = "deposited-session";

/// One fake provider account shared by every connection the network
/// hands out, so the pool connection, the watcher connection, and the
/// operator's competing sign-in all observe the same state.
#[derive(Default)]
struct FakeAccountState {
    auth_count: AtomicUsize,
    disconnects: AtomicU64,
    next_forward_id: AtomicI64,
    revoked: AtomicBool,
    senders: StdMutex<BTreeMap<&'static str, Vec<mpsc::Sender<TransportEvent>>>>,
}

impl FakeAccountState {
    async fn emit(&self, kind: TransportEventKind, event: TransportEvent) {
        let senders: Vec<mpsc::Sender<TransportEvent>> = self
            .senders
            .lock()
            .expect("senders lock")
            .get(kind.as_str())
            .cloned()
            .unwrap_or_default();
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }
}

struct FakeNetwork {
    state: Arc<FakeAccountState>,
}

struct FakeConnection {
    state: Arc<FakeAccountState>,
}

#[async_trait]
impl TransportConnection for FakeConnection {
    async fn is_connected(&self) -> bool {
        true
    }
    async fn is_authorized(&self) -> Result<bool, DepotError> {
        Ok(!self.state.revoked.load(Ordering::SeqCst))
    }
    async fn send_code(&mut self, _phone: &str) -> Result<CodeChallenge, DepotError> {
        Ok(CodeChallenge {
            challenge_id: "challenge-1".to_string(),
        })
    }
    async fn sign_in_with_code(
        &mut self,
        _phone: &str,
        _code: &str,
        _challenge: &CodeChallenge,
    ) -> Result<(), DepotError> {
        self.state.auth_count.fetch_max(1, Ordering::SeqCst);
        Ok(())
    }
    async fn sign_in_with_password(&mut self, _secret: &str) -> Result<(), DepotError> {
        Ok(())
    }
    async fn subscribe(
        &mut self,
        kind: TransportEventKind,
    ) -> Result<mpsc::Receiver<TransportEvent>, DepotError> {
        let (sender, receiver) = mpsc::channel(TRANSPORT_EVENT_CHANNEL_CAPACITY);
        self.state
            .senders
            .lock()
            .expect("senders lock")
            .entry(kind.as_str())
            .or_default()
            .push(sender);
        Ok(receiver)
    }
    async fn forward_message(
        &mut self,
        _conversation_id: ConversationId,
        _external_id: ExternalMessageId,
        _target_conversation: ConversationId,
    ) -> Result<ExternalMessageId, DepotError> {
        Ok(9_000 + self.state.next_forward_id.fetch_add(1, Ordering::SeqCst))
    }
    async fn list_authorizations(&mut self) -> Result<Vec<Authorization>, DepotError> {
        if self.state.revoked.load(Ordering::SeqCst) {
            return Err(DepotError::AuthInvalid);
        }
        let count = self.state.auth_count.load(Ordering::SeqCst);
        Ok((0..count)
            .map(|index| Authorization {
                handle: index as AuthorizationHandle,
                is_current: index == 0,
                device_label: format!("device-{index}"),
            })
            .collect())
    }
    async fn revoke_authorization(
        &mut self,
        _handle: AuthorizationHandle,
    ) -> Result<(), DepotError> {
        Ok(())
    }
    async fn export_credential(&self) -> Result<SessionCredential, DepotError> {
        Ok(DEPOSITED_CREDENTIAL.to_string())
    }
    async fn disconnect(&mut self) {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeNetwork {
    async fn begin_login(&self) -> Result<Box<dyn TransportConnection>, DepotError> {
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
    async fn resume(
        &self,
        _credential: &str,
    ) -> Result<Box<dyn TransportConnection>, DepotError> {
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: StdMutex<Vec<(ChatId, String)>>,
}

impl RecordingNotifier {
    fn messages(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<(), DepotError> {
        self.sent
            .lock()
            .expect("sent lock")
            .push((chat_id, text.to_string()));
        Ok(())
    }
}

const OWNER: i64 = 7;
const CHAT: i64 = 99;

#[tokio::test]
async fn integration_full_custody_lifecycle_roundtrip() {
    let state = Arc::new(FakeAccountState::default());
    let transport = Arc::new(FakeNetwork {
        state: state.clone(),
    });
    let directory = Arc::new(SqliteAccountDirectory::open_in_memory().expect("directory"));
    let store = Arc::new(SqliteMessageStore::open_in_memory().expect("store"));
    let notifier = Arc::new(RecordingNotifier::default());

    // deposit: phone -> code -> alias
    let coordinator = HandoffCoordinator::new(
        directory.clone(),
        transport.clone(),
        notifier.clone(),
        HandoffConfig {
            watcher: CustodyWatcherConfig {
                window: Duration::from_secs(10),
                poll_interval: Duration::from_millis(25),
                extend_deadline_on_rate_limit: true,
            },
            ..HandoffConfig::default()
        },
    );
    coordinator
        .start_give(OWNER, CHAT, "+15551234567")
        .await
        .expect("start give");
    coordinator
        .submit_code(OWNER, "123456")
        .await
        .expect("submit code");
    let account = coordinator
        .submit_alias(OWNER, "acct1")
        .await
        .expect("submit alias");
    assert_eq!(account.credential, DEPOSITED_CREDENTIAL);
    assert!(account.monitoring);
    assert!(!account.is_taken);

    // the pool picks the deposit up on its next pass and archives an
    // inbound photo with a forwarded media reference
    let pool = Arc::new(SessionPoolManager::new(
        directory.clone(),
        store.clone(),
        transport.clone(),
        PoolReconcilerConfig {
            interval: Duration::from_millis(20),
            archive_conversation: Some(-100),
        },
    ));
    let summary = pool.reconcile().await.expect("reconcile");
    assert_eq!(summary.connected, 1);
    assert_eq!(pool.live_account_ids().await, vec![account.id]);

    state
        .emit(
            TransportEventKind::Messages,
            TransportEvent::Message(InboundMessage {
                conversation_id: 42,
                external_id: 10,
                sender_id: Some(900),
                text: "holiday pic".to_string(),
                media_kind: Some(MediaKind::Photo),
                sent_unix_ms: 1_760_100_000_000,
            }),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let archived = store.list_messages(account.id, 42).await.expect("list");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].text, "[photo]");
    assert!(archived[0].media_ref.is_some());

    // withdrawal: the operator re-claims the account elsewhere while
    // the watcher is polling
    let display = coordinator
        .begin_take(OWNER, CHAT, "acct1")
        .await
        .expect("begin take");
    assert_eq!(display.phone, "+15551234567");
    tokio::time::sleep(Duration::from_millis(60)).await;
    state.auth_count.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let taken = directory
        .get(account.id)
        .await
        .expect("lookup")
        .expect("account kept");
    assert!(taken.is_taken);
    assert!(notifier
        .messages()
        .iter()
        .any(|text| text.contains("new session detected")));

    coordinator.shutdown().await;
    pool.shutdown_all().await;
    assert!(pool.live_account_ids().await.is_empty());
    // login connection, pool connection, and watcher connection were
    // all released
    assert!(state.disconnects.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn integration_revoked_credential_removes_account_during_take() {
    let state = Arc::new(FakeAccountState::default());
    state.auth_count.store(1, Ordering::SeqCst);
    let transport = Arc::new(FakeNetwork {
        state: state.clone(),
    });
    let directory = Arc::new(SqliteAccountDirectory::open_in_memory().expect("directory"));
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = HandoffCoordinator::new(
        directory.clone(),
        transport,
        notifier.clone(),
        HandoffConfig {
            watcher: CustodyWatcherConfig {
                window: Duration::from_secs(10),
                poll_interval: Duration::from_millis(25),
                extend_deadline_on_rate_limit: true,
            },
            ..HandoffConfig::default()
        },
    );
    let account = directory
        .create(depot_contract::NewAccount {
            owner_id: OWNER,
            alias: "acct1".to_string(),
            phone: "+15551234567".to_string(),
            credential: DEPOSITED_CREDENTIAL.to_string(),
            two_factor_secret: None,
            monitoring: true,
            is_taken: false,
        })
        .await
        .expect("seed account");

    coordinator
        .begin_take(OWNER, CHAT, "acct1")
        .await
        .expect("begin take");
    tokio::time::sleep(Duration::from_millis(60)).await;
    state.revoked.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(directory
        .get(account.id)
        .await
        .expect("lookup")
        .is_none());
    assert!(notifier
        .messages()
        .iter()
        .any(|text| text.contains("revoked")));
    coordinator.shutdown().await;
}
