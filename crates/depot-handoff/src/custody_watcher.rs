use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use depot_contract::{
    Account, AccountDirectory, AccountId, AccountUpdate, ChatId, DepotError, Notifier, Transport,
    TransportConnection, TransportEvent, TransportEventKind,
};
use depot_core::redact_phone;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_WATCH_WINDOW_SECONDS: u64 = 60;
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
const VERIFICATION_CODE_PATTERN: &str = r"\b[0-9]{5,6}\b";

#[derive(Debug, Clone)]
/// Timing knobs for the bounded custody watch.
pub struct CustodyWatcherConfig {
    pub window: Duration,
    pub poll_interval: Duration,
    /// Whether a mandated rate-limit wait pushes the watch deadline
    /// out by the same amount instead of eating into the window.
    pub extend_deadline_on_rate_limit: bool,
}

impl Default for CustodyWatcherConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_WATCH_WINDOW_SECONDS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS),
            extend_deadline_on_rate_limit: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Terminal state of one custody watch.
pub enum WatcherOutcome {
    /// The stored credential is no longer valid; the account record
    /// was deleted.
    CredentialRevoked,
    /// A competing sign-in appeared during the window; custody was
    /// marked taken, the record kept.
    NewSessionDetected,
    /// The window elapsed with no change; nothing was mutated.
    WindowElapsed,
    Cancelled,
}

/// Handle of one running watcher task.
pub(crate) struct WatcherHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// Supervised set of in-flight custody watchers, at most one per
/// account. Registering a second watcher for an account stops the
/// first before the new one is recorded.
#[derive(Default)]
pub struct WatcherRegistry {
    watchers: Mutex<BTreeMap<AccountId, WatcherHandle>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts whose watcher task is still running. Watchers that
    /// finished on their own are dropped from the registry here.
    pub async fn active_account_ids(&self) -> Vec<AccountId> {
        let mut map = self.watchers.lock().await;
        map.retain(|_, handle| !handle.is_finished());
        map.keys().copied().collect()
    }

    pub(crate) async fn replace(&self, account_id: AccountId, handle: WatcherHandle) {
        let previous = {
            let mut map = self.watchers.lock().await;
            map.retain(|_, handle| !handle.is_finished());
            map.insert(account_id, handle)
        };
        if let Some(mut previous) = previous {
            debug!(account_id, "replacing in-flight custody watcher");
            previous.stop().await;
        }
    }

    /// Cancels every outstanding watcher; each one disconnects its
    /// transport before its task joins.
    pub async fn shutdown_all(&self) {
        let drained: Vec<WatcherHandle> = {
            let mut map = self.watchers.lock().await;
            std::mem::take(&mut *map).into_values().collect()
        };
        for mut handle in drained {
            handle.stop().await;
        }
    }
}

/// Spawns the bounded watch for one withdrawn account. The task races
/// the operator's manual re-login: it polls the authorization count
/// until the window closes, while relaying any verification code seen
/// on the service conversation to the operator's chat.
pub(crate) fn spawn_custody_watcher(
    directory: Arc<dyn AccountDirectory>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    config: CustodyWatcherConfig,
    account: Account,
    chat_id: ChatId,
) -> WatcherHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut connection = match transport.resume(&account.credential).await {
            Ok(connection) => connection,
            Err(DepotError::AuthInvalid) => {
                finish_revoked(&directory, &notifier, &account, chat_id).await;
                return;
            }
            Err(error) => {
                warn!(
                    account_id = account.id,
                    error = %error,
                    "custody watch could not start"
                );
                let _ = notifier
                    .send(chat_id, &format!("custody watch could not start: {error}"))
                    .await;
                return;
            }
        };
        let outcome = tokio::select! {
            _ = &mut shutdown_rx => WatcherOutcome::Cancelled,
            outcome = watch_for_custody_change(
                connection.as_mut(),
                &directory,
                &notifier,
                &config,
                &account,
                chat_id,
            ) => outcome,
        };
        // released on every exit path, cancellation included
        connection.disconnect().await;
        info!(account_id = account.id, outcome = ?outcome, "custody watch finished");
    });
    WatcherHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}

async fn watch_for_custody_change(
    connection: &mut dyn TransportConnection,
    directory: &Arc<dyn AccountDirectory>,
    notifier: &Arc<dyn Notifier>,
    config: &CustodyWatcherConfig,
    account: &Account,
    chat_id: ChatId,
) -> WatcherOutcome {
    match connection.is_authorized().await {
        Ok(true) => {}
        Ok(false) | Err(DepotError::AuthInvalid) => {
            return finish_revoked(directory, notifier, account, chat_id).await;
        }
        Err(error) => {
            warn!(account_id = account.id, error = %error, "authorization probe failed");
        }
    }

    let code_pattern =
        Regex::new(VERIFICATION_CODE_PATTERN).expect("verification code pattern compiles");
    let (mut notifications, mut notifications_open) = match connection
        .subscribe(TransportEventKind::ServiceNotifications)
        .await
    {
        Ok(receiver) => (receiver, true),
        Err(error) => {
            debug!(account_id = account.id, error = %error, "code relay unavailable");
            let (_closed_tx, receiver) = mpsc::channel(1);
            (receiver, false)
        }
    };

    let mut deadline = tokio::time::Instant::now() + config.window;
    let mut baseline: Option<usize> = None;

    loop {
        if tokio::time::Instant::now() >= deadline {
            let _ = notifier
                .send(
                    chat_id,
                    &format!(
                        "no new session detected on {} within the watch window",
                        redact_phone(&account.phone)
                    ),
                )
                .await;
            return WatcherOutcome::WindowElapsed;
        }

        match connection.list_authorizations().await {
            Ok(authorizations) => {
                let count = authorizations.len();
                match baseline {
                    None => baseline = Some(count),
                    Some(baseline_count) if count > baseline_count => {
                        if let Err(error) = directory
                            .update(
                                account.id,
                                AccountUpdate {
                                    is_taken: Some(true),
                                    ..AccountUpdate::default()
                                },
                            )
                            .await
                        {
                            warn!(
                                account_id = account.id,
                                error = %error,
                                "failed to mark account taken"
                            );
                        }
                        let _ = notifier
                            .send(
                                chat_id,
                                &format!(
                                    "new session detected on {}, account marked taken",
                                    redact_phone(&account.phone)
                                ),
                            )
                            .await;
                        return WatcherOutcome::NewSessionDetected;
                    }
                    Some(_) => {}
                }
            }
            Err(DepotError::AuthInvalid) => {
                return finish_revoked(directory, notifier, account, chat_id).await;
            }
            Err(DepotError::RateLimited { wait_seconds }) => {
                let wait = Duration::from_secs(wait_seconds);
                debug!(account_id = account.id, wait_seconds, "rate limited mid-watch");
                tokio::time::sleep(wait).await;
                if config.extend_deadline_on_rate_limit {
                    deadline += wait;
                }
                continue;
            }
            Err(error) => {
                warn!(account_id = account.id, error = %error, "authorization poll failed");
            }
        }

        // sleep one poll interval, relaying verification codes as
        // they arrive
        let sleep = tokio::time::sleep(config.poll_interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                maybe_event = notifications.recv(), if notifications_open => {
                    match maybe_event {
                        Some(TransportEvent::ServiceNotification { text }) => {
                            relay_verification_code(notifier, chat_id, &code_pattern, &text).await;
                        }
                        Some(_) => {}
                        None => notifications_open = false,
                    }
                }
            }
        }
    }
}

async fn finish_revoked(
    directory: &Arc<dyn AccountDirectory>,
    notifier: &Arc<dyn Notifier>,
    account: &Account,
    chat_id: ChatId,
) -> WatcherOutcome {
    if let Err(error) = directory.delete(account.id).await {
        warn!(
            account_id = account.id,
            error = %error,
            "failed to delete account with revoked credential"
        );
    }
    let _ = notifier
        .send(
            chat_id,
            &format!(
                "session for {} is revoked, account removed",
                redact_phone(&account.phone)
            ),
        )
        .await;
    WatcherOutcome::CredentialRevoked
}

async fn relay_verification_code(
    notifier: &Arc<dyn Notifier>,
    chat_id: ChatId,
    code_pattern: &Regex,
    text: &str,
) {
    let Some(code) = code_pattern.find(text) else {
        return;
    };
    if let Err(error) = notifier
        .send(
            chat_id,
            &format!("verification code observed: {}", code.as_str()),
        )
        .await
    {
        debug!(error = %error, "code relay delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use depot_contract::{
        Authorization, AuthorizationHandle, CodeChallenge, ConversationId, ExternalMessageId,
        NewAccount, TRANSPORT_EVENT_CHANNEL_CAPACITY,
    };
    use depot_store::SqliteAccountDirectory;

    #[derive(Default)]
    struct WatchState {
        auth_count: AtomicUsize,
        revoked: AtomicBool,
        rate_limit_once: AtomicBool,
        resume_fails_auth: AtomicBool,
        disconnects: AtomicU64,
        notification_senders: StdMutex<Vec<mpsc::Sender<TransportEvent>>>,
    }

    impl WatchState {
        async fn send_notification(&self, text: &str) {
            let senders: Vec<mpsc::Sender<TransportEvent>> = self
                .notification_senders
                .lock()
                .expect("senders lock")
                .clone();
            for sender in senders {
                let _ = sender
                    .send(TransportEvent::ServiceNotification {
                        text: text.to_string(),
                    })
                    .await;
            }
        }
    }

    struct WatchTransport {
        state: Arc<WatchState>,
    }

    struct WatchConnection {
        state: Arc<WatchState>,
    }

    #[async_trait]
    impl TransportConnection for WatchConnection {
        async fn is_connected(&self) -> bool {
            true
        }
        async fn is_authorized(&self) -> Result<bool, DepotError> {
            Ok(!self.state.revoked.load(Ordering::SeqCst))
        }
        async fn send_code(&mut self, _phone: &str) -> Result<CodeChallenge, DepotError> {
            unimplemented!("not used by watcher tests")
        }
        async fn sign_in_with_code(
            &mut self,
            _phone: &str,
            _code: &str,
            _challenge: &CodeChallenge,
        ) -> Result<(), DepotError> {
            unimplemented!("not used by watcher tests")
        }
        async fn sign_in_with_password(&mut self, _secret: &str) -> Result<(), DepotError> {
            unimplemented!("not used by watcher tests")
        }
        async fn subscribe(
            &mut self,
            kind: TransportEventKind,
        ) -> Result<mpsc::Receiver<TransportEvent>, DepotError> {
            let (sender, receiver) = mpsc::channel(TRANSPORT_EVENT_CHANNEL_CAPACITY);
            if kind == TransportEventKind::ServiceNotifications {
                self.state
                    .notification_senders
                    .lock()
                    .expect("senders lock")
                    .push(sender);
            }
            Ok(receiver)
        }
        async fn forward_message(
            &mut self,
            _conversation_id: ConversationId,
            _external_id: ExternalMessageId,
            _target_conversation: ConversationId,
        ) -> Result<ExternalMessageId, DepotError> {
            unimplemented!("not used by watcher tests")
        }
        async fn list_authorizations(&mut self) -> Result<Vec<Authorization>, DepotError> {
            if self.state.revoked.load(Ordering::SeqCst) {
                return Err(DepotError::AuthInvalid);
            }
            if self.state.rate_limit_once.swap(false, Ordering::SeqCst) {
                return Err(DepotError::RateLimited { wait_seconds: 0 });
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
        async fn export_credential(&self) -> Result<String, DepotError> {
            Ok("credential".to_string())
        }
        async fn disconnect(&mut self) {
            self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for WatchTransport {
        async fn begin_login(&self) -> Result<Box<dyn TransportConnection>, DepotError> {
            unimplemented!("not used by watcher tests")
        }
        async fn resume(
            &self,
            _credential: &str,
        ) -> Result<Box<dyn TransportConnection>, DepotError> {
            if self.state.resume_fails_auth.load(Ordering::SeqCst) {
                return Err(DepotError::AuthInvalid);
            }
            Ok(Box::new(WatchConnection {
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

    struct WatchFixture {
        directory: Arc<SqliteAccountDirectory>,
        state: Arc<WatchState>,
        transport: Arc<WatchTransport>,
        notifier: Arc<RecordingNotifier>,
        account: Account,
    }

    async fn build_fixture(initial_auth_count: usize) -> WatchFixture {
        let directory = Arc::new(SqliteAccountDirectory::open_in_memory().expect("directory"));
        let account = directory
            .create(NewAccount {
                owner_id: 7,
                alias: "acct1".to_string(),
                phone: "+15551234567".to_string(),
                credential: "session-acct1".to_string(),
                two_factor_secret: None,
                monitoring: true,
                is_taken: false,
            })
            .await
            .expect("seed account");
        let state = Arc::new(WatchState::default());
        state.auth_count.store(initial_auth_count, Ordering::SeqCst);
        let transport = Arc::new(WatchTransport {
            state: state.clone(),
        });
        WatchFixture {
            directory,
            state,
            transport,
            notifier: Arc::new(RecordingNotifier::default()),
            account,
        }
    }

    fn fast_config() -> CustodyWatcherConfig {
        CustodyWatcherConfig {
            window: Duration::from_millis(400),
            poll_interval: Duration::from_millis(25),
            extend_deadline_on_rate_limit: true,
        }
    }

    fn spawn(fixture: &WatchFixture, config: CustodyWatcherConfig) -> WatcherHandle {
        spawn_custody_watcher(
            fixture.directory.clone(),
            fixture.transport.clone(),
            fixture.notifier.clone(),
            config,
            fixture.account.clone(),
            99,
        )
    }

    #[test]
    fn unit_watcher_outcome_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(WatcherOutcome::NewSessionDetected).expect("serialize"),
            serde_json::json!("new_session_detected")
        );
        assert_eq!(
            serde_json::to_value(WatcherOutcome::CredentialRevoked).expect("serialize"),
            serde_json::json!("credential_revoked")
        );
    }

    #[tokio::test]
    async fn functional_new_session_marks_account_taken_without_delete() {
        let fixture = build_fixture(1).await;
        let mut handle = spawn(&fixture, fast_config());

        tokio::time::sleep(Duration::from_millis(60)).await;
        fixture.state.auth_count.store(2, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.stop().await;

        let account = fixture
            .directory
            .get(fixture.account.id)
            .await
            .expect("lookup")
            .expect("account kept");
        assert!(account.is_taken);
        assert_eq!(fixture.state.disconnects.load(Ordering::SeqCst), 1);
        assert!(fixture
            .notifier
            .messages()
            .iter()
            .any(|text| text.contains("new session detected")));
    }

    #[tokio::test]
    async fn functional_revoked_credential_deletes_account() {
        let fixture = build_fixture(1).await;
        fixture.state.revoked.store(true, Ordering::SeqCst);
        let mut handle = spawn(&fixture, fast_config());
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop().await;

        assert!(fixture
            .directory
            .get(fixture.account.id)
            .await
            .expect("lookup")
            .is_none());
        assert_eq!(fixture.state.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn functional_revoked_at_resume_deletes_account_without_connection() {
        let fixture = build_fixture(1).await;
        fixture.state.resume_fails_auth.store(true, Ordering::SeqCst);
        let mut handle = spawn(&fixture, fast_config());
        handle.stop().await;

        assert!(fixture
            .directory
            .get(fixture.account.id)
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn functional_elapsed_window_leaves_account_untouched() {
        let fixture = build_fixture(1).await;
        let mut handle = spawn(&fixture, fast_config());
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.stop().await;

        let account = fixture
            .directory
            .get(fixture.account.id)
            .await
            .expect("lookup")
            .expect("account kept");
        assert!(!account.is_taken);
        assert!(fixture
            .notifier
            .messages()
            .iter()
            .any(|text| text.contains("no new session detected")));
    }

    #[tokio::test]
    async fn regression_rate_limit_does_not_terminate_watch() {
        let fixture = build_fixture(1).await;
        fixture.state.rate_limit_once.store(true, Ordering::SeqCst);
        let mut handle = spawn(&fixture, fast_config());

        tokio::time::sleep(Duration::from_millis(60)).await;
        fixture.state.auth_count.store(2, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.stop().await;

        let account = fixture
            .directory
            .get(fixture.account.id)
            .await
            .expect("lookup")
            .expect("account kept");
        assert!(account.is_taken);
    }

    #[tokio::test]
    async fn functional_service_codes_are_relayed_to_operator() {
        let fixture = build_fixture(1).await;
        let mut handle = spawn(&fixture, fast_config());

        tokio::time::sleep(Duration::from_millis(60)).await;
        fixture
            .state
            .send_notification("Your login code: 73205. Do not share it.")
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop().await;

        assert!(fixture
            .notifier
            .messages()
            .iter()
            .any(|text| text.contains("73205")));
    }

    #[tokio::test]
    async fn integration_registry_shutdown_disconnects_outstanding_watchers() {
        let fixture = build_fixture(1).await;
        let registry = WatcherRegistry::new();
        let long_config = CustodyWatcherConfig {
            window: Duration::from_secs(60),
            ..fast_config()
        };
        registry
            .replace(fixture.account.id, spawn(&fixture, long_config))
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        registry.shutdown_all().await;
        assert_eq!(fixture.state.disconnects.load(Ordering::SeqCst), 1);
        assert!(registry.active_account_ids().await.is_empty());
    }

    #[tokio::test]
    async fn regression_second_take_replaces_previous_watcher() {
        let fixture = build_fixture(1).await;
        let registry = WatcherRegistry::new();
        let long_config = CustodyWatcherConfig {
            window: Duration::from_secs(60),
            ..fast_config()
        };
        registry
            .replace(fixture.account.id, spawn(&fixture, long_config.clone()))
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        registry
            .replace(fixture.account.id, spawn(&fixture, long_config))
            .await;
        // the first watcher is stopped and disconnected before the
        // replacement is recorded
        assert_eq!(fixture.state.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_account_ids().await, vec![fixture.account.id]);

        registry.shutdown_all().await;
        assert_eq!(fixture.state.disconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn regression_finished_watcher_leaves_registry() {
        let fixture = build_fixture(1).await;
        let registry = WatcherRegistry::new();
        let short_config = CustodyWatcherConfig {
            window: Duration::from_millis(80),
            ..fast_config()
        };
        registry
            .replace(fixture.account.id, spawn(&fixture, short_config))
            .await;
        assert_eq!(registry.active_account_ids().await, vec![fixture.account.id]);

        // Let the window elapse; the watcher exits on its own and must
        // no longer be reported as active.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(registry.active_account_ids().await.is_empty());

        registry.shutdown_all().await;
        assert_eq!(fixture.state.disconnects.load(Ordering::SeqCst), 1);
    }
}
