use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use depot_contract::{
    Account, AccountDirectory, AccountId, ConversationId, DepotError, MessageStore, Transport,
    TransportEventKind,
};
use depot_core::redact_phone;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection_archiver::{
    spawn_archiver_pump, ArchiverPumpHandle, MessageArchiver, SharedConnection,
};

const DEFAULT_RECONCILE_INTERVAL_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
/// Configuration of the pool reconcile loop.
pub struct PoolReconcilerConfig {
    pub interval: Duration,
    /// Conversation receiving forwarded media copies; `None` disables
    /// media forwarding in the archiver.
    pub archive_conversation: Option<ConversationId>,
}

impl Default for PoolReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECONDS),
            archive_conversation: None,
        }
    }
}

/// One live, authorized connection held by the pool.
struct LiveConnection {
    account_id: AccountId,
    connection: SharedConnection,
    pump: ArchiverPumpHandle,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
/// Outcome of one reconcile pass.
pub struct PoolCycleSummary {
    pub desired: usize,
    pub connected: u64,
    pub closed_unmonitored: u64,
    pub closed_unhealthy: u64,
    /// Accounts skipped this cycle because their stored credential is
    /// invalid. Reported, never auto-deleted.
    pub auth_invalid_accounts: Vec<AccountId>,
    pub transient_failures: u64,
    pub rate_limited_skips: u64,
}

/// Owns the map of live connections and reconciles it against the
/// directory's monitored set. The map is mutated only in critical
/// sections with no intervening suspension point; connection setup and
/// health probes happen outside the lock, with a re-check before
/// insertion so no two live connections ever share an account id.
pub struct SessionPoolManager {
    directory: Arc<dyn AccountDirectory>,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
    config: PoolReconcilerConfig,
    connections: Mutex<BTreeMap<AccountId, LiveConnection>>,
}

impl SessionPoolManager {
    pub fn new(
        directory: Arc<dyn AccountDirectory>,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
        config: PoolReconcilerConfig,
    ) -> Self {
        Self {
            directory,
            store,
            transport,
            config,
            connections: Mutex::new(BTreeMap::new()),
        }
    }

    /// Account ids with a live connection right now.
    pub async fn live_account_ids(&self) -> Vec<AccountId> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// Runs one reconcile pass. Idempotent: a pass over an already
    /// converged pool changes nothing. Per-account failures are
    /// absorbed into the summary and never abort the pass.
    pub async fn reconcile(&self) -> Result<PoolCycleSummary, DepotError> {
        let mut summary = PoolCycleSummary::default();
        let desired = self.directory.list_monitored().await?;
        summary.desired = desired.len();
        let desired_ids: BTreeSet<AccountId> = desired.iter().map(|value| value.id).collect();

        self.close_unmonitored(&desired_ids, &mut summary).await;
        self.health_check_survivors(&mut summary).await;
        self.connect_missing(&desired, &mut summary).await;

        debug!(
            desired = summary.desired,
            connected = summary.connected,
            closed_unmonitored = summary.closed_unmonitored,
            closed_unhealthy = summary.closed_unhealthy,
            "reconcile pass complete"
        );
        Ok(summary)
    }

    /// Closes every live connection and stops its pump. Used on
    /// process shutdown and safe to call repeatedly.
    pub async fn shutdown_all(&self) {
        let drained: Vec<LiveConnection> = {
            let mut map = self.connections.lock().await;
            std::mem::take(&mut *map).into_values().collect()
        };
        for mut live in drained {
            info!(account_id = live.account_id, "closing live connection on shutdown");
            Self::teardown(&mut live).await;
        }
    }

    async fn close_unmonitored(
        &self,
        desired_ids: &BTreeSet<AccountId>,
        summary: &mut PoolCycleSummary,
    ) {
        let leavers: Vec<LiveConnection> = {
            let mut map = self.connections.lock().await;
            let leaver_ids: Vec<AccountId> = map
                .keys()
                .filter(|id| !desired_ids.contains(id))
                .copied()
                .collect();
            leaver_ids
                .into_iter()
                .filter_map(|id| map.remove(&id))
                .collect()
        };
        for mut leaver in leavers {
            info!(
                account_id = leaver.account_id,
                "monitoring disabled, closing connection"
            );
            Self::teardown(&mut leaver).await;
            summary.closed_unmonitored = summary.closed_unmonitored.saturating_add(1);
        }
    }

    async fn connect_missing(&self, desired: &[Account], summary: &mut PoolCycleSummary) {
        for account in desired {
            let already_live = self.connections.lock().await.contains_key(&account.id);
            if already_live {
                continue;
            }
            match self.establish(account).await {
                Ok(live) => {
                    let mut map = self.connections.lock().await;
                    if map.contains_key(&account.id) {
                        // a concurrent pass won the race for this id
                        drop(map);
                        let mut duplicate = live;
                        Self::teardown(&mut duplicate).await;
                        warn!(account_id = account.id, "discarded duplicate connection");
                    } else {
                        map.insert(account.id, live);
                        summary.connected = summary.connected.saturating_add(1);
                        info!(
                            account_id = account.id,
                            phone = %redact_phone(&account.phone),
                            "live connection established"
                        );
                    }
                }
                Err(DepotError::AuthInvalid) => {
                    warn!(
                        account_id = account.id,
                        phone = %redact_phone(&account.phone),
                        "stored credential is not authorized, skipping account"
                    );
                    summary.auth_invalid_accounts.push(account.id);
                }
                Err(DepotError::RateLimited { wait_seconds }) => {
                    warn!(
                        account_id = account.id,
                        wait_seconds, "rate limited, skipping account this cycle"
                    );
                    summary.rate_limited_skips = summary.rate_limited_skips.saturating_add(1);
                }
                Err(error) => {
                    warn!(
                        account_id = account.id,
                        error = %error,
                        "connection setup failed, retrying next cycle"
                    );
                    summary.transient_failures = summary.transient_failures.saturating_add(1);
                }
            }
        }
    }

    async fn health_check_survivors(&self, summary: &mut PoolCycleSummary) {
        let probes: Vec<(AccountId, SharedConnection)> = {
            let map = self.connections.lock().await;
            map.values()
                .map(|live| (live.account_id, live.connection.clone()))
                .collect()
        };
        for (account_id, connection) in probes {
            let healthy = {
                let guard = connection.lock().await;
                guard.is_connected().await && matches!(guard.is_authorized().await, Ok(true))
            };
            if healthy {
                continue;
            }
            let removed = self.connections.lock().await.remove(&account_id);
            if let Some(mut live) = removed {
                warn!(account_id, "health check failed, closing connection");
                Self::teardown(&mut live).await;
                summary.closed_unhealthy = summary.closed_unhealthy.saturating_add(1);
            }
        }
    }

    /// Opens, verifies, and wires up one connection. Any failure after
    /// the resume releases the transport before returning.
    async fn establish(&self, account: &Account) -> Result<LiveConnection, DepotError> {
        let mut connection = self.transport.resume(&account.credential).await?;
        match connection.is_authorized().await {
            Ok(true) => {}
            Ok(false) => {
                connection.disconnect().await;
                return Err(DepotError::AuthInvalid);
            }
            Err(error) => {
                connection.disconnect().await;
                return Err(error);
            }
        }
        let messages = match connection.subscribe(TransportEventKind::Messages).await {
            Ok(receiver) => receiver,
            Err(error) => {
                connection.disconnect().await;
                return Err(error);
            }
        };
        let deletions = match connection.subscribe(TransportEventKind::Deletions).await {
            Ok(receiver) => receiver,
            Err(error) => {
                connection.disconnect().await;
                return Err(error);
            }
        };

        let shared: SharedConnection = Arc::new(Mutex::new(connection));
        let archiver = MessageArchiver::new(
            account.id,
            self.store.clone(),
            self.config.archive_conversation,
        );
        let pump = spawn_archiver_pump(archiver, shared.clone(), messages, deletions);
        Ok(LiveConnection {
            account_id: account.id,
            connection: shared,
            pump,
        })
    }

    async fn teardown(live: &mut LiveConnection) {
        live.pump.stop().await;
        let mut guard = live.connection.lock().await;
        guard.disconnect().await;
    }
}

/// Handle of the running reconcile loop.
pub struct PoolHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PoolHandle {
    /// Stops the loop, then closes every live connection before
    /// returning.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Spawns the interval-driven reconcile loop for `manager`.
pub fn start_pool_reconciler(manager: Arc<SessionPoolManager>) -> PoolHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let interval = manager.config.interval;
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // consume the immediate first tick so the first pass happens
        // one interval after startup, matching the directory's own
        // settle time
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    if let Err(error) = manager.reconcile().await {
                        warn!(error = %error, "reconcile pass failed, retrying next interval");
                    }
                }
            }
        }
        manager.shutdown_all().await;
    });
    PoolHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}
