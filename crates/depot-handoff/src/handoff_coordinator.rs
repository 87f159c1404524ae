use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use depot_contract::{
    Account, AccountDirectory, AccountId, AccountUpdate, ChatId, CodeChallenge, DepotError,
    NewAccount, Notifier, OwnerId, Transport, TransportConnection,
};
use depot_core::{current_unix_timestamp_ms, is_expired_unix, redact_phone};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::custody_watcher::{spawn_custody_watcher, CustodyWatcherConfig, WatcherRegistry};

const PHONE_PATTERN: &str = r"^\+[1-9][0-9]{7,14}$";
const DEFAULT_GIVE_SESSION_TTL_SECONDS: u64 = 600;
const DEFAULT_MAX_MALFORMED_CODES: u32 = 3;

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// How long an untouched give flow stays resumable before it is
    /// discarded on next touch.
    pub give_session_ttl: Duration,
    pub max_malformed_codes: u32,
    pub watcher: CustodyWatcherConfig,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            give_session_ttl: Duration::from_secs(DEFAULT_GIVE_SESSION_TTL_SECONDS),
            max_malformed_codes: DEFAULT_MAX_MALFORMED_CODES,
            watcher: CustodyWatcherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where an in-flight give flow is waiting for input.
pub enum GivePhase {
    CodePending,
    TwoFactorPending,
    AliasPending,
}

/// One in-flight deposit, keyed by operator. The suspended connection
/// is the flow's continuation: it is either handed to the directory as
/// an exported credential on completion, or disconnected on any other
/// exit.
struct GiveSession {
    phase: GivePhase,
    chat_id: ChatId,
    phone: String,
    connection: Box<dyn TransportConnection>,
    challenge: CodeChallenge,
    two_factor_secret: Option<String>,
    malformed_codes: u32,
    expires_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What the operator needs to manually re-claim a withdrawn account.
pub struct TakeDisplay {
    pub phone: String,
    pub two_factor_secret: Option<String>,
}

/// Drives the give and take custody flows. Give flows live in an
/// in-memory session map, one per operator, never partially persisted;
/// take flows spawn one supervised `CustodyWatcher` per account.
pub struct HandoffCoordinator {
    directory: Arc<dyn AccountDirectory>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    config: HandoffConfig,
    phone_pattern: Regex,
    give_sessions: Mutex<BTreeMap<OwnerId, GiveSession>>,
    watchers: WatcherRegistry,
}

impl HandoffCoordinator {
    pub fn new(
        directory: Arc<dyn AccountDirectory>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        config: HandoffConfig,
    ) -> Self {
        Self {
            directory,
            transport,
            notifier,
            config,
            phone_pattern: Regex::new(PHONE_PATTERN).expect("phone pattern compiles"),
            give_sessions: Mutex::new(BTreeMap::new()),
            watchers: WatcherRegistry::new(),
        }
    }

    pub async fn active_watcher_account_ids(&self) -> Vec<AccountId> {
        self.watchers.active_account_ids().await
    }

    /// Starts a deposit: validates the phone, opens a fresh login
    /// connection, and requests a verification code. An operator's
    /// previous unfinished flow is discarded.
    pub async fn start_give(
        &self,
        owner_id: OwnerId,
        chat_id: ChatId,
        phone: &str,
    ) -> Result<GivePhase, DepotError> {
        let phone = phone.trim();
        if !self.phone_pattern.is_match(phone) {
            return Err(DepotError::Validation(
                "phone must be in international format, e.g. +15551234567".to_string(),
            ));
        }
        if let Some(mut previous) = self.give_sessions.lock().await.remove(&owner_id) {
            previous.connection.disconnect().await;
        }

        let mut connection = self.transport.begin_login().await?;
        let challenge = match connection.send_code(phone).await {
            Ok(challenge) => challenge,
            Err(error) => {
                connection.disconnect().await;
                return Err(error);
            }
        };
        let session = GiveSession {
            phase: GivePhase::CodePending,
            chat_id,
            phone: phone.to_string(),
            connection,
            challenge,
            two_factor_secret: None,
            malformed_codes: 0,
            expires_unix_ms: current_unix_timestamp_ms()
                .saturating_add(self.config.give_session_ttl.as_millis() as u64),
        };
        if let Some(mut replaced) = self.give_sessions.lock().await.insert(owner_id, session) {
            replaced.connection.disconnect().await;
        }
        info!(owner_id, phone = %redact_phone(phone), "give flow started");
        Ok(GivePhase::CodePending)
    }

    /// Submits the verification code. Malformed input is rejected
    /// without consuming the flow up to the configured strike count;
    /// the third strike aborts and discards the session.
    pub async fn submit_code(&self, owner_id: OwnerId, code: &str) -> Result<GivePhase, DepotError> {
        let mut session = self.take_give_session(owner_id).await?;
        if session.phase != GivePhase::CodePending {
            self.restore_session(owner_id, session).await;
            return Err(DepotError::FlowState(
                "flow is not waiting for a code".to_string(),
            ));
        }
        let code = code.trim();
        if !is_well_formed_code(code) {
            session.malformed_codes += 1;
            if session.malformed_codes >= self.config.max_malformed_codes {
                warn!(owner_id, "too many malformed codes, aborting give flow");
                let chat_id = session.chat_id;
                session.connection.disconnect().await;
                let _ = self
                    .notifier
                    .send(chat_id, "too many malformed codes, deposit aborted")
                    .await;
                return Err(DepotError::Validation(
                    "too many malformed codes, flow aborted".to_string(),
                ));
            }
            let remaining = self.config.max_malformed_codes - session.malformed_codes;
            self.restore_session(owner_id, session).await;
            return Err(DepotError::Validation(format!(
                "code must be 5-6 digits, {remaining} attempts left"
            )));
        }

        let phone = session.phone.clone();
        let challenge = session.challenge.clone();
        match session
            .connection
            .sign_in_with_code(&phone, code, &challenge)
            .await
        {
            Ok(()) => {
                revoke_other_authorizations(session.connection.as_mut()).await;
                session.phase = GivePhase::AliasPending;
                self.restore_session(owner_id, session).await;
                Ok(GivePhase::AliasPending)
            }
            Err(DepotError::TwoFactorRequired) => {
                session.phase = GivePhase::TwoFactorPending;
                self.restore_session(owner_id, session).await;
                Ok(GivePhase::TwoFactorPending)
            }
            Err(error) => {
                // expired code, rate limit, or network failure ends
                // the flow
                session.connection.disconnect().await;
                Err(error)
            }
        }
    }

    /// Submits the second factor after `TwoFactorRequired`. The secret
    /// is captured in the session and persisted with the account on
    /// completion.
    pub async fn submit_two_factor(
        &self,
        owner_id: OwnerId,
        secret: &str,
    ) -> Result<GivePhase, DepotError> {
        let mut session = self.take_give_session(owner_id).await?;
        if session.phase != GivePhase::TwoFactorPending {
            self.restore_session(owner_id, session).await;
            return Err(DepotError::FlowState(
                "flow is not waiting for a second factor".to_string(),
            ));
        }
        match session.connection.sign_in_with_password(secret).await {
            Ok(()) => {
                revoke_other_authorizations(session.connection.as_mut()).await;
                session.two_factor_secret = Some(secret.to_string());
                session.phase = GivePhase::AliasPending;
                self.restore_session(owner_id, session).await;
                Ok(GivePhase::AliasPending)
            }
            Err(error) => {
                session.connection.disconnect().await;
                Err(error)
            }
        }
    }

    /// Completes the deposit under `alias`. A matching phone means
    /// re-deposit (update credential, clear custody); an alias held by
    /// a different phone is a `Conflict` that keeps the flow alive;
    /// otherwise a fresh monitored account is created.
    pub async fn submit_alias(&self, owner_id: OwnerId, alias: &str) -> Result<Account, DepotError> {
        let mut session = self.take_give_session(owner_id).await?;
        if session.phase != GivePhase::AliasPending {
            self.restore_session(owner_id, session).await;
            return Err(DepotError::FlowState(
                "flow is not waiting for an alias".to_string(),
            ));
        }
        let alias = alias.trim();
        if alias.is_empty() {
            self.restore_session(owner_id, session).await;
            return Err(DepotError::Validation("alias must not be empty".to_string()));
        }
        let credential = match session.connection.export_credential().await {
            Ok(credential) => credential,
            Err(error) => {
                session.connection.disconnect().await;
                return Err(error);
            }
        };

        let existing = match self.directory.get_by_phone(owner_id, &session.phone).await {
            Ok(existing) => existing,
            Err(error) => {
                self.restore_session(owner_id, session).await;
                return Err(error);
            }
        };
        if let Some(existing) = existing {
            // re-deposit of a known account: refresh the credential
            // and return custody to the pool
            let update = AccountUpdate {
                credential: Some(credential),
                two_factor_secret: session.two_factor_secret.clone().map(Some),
                is_taken: Some(false),
                ..AccountUpdate::default()
            };
            return match self.directory.update(existing.id, update).await {
                Ok(account) => {
                    session.connection.disconnect().await;
                    info!(owner_id, account_id = account.id, "give flow re-deposited account");
                    Ok(account)
                }
                Err(error) => {
                    self.restore_session(owner_id, session).await;
                    Err(error)
                }
            };
        }

        let alias_holder = match self.directory.get_by_alias(owner_id, alias).await {
            Ok(holder) => holder,
            Err(error) => {
                self.restore_session(owner_id, session).await;
                return Err(error);
            }
        };
        if alias_holder.is_some() {
            // a different phone owns this alias; re-prompt without
            // mutating anything
            self.restore_session(owner_id, session).await;
            return Err(DepotError::Conflict(format!(
                "alias '{alias}' is already in use"
            )));
        }

        match self
            .directory
            .create(NewAccount {
                owner_id,
                alias: alias.to_string(),
                phone: session.phone.clone(),
                credential,
                two_factor_secret: session.two_factor_secret.clone(),
                monitoring: true,
                is_taken: false,
            })
            .await
        {
            Ok(account) => {
                session.connection.disconnect().await;
                info!(
                    owner_id,
                    account_id = account.id,
                    alias,
                    "give flow deposited new account"
                );
                Ok(account)
            }
            Err(error) => {
                self.restore_session(owner_id, session).await;
                Err(error)
            }
        }
    }

    /// Abandons the operator's give flow, if any, releasing its
    /// suspended connection.
    pub async fn cancel_give(&self, owner_id: OwnerId) -> bool {
        let session = self.give_sessions.lock().await.remove(&owner_id);
        match session {
            Some(mut session) => {
                session.connection.disconnect().await;
                info!(owner_id, "give flow cancelled");
                true
            }
            None => false,
        }
    }

    /// Starts a withdrawal: returns what the operator needs to re-claim
    /// the account and spawns the custody watcher. A second take on the
    /// same account replaces its running watcher.
    pub async fn begin_take(
        &self,
        owner_id: OwnerId,
        chat_id: ChatId,
        alias: &str,
    ) -> Result<TakeDisplay, DepotError> {
        let account = self
            .directory
            .get_by_alias(owner_id, alias)
            .await?
            .ok_or_else(|| DepotError::NotFound(format!("no account with alias '{alias}'")))?;
        let display = TakeDisplay {
            phone: account.phone.clone(),
            two_factor_secret: account.two_factor_secret.clone(),
        };
        let handle = spawn_custody_watcher(
            self.directory.clone(),
            self.transport.clone(),
            self.notifier.clone(),
            self.config.watcher.clone(),
            account.clone(),
            chat_id,
        );
        self.watchers.replace(account.id, handle).await;
        info!(
            owner_id,
            account_id = account.id,
            "take flow started, custody watcher running"
        );
        Ok(display)
    }

    /// Revokes every authorization on the account except the one
    /// backing this call's own connection. Returns the number revoked;
    /// zero when the account is already alone.
    pub async fn kill_session(&self, owner_id: OwnerId, alias: &str) -> Result<u64, DepotError> {
        let account = self
            .directory
            .get_by_alias(owner_id, alias)
            .await?
            .ok_or_else(|| DepotError::NotFound(format!("no account with alias '{alias}'")))?;
        let mut connection = self.transport.resume(&account.credential).await?;
        let authorizations = match connection.list_authorizations().await {
            Ok(authorizations) => authorizations,
            Err(error) => {
                connection.disconnect().await;
                return Err(error);
            }
        };
        let mut revoked = 0u64;
        for authorization in authorizations
            .into_iter()
            .filter(|authorization| !authorization.is_current)
        {
            match connection.revoke_authorization(authorization.handle).await {
                Ok(()) => revoked += 1,
                Err(error) => {
                    connection.disconnect().await;
                    return Err(error);
                }
            }
        }
        connection.disconnect().await;
        info!(
            owner_id,
            account_id = account.id,
            revoked, "revoked stale authorizations"
        );
        Ok(revoked)
    }

    /// Cancels outstanding watchers and discards in-flight give flows.
    pub async fn shutdown(&self) {
        self.watchers.shutdown_all().await;
        let drained: Vec<GiveSession> = {
            let mut map = self.give_sessions.lock().await;
            std::mem::take(&mut *map).into_values().collect()
        };
        for mut session in drained {
            session.connection.disconnect().await;
        }
    }

    /// Removes the operator's session for exclusive use by one call.
    /// Expired sessions are discarded here, on next touch.
    async fn take_give_session(&self, owner_id: OwnerId) -> Result<GiveSession, DepotError> {
        let session = self.give_sessions.lock().await.remove(&owner_id);
        let Some(mut session) = session else {
            return Err(DepotError::FlowState("no give flow in progress".to_string()));
        };
        if is_expired_unix(Some(session.expires_unix_ms), current_unix_timestamp_ms()) {
            let chat_id = session.chat_id;
            session.connection.disconnect().await;
            let _ = self
                .notifier
                .send(chat_id, "deposit flow expired, start again")
                .await;
            return Err(DepotError::FlowState("give flow expired".to_string()));
        }
        Ok(session)
    }

    async fn restore_session(&self, owner_id: OwnerId, session: GiveSession) {
        if let Some(mut replaced) = self.give_sessions.lock().await.insert(owner_id, session) {
            replaced.connection.disconnect().await;
        }
    }
}

fn is_well_formed_code(code: &str) -> bool {
    (5..=6).contains(&code.len()) && code.chars().all(|c| c.is_ascii_digit())
}

/// Best-effort cleanup after a fresh sign-in: every other active
/// authorization on the account is revoked so the deposited credential
/// is the only one left. Failures are logged, never fatal to the flow.
async fn revoke_other_authorizations(connection: &mut dyn TransportConnection) {
    let authorizations = match connection.list_authorizations().await {
        Ok(authorizations) => authorizations,
        Err(error) => {
            warn!(error = %error, "could not list authorizations for cleanup");
            return;
        }
    };
    for authorization in authorizations
        .into_iter()
        .filter(|authorization| !authorization.is_current)
    {
        if let Err(error) = connection.revoke_authorization(authorization.handle).await {
            warn!(
                handle = authorization.handle,
                error = %error,
                "could not revoke stale authorization"
            );
        }
    }
}
