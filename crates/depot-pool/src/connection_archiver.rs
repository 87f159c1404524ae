use std::sync::Arc;

use depot_contract::{
    AccountId, ArchivedMessage, ConversationId, DepotError, ExternalMessageId, InboundMessage,
    MessageStore, TransportConnection, TransportEvent,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A transport connection shared between the pool (health checks) and
/// the archiver pump (media forwarding). The mutex serializes all
/// transport calls for one account; neither holder keeps the lock
/// across unrelated awaits.
pub type SharedConnection = Arc<Mutex<Box<dyn TransportConnection>>>;

/// Archives the traffic of one live connection: classifies media,
/// forwards payloads into the archive conversation, and marks
/// deletions in the message store.
pub struct MessageArchiver {
    account_id: AccountId,
    store: Arc<dyn MessageStore>,
    /// Conversation that receives forwarded media copies. `None`
    /// disables forwarding; kind and placeholder are still recorded.
    archive_conversation: Option<ConversationId>,
}

impl MessageArchiver {
    pub fn new(
        account_id: AccountId,
        store: Arc<dyn MessageStore>,
        archive_conversation: Option<ConversationId>,
    ) -> Self {
        Self {
            account_id,
            store,
            archive_conversation,
        }
    }

    /// Persists one inbound message. Media payloads are forwarded into
    /// the archive conversation best-effort; a failed forward keeps
    /// the row (kind + placeholder) without a reference.
    pub async fn archive_message(
        &self,
        connection: &SharedConnection,
        inbound: InboundMessage,
    ) -> Result<(), DepotError> {
        let mut media_ref = None;
        if let (Some(kind), Some(target)) = (inbound.media_kind, self.archive_conversation) {
            let mut guard = connection.lock().await;
            match guard
                .forward_message(inbound.conversation_id, inbound.external_id, target)
                .await
            {
                Ok(forwarded_id) => media_ref = Some(forwarded_id),
                Err(error) => warn!(
                    account_id = self.account_id,
                    conversation_id = inbound.conversation_id,
                    external_id = inbound.external_id,
                    media_kind = kind.as_str(),
                    error = %error,
                    "media forward failed, archiving without reference"
                ),
            }
        }

        let text = match inbound.media_kind {
            Some(kind) => kind.placeholder().to_string(),
            None => inbound.text,
        };
        self.store
            .upsert_message(&ArchivedMessage {
                account_id: self.account_id,
                conversation_id: inbound.conversation_id,
                external_id: inbound.external_id,
                sender_id: inbound.sender_id,
                text,
                media_ref,
                media_kind: inbound.media_kind,
                sent_unix_ms: inbound.sent_unix_ms,
                deleted_unix_ms: None,
            })
            .await
    }

    /// Applies one deletion batch. Unknown and already-marked ids are
    /// ignored by the store, so re-applying a batch is a no-op.
    pub async fn apply_deletions(
        &self,
        external_ids: &[ExternalMessageId],
    ) -> Result<u64, DepotError> {
        self.store.mark_deleted(self.account_id, external_ids).await
    }
}

/// Handle of one running archiver pump task.
pub struct ArchiverPumpHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ArchiverPumpHandle {
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Spawns the event pump for one live connection. The pump drains the
/// message and deletion subscriptions until either channel closes
/// (connection gone) or the pump is stopped; a stop request still
/// flushes everything already queued on both channels before the task
/// exits. Archival failures are logged and do not terminate the pump;
/// one bad event never stops monitoring.
pub fn spawn_archiver_pump(
    archiver: MessageArchiver,
    connection: SharedConnection,
    mut messages: mpsc::Receiver<TransportEvent>,
    mut deletions: mpsc::Receiver<TransportEvent>,
) -> ArchiverPumpHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut messages_open = true;
        let mut deletions_open = true;
        let mut stopping = false;
        while !stopping && (messages_open || deletions_open) {
            tokio::select! {
                _ = &mut shutdown_rx => stopping = true,
                maybe_event = messages.recv(), if messages_open => {
                    match maybe_event {
                        Some(event) => process_message_event(&archiver, &connection, event).await,
                        None => messages_open = false,
                    }
                }
                maybe_event = deletions.recv(), if deletions_open => {
                    match maybe_event {
                        Some(event) => process_deletion_event(&archiver, event).await,
                        None => deletions_open = false,
                    }
                }
            }
        }
        // Everything buffered at stop time is still processed.
        while let Ok(event) = messages.try_recv() {
            process_message_event(&archiver, &connection, event).await;
        }
        while let Ok(event) = deletions.try_recv() {
            process_deletion_event(&archiver, event).await;
        }
    });
    ArchiverPumpHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}

async fn process_message_event(
    archiver: &MessageArchiver,
    connection: &SharedConnection,
    event: TransportEvent,
) {
    if let TransportEvent::Message(inbound) = event {
        if let Err(error) = archiver.archive_message(connection, inbound).await {
            warn!(
                account_id = archiver.account_id,
                error = %error,
                "failed to archive message"
            );
        }
    }
}

async fn process_deletion_event(archiver: &MessageArchiver, event: TransportEvent) {
    if let TransportEvent::MessagesDeleted { external_ids } = event {
        match archiver.apply_deletions(&external_ids).await {
            Ok(marked) => debug!(
                account_id = archiver.account_id,
                batch = external_ids.len(),
                marked,
                "deletion batch processed"
            ),
            Err(error) => warn!(
                account_id = archiver.account_id,
                error = %error,
                "failed to mark deletions"
            ),
        }
    }
}
