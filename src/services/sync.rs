//! Reconciliation of the local store against a bounded remote snapshot.
//!
//! The server wins, except where a live stream is writing. Conversations
//! missing from the fetched window are only deleted once they are old enough
//! that absence cannot just mean "not indexed yet".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{Conversation, Message, MessageIdentity, MessageStatus, Role};
use crate::remote::{BatchItem, RemoteApi, RemoteConversation, RemoteError};
use crate::services::database::PutOutcome;
use crate::services::settings::SyncSettings;
use crate::services::store::LocalStore;
use crate::services::streaming::StreamingGuard;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncOutcome {
    #[default]
    Completed,
    /// Something was streaming when the pass was triggered.
    SkippedStreaming,
    /// Another pass was already running.
    SkippedBusy,
    /// Fetch or storage failure; the next trigger retries.
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub conversations_fetched: usize,
    pub conversations_inserted: usize,
    pub conversations_updated: usize,
    pub conversations_deleted: usize,
    pub conversations_skipped_streaming: usize,
    pub messages_inserted: usize,
    pub messages_updated: usize,
    pub messages_replaced: usize,
    pub messages_removed: usize,
}

impl SyncReport {
    fn skipped(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            ..Default::default()
        }
    }

    /// Number of store writes this pass performed.
    pub fn writes(&self) -> usize {
        self.conversations_inserted
            + self.conversations_updated
            + self.conversations_deleted
            + self.messages_inserted
            + self.messages_updated
            + self.messages_replaced
            + self.messages_removed
    }
}

/// Clock difference tolerated between a client and the server when pairing
/// an optimistic message with its confirmation by position.
const PAIRING_SKEW_MINUTES: i64 = 5;

/// A remote message paired with the client id it was sent under, if echoed.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: Message,
    pub client_id: Option<String>,
}

/// Writes needed to fold one conversation's remote messages into local state.
#[derive(Debug, Default)]
pub struct MergePlan {
    pub inserts: Vec<Message>,
    pub updates: Vec<Message>,
    /// `(temporary id, confirmed record)`.
    pub replacements: Vec<(String, Message)>,
    /// Abandoned optimistic messages.
    pub removals: Vec<String>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.replacements.is_empty()
            && self.removals.is_empty()
    }
}

/// Decide how to merge `remote` into `local` for one conversation.
///
/// - A remote message unknown locally is inserted.
/// - A local optimistic message is replaced by the remote message that
///   confirms it: the one echoing its temporary id, otherwise the latest
///   unclaimed remote message of the same role created no earlier than the
///   pending one (less a few minutes of clock skew). Content is never compared.
/// - A local confirmed message in `Sending` status is left untouched.
/// - Otherwise the newer of the two (by `updated_at`, then `created_at`)
///   wins; ties keep the local copy.
/// - Optimistic messages nothing confirmed and older than `optimistic_ttl`
///   are dropped.
pub fn plan_message_merge(
    local: &[Message],
    remote: &[IncomingMessage],
    now: DateTime<Utc>,
    optimistic_ttl: Duration,
) -> MergePlan {
    let mut plan = MergePlan::default();
    let local_by_id: HashMap<&str, &Message> = local.iter().map(|m| (m.id(), m)).collect();

    let mut pending: Vec<&Message> = local.iter().filter(|m| m.is_optimistic()).collect();
    pending.sort_by_key(|m| (m.created_at, m.id().to_string()));
    let mut claimed: HashSet<&str> = HashSet::new();

    // Unmatched remote messages without a client id, by role, for
    // positional pairing with pending ones.
    let mut unmatched: Vec<&Message> = Vec::new();

    for incoming in remote {
        let remote_msg = &incoming.message;

        if let Some(existing) = local_by_id.get(remote_msg.id()) {
            if existing.is_optimistic() {
                // Client-generated id accepted as is by the backend.
                claimed.insert(existing.id());
                plan.replacements
                    .push((existing.id().to_string(), confirmed_from(existing, remote_msg)));
            } else if existing.status == MessageStatus::Sending {
                tracing::trace!("Leaving streaming message {} alone", existing.id());
            } else if remote_msg.last_modified() > existing.last_modified() {
                plan.updates.push(with_local_extras(remote_msg, existing));
            }
            continue;
        }

        match incoming.client_id.as_deref() {
            Some(client_id) => match local_by_id.get(client_id) {
                Some(existing) if existing.is_optimistic() && !claimed.contains(client_id) => {
                    claimed.insert(existing.id());
                    plan.replacements
                        .push((existing.id().to_string(), confirmed_from(existing, remote_msg)));
                }
                _ => plan.inserts.push(remote_msg.clone()),
            },
            None => unmatched.push(remote_msg),
        }
    }

    // Optimistic messages are the newest local writes, so pair from the end:
    // the latest pending message of a role with the latest unclaimed remote
    // message of that role. A remote message older than the pending one was
    // written before it existed and cannot be its confirmation.
    for role in [Role::User, Role::Assistant, Role::System] {
        let mut remote_of_role: Vec<Option<&Message>> = unmatched
            .iter()
            .copied()
            .filter(|m| m.role == role)
            .map(Some)
            .collect();
        remote_of_role.sort_by_key(|m| m.map(|m| (m.created_at, m.id().to_string())));

        let pending_of_role = pending
            .iter()
            .rev()
            .copied()
            .filter(|m| m.role == role && !claimed.contains(m.id()))
            .collect::<Vec<_>>();
        for local_msg in pending_of_role {
            let earliest = local_msg.created_at - Duration::minutes(PAIRING_SKEW_MINUTES);
            let Some(slot) = remote_of_role
                .iter_mut()
                .rev()
                .find(|slot| slot.is_some_and(|m| m.created_at >= earliest))
            else {
                continue;
            };
            if let Some(remote_msg) = slot.take() {
                claimed.insert(local_msg.id());
                plan.replacements
                    .push((local_msg.id().to_string(), confirmed_from(local_msg, remote_msg)));
            }
        }
        plan.inserts.extend(remote_of_role.into_iter().flatten().cloned());
    }

    for msg in pending {
        if !claimed.contains(msg.id()) && msg.created_at < now - optimistic_ttl {
            plan.removals.push(msg.id().to_string());
        }
    }

    plan
}

/// The confirmed record replacing `pending`: the server's fields, the local
/// `created_at`, and local auxiliary fields the server did not return.
fn confirmed_from(pending: &Message, remote: &Message) -> Message {
    let mut confirmed = with_local_extras(remote, pending);
    confirmed.identity = MessageIdentity::Confirmed(remote.id().to_string());
    confirmed.created_at = pending.created_at;
    confirmed.updated_at = remote.last_modified().max(pending.created_at);
    confirmed
}

fn with_local_extras(remote: &Message, local: &Message) -> Message {
    let mut merged = remote.clone();
    merged.extras = remote.extras.clone().or_from(&local.extras);
    merged
}

/// Pulls a bounded window of server state and folds it into the local store.
#[derive(Clone)]
pub struct SyncReconciler {
    store: LocalStore,
    guard: StreamingGuard,
    remote: Arc<dyn RemoteApi>,
    settings: SyncSettings,
    running: Arc<tokio::sync::Mutex<()>>,
}

impl SyncReconciler {
    pub fn new(
        store: LocalStore,
        guard: StreamingGuard,
        remote: Arc<dyn RemoteApi>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            guard,
            remote,
            settings,
            running: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run one best-effort pass. Never fails: errors are logged and reported
    /// in the outcome, and the next trigger simply tries again.
    pub async fn run(&self) -> SyncReport {
        if self.guard.any_streaming() {
            tracing::debug!("Skipping sync: streaming in {:?}", self.guard.active());
            return SyncReport::skipped(SyncOutcome::SkippedStreaming);
        }

        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("Skipping sync: a pass is already running");
            return SyncReport::skipped(SyncOutcome::SkippedBusy);
        };

        let mut report = SyncReport::default();
        match self.reconcile(&mut report).await {
            Ok(()) => {
                tracing::info!(
                    fetched = report.conversations_fetched,
                    writes = report.writes(),
                    deleted = report.conversations_deleted,
                    "Sync pass completed"
                );
            }
            Err(e) => {
                tracing::warn!("Sync pass failed: {:#}", e);
                report.outcome = SyncOutcome::Failed(e.to_string());
            }
        }
        report
    }

    /// Run a pass every `interval` until `cancel_token` fires.
    pub fn spawn_periodic(
        &self,
        interval: StdDuration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        reconciler.run().await;
                    }
                }
            }
            tracing::debug!("Periodic sync stopped");
        })
    }

    async fn reconcile(&self, report: &mut SyncReport) -> Result<()> {
        let window = self.fetch_window().await?;
        report.conversations_fetched = window.conversations.len();

        let local = self.store.list_conversations().await?;
        let local_by_id: HashMap<&str, &Conversation> =
            local.iter().map(|c| (c.id.as_str(), c)).collect();

        // Staleness: remote strictly newer, or unknown locally.
        let mut listed: HashMap<String, &RemoteConversation> = HashMap::new();
        let mut stale = Vec::new();
        for remote_conv in &window.conversations {
            let remote_updated = remote_conv.to_conversation().updated_at;
            match local_by_id.get(remote_conv.conversation_id.as_str()) {
                Some(local_conv) if remote_updated <= local_conv.updated_at => {}
                Some(local_conv) => stale.push(BatchItem {
                    conversation_id: remote_conv.conversation_id.clone(),
                    last_updated: Some(local_conv.updated_at),
                }),
                None => stale.push(BatchItem {
                    conversation_id: remote_conv.conversation_id.clone(),
                    last_updated: None,
                }),
            }
            listed.insert(remote_conv.conversation_id.clone(), remote_conv);
        }

        self.delete_missing(&local, &listed, window.floor(), report)
            .await?;

        if stale.is_empty() {
            return Ok(());
        }

        tracing::debug!("Fetching detail for {} stale conversations", stale.len());
        let details = self.remote.fetch_conversations(stale).await?;

        for detail in details {
            let conversation = detail.conversation.to_conversation();
            if self.guard.is_streaming(&conversation.id) {
                tracing::debug!("Not merging {}: streaming", conversation.id);
                report.conversations_skipped_streaming += 1;
                continue;
            }

            let mut incoming = Vec::with_capacity(detail.messages.len());
            for remote_msg in &detail.messages {
                match remote_msg.to_message(&conversation.id) {
                    Ok(message) => incoming.push(IncomingMessage {
                        message,
                        client_id: remote_msg.client_message_id.clone(),
                    }),
                    Err(e) => tracing::warn!("Skipping message in {}: {}", conversation.id, e),
                }
            }

            self.merge_conversation(conversation, incoming, report).await?;
        }

        Ok(())
    }

    async fn fetch_window(&self) -> Result<RemoteWindow, RemoteError> {
        let window_size = self.settings.window_size;
        let page_size = self.settings.page_size.max(1);
        let mut seen = HashSet::new();
        let mut conversations = Vec::new();
        let mut exhausted = false;
        let mut page = 1;

        while conversations.len() < window_size {
            let listing = self.remote.list_conversations(page, page_size).await?;
            let count = listing.conversations.len();
            for conv in listing.conversations {
                if seen.insert(conv.conversation_id.clone()) {
                    conversations.push(conv);
                }
            }
            let last_page = listing.total_pages > 0 && page >= listing.total_pages;
            if count < page_size as usize || last_page {
                exhausted = true;
                break;
            }
            page += 1;
        }

        if conversations.len() > window_size {
            exhausted = false;
            conversations.truncate(window_size);
        }
        Ok(RemoteWindow {
            conversations,
            exhausted,
        })
    }

    /// Delete local conversations absent from the window, unless streaming
    /// or younger than the minimum age. With a `floor`, only conversations
    /// updated after it are considered: older ones may just have paged out.
    async fn delete_missing(
        &self,
        local: &[Conversation],
        listed: &HashMap<String, &RemoteConversation>,
        floor: Option<DateTime<Utc>>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let cutoff = Utc::now() - self.settings.deletion_min_age();
        let doomed: Vec<String> = local
            .iter()
            .filter(|c| !listed.contains_key(&c.id))
            .filter(|c| !self.guard.is_streaming(&c.id))
            .filter(|c| c.updated_at.max(c.created_at) < cutoff)
            .filter(|c| floor.map_or(true, |floor| c.updated_at > floor))
            .map(|c| c.id.clone())
            .collect();

        if doomed.is_empty() {
            return Ok(());
        }

        tracing::info!("Deleting {} conversations missing from the server", doomed.len());
        let removed = self.store.delete_conversations_and_messages(doomed).await?;
        report.conversations_deleted += removed.len();
        Ok(())
    }

    /// Fold one conversation's detail into the store. The conversation row
    /// is written last: its `updated_at` marks the messages as current, so a
    /// failed message write leaves it stale for the next pass.
    async fn merge_conversation(
        &self,
        conversation: Conversation,
        incoming: Vec<IncomingMessage>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let conversation_id = conversation.id.clone();

        let local = self.store.get_messages_for_conversation(&conversation_id).await?;
        let plan = plan_message_merge(
            &local,
            &incoming,
            Utc::now(),
            self.settings.optimistic_ttl(),
        );

        let inserted = plan.inserts.len();
        let updated = plan.updates.len();
        let mut upserts = plan.inserts;
        upserts.extend(plan.updates);
        if self.store.put_messages_bulk(upserts).await? > 0 {
            report.messages_inserted += inserted;
            report.messages_updated += updated;
        }

        for (temp_id, confirmed) in plan.replacements {
            if self.store.replace_message(&temp_id, confirmed).await? {
                report.messages_replaced += 1;
            }
        }

        for id in plan.removals {
            if self.store.delete_message(&id).await? {
                report.messages_removed += 1;
            }
        }

        match self.store.put_conversation(conversation).await? {
            PutOutcome::Inserted => report.conversations_inserted += 1,
            PutOutcome::Updated => report.conversations_updated += 1,
            PutOutcome::Unchanged => {}
        }

        tracing::debug!("Merged {} (+{} ~{})", conversation_id, inserted, updated);
        Ok(())
    }
}

/// The most recent slice of the remote listing.
struct RemoteWindow {
    conversations: Vec<RemoteConversation>,
    /// The listing ended inside the window, so it holds every remote
    /// conversation.
    exhausted: bool,
}

impl RemoteWindow {
    /// Oldest `updated_at` in a window that does not cover the whole listing.
    fn floor(&self) -> Option<DateTime<Utc>> {
        if self.exhausted {
            return None;
        }
        let oldest = self
            .conversations
            .iter()
            .map(|c| c.to_conversation().updated_at)
            .min();
        // An empty but unfinished window vouches for nothing.
        Some(oldest.unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}
