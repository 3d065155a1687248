use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{Message, MessageStatus, MessageUpdate, Role};
use crate::services::store::LocalStore;
use crate::services::streaming::StreamingGuard;

/// Event delivered by the live streaming transport for one assistant reply.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    Token(String),
    Done,
    Error(String),
}

/// Identifies the reply being streamed.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub conversation_id: String,
    /// Backend-assigned id of the assistant message.
    pub message_id: String,
    pub model: Option<String>,
}

/// Persist a streamed assistant reply.
///
/// While this runs the conversation is flagged on `guard` and the message
/// sits in `Sending` status, so a sync pass leaves it alone. Tokens are
/// written through the store as they arrive. The final status is `Sent`, or
/// `Failed` when the stream errors or ends (or is cancelled) before any
/// content arrived; partial content is kept either way. If a write fails
/// mid-stream the message is marked `Failed` before the error is returned,
/// so it does not stay in `Sending` for good.
pub async fn run_generation(
    store: &LocalStore,
    guard: &StreamingGuard,
    params: GenerationParams,
    mut rx: mpsc::Receiver<GenerationEvent>,
    cancel_token: CancellationToken,
) -> Result<Message> {
    let _lease = guard.lease(&params.conversation_id);

    let mut message = Message::confirmed(
        params.message_id.clone(),
        params.conversation_id.clone(),
        Role::Assistant,
        String::new(),
    );
    message.status = MessageStatus::Sending;
    message.extras.model = params.model.clone();
    store.put_message(message.clone()).await?;

    let mut accumulated = String::new();

    let final_status =
        match stream_tokens(store, &params, &mut rx, &cancel_token, &mut accumulated).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Generation {} aborted: {:#}", params.message_id, e);
                if let Err(mark_err) = store
                    .update_message_fields(
                        &params.message_id,
                        MessageUpdate::status(MessageStatus::Failed),
                    )
                    .await
                {
                    tracing::warn!(
                        "Could not mark {} as failed: {:#}",
                        params.message_id,
                        mark_err
                    );
                }
                return Err(e);
            }
        };

    let finished = store
        .update_message_fields(
            &params.message_id,
            MessageUpdate {
                content: Some(accumulated),
                status: Some(final_status),
                extras: None,
            },
        )
        .await?;

    // The row can only be missing if something deleted it mid-stream.
    Ok(finished.unwrap_or_else(|| {
        message.status = final_status;
        message
    }))
}

/// Write tokens into the message until the stream ends. Returns the status
/// the message should finish with.
async fn stream_tokens(
    store: &LocalStore,
    params: &GenerationParams,
    rx: &mut mpsc::Receiver<GenerationEvent>,
    cancel_token: &CancellationToken,
    accumulated: &mut String,
) -> Result<MessageStatus> {
    let status_for_partial = |accumulated: &String| {
        if accumulated.is_empty() {
            MessageStatus::Failed
        } else {
            MessageStatus::Sent
        }
    };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                tracing::debug!("Generation {} cancelled", params.message_id);
                return Ok(status_for_partial(accumulated));
            }
            event = rx.recv() => {
                match event {
                    Some(GenerationEvent::Token(token)) => {
                        accumulated.push_str(&token);
                        store
                            .update_message_fields(
                                &params.message_id,
                                MessageUpdate::content(accumulated.clone()),
                            )
                            .await?;
                    }
                    Some(GenerationEvent::Done) => return Ok(MessageStatus::Sent),
                    Some(GenerationEvent::Error(error)) => {
                        tracing::warn!("Generation {} failed: {}", params.message_id, error);
                        return Ok(MessageStatus::Failed);
                    }
                    None => return Ok(status_for_partial(accumulated)),
                }
            }
        }
    }
}
