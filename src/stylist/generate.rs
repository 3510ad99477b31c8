use tracing::{debug, info, warn};

use crate::llm::{GeneratedImage, GenerationError, ImageEditor};
use crate::state::SessionStore;
use crate::stylist::session::{Completion, GenerateRejection, GenerationTicket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    Rejected(GenerateRejection),
    Succeeded(GeneratedImage),
    Failed(GenerationError),
    /// The session moved on (reset) before the reply arrived.
    Discarded,
}

pub fn start_generation(
    store: &SessionStore,
    session_key: i64,
) -> Result<GenerationTicket, GenerateRejection> {
    store.with_session(session_key, |session| session.begin_generation())
}

/// Sends the ticket's request and records the reply in the session unless it
/// has gone stale in the meantime.
pub async fn finish_generation(
    store: &SessionStore,
    session_key: i64,
    ticket: GenerationTicket,
    editor: &dyn ImageEditor,
) -> GenerateOutcome {
    info!(
        session = session_key,
        sequence = ticket.sequence,
        items = ticket.request.items.len(),
        model = editor.model_name(),
        "Starting style generation"
    );

    let result = editor.edit(&ticket.request).await;
    let completion = store.with_session(session_key, |session| {
        session.complete_generation(ticket.sequence, result.clone())
    });

    match (completion, result) {
        (Completion::Stale, _) => {
            debug!(
                session = session_key,
                sequence = ticket.sequence,
                "Discarding stale generation result"
            );
            GenerateOutcome::Discarded
        }
        (Completion::Applied, Ok(image)) => {
            info!(
                session = session_key,
                sequence = ticket.sequence,
                mime = %image.mime_type,
                "Style generation succeeded"
            );
            GenerateOutcome::Succeeded(image)
        }
        (Completion::Applied, Err(err)) => {
            warn!(
                session = session_key,
                sequence = ticket.sequence,
                "Style generation failed: {}",
                err
            );
            GenerateOutcome::Failed(err)
        }
    }
}

pub async fn run_generation(
    store: &SessionStore,
    session_key: i64,
    editor: &dyn ImageEditor,
) -> GenerateOutcome {
    match start_generation(store, session_key) {
        Ok(ticket) => finish_generation(store, session_key, ticket, editor).await,
        Err(rejection) => GenerateOutcome::Rejected(rejection),
    }
}
