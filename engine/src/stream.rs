//! Incremental consumption of a model response.
//!
//! Chunks are fed to a [`StreamParser`] as they arrive. Cancellation is checked
//! between chunks. When the finished response stops inside a write tag, the
//! model is asked to continue, up to `max_continuations` extra rounds, and the
//! continuation is appended to the same response.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::parser::StreamParser;
use crate::core::types::ParsedResponse;
use crate::io::model::{CONTINUE_PROMPT, ChatMessage, ModelClient, ModelRequest};
use crate::session::TurnSession;

/// A response after the stream ended, was cancelled, or ran out of continuations.
#[derive(Debug, Clone)]
pub struct StreamedResponse {
    /// Everything received, unescaped.
    pub text: String,
    pub parsed: ParsedResponse,
    pub cancelled: bool,
    pub continuations: u32,
    /// The last write tag never closed, even after continuing.
    pub truncated: bool,
}

/// Stream `request` to completion. `on_chunk` sees the parser after every chunk.
#[instrument(skip_all, fields(chat_id = session.chat_id, max_continuations))]
pub fn consume_stream<M, F>(
    client: &M,
    request: &ModelRequest,
    session: &TurnSession,
    max_continuations: u32,
    mut on_chunk: F,
) -> Result<StreamedResponse>
where
    M: ModelClient + ?Sized,
    F: FnMut(&StreamParser),
{
    let mut parser = StreamParser::new();
    let mut continuations = 0u32;
    let mut round_request = request.clone();

    loop {
        let chunks = client
            .stream(&round_request)
            .context("start model stream")?;
        let mut received = 0usize;
        for chunk in chunks {
            if session.is_cancelled() {
                break;
            }
            let chunk = chunk.context("read model stream")?;
            received += chunk.len();
            parser.push(&chunk);
            on_chunk(&parser);
        }
        debug!(received, continuations, "model stream ended");

        if session.is_cancelled() {
            info!(received = parser.raw().len(), "stream cancelled");
            return Ok(finish(parser, continuations, true));
        }
        if !parser.is_truncated() {
            break;
        }
        if continuations >= max_continuations {
            warn!(continuations, "response still ends inside a write tag");
            break;
        }
        continuations += 1;
        info!(continuations, "response ended inside a write tag, continuing");
        round_request = request.followed_by([
            ChatMessage::assistant(parser.raw()),
            ChatMessage::user(CONTINUE_PROMPT),
        ]);
    }

    Ok(finish(parser, continuations, false))
}

fn finish(parser: StreamParser, continuations: u32, cancelled: bool) -> StreamedResponse {
    StreamedResponse {
        truncated: !cancelled && parser.is_truncated(),
        parsed: parser.snapshot(),
        text: parser.raw().to_string(),
        cancelled,
        continuations,
    }
}
