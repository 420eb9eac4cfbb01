//! Turn sessions: cancellation, pending uploads and the active-turn registry.
//!
//! A [`TurnSession`] is created when a turn starts and dropped when it ends.
//! It is passed explicitly to the stream consumer, the repair loop and the
//! apply engine; nothing here is process-global.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::types::ChatMode;

/// Cooperative cancellation flag shared between a turn and whoever may abort it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Placeholder tokens the model may write in place of an uploaded file.
#[derive(Debug, Clone, Default)]
pub struct UploadRegistry {
    entries: BTreeMap<String, PathBuf>,
}

impl UploadRegistry {
    pub const TOKEN_PREFIX: &'static str = "DYAD_ATTACHMENT_";

    /// Register `source` and return the token that stands for it.
    pub fn register(&mut self, source: impl Into<PathBuf>) -> String {
        let token = format!("{}{}", Self::TOKEN_PREFIX, self.entries.len());
        self.entries.insert(token.clone(), source.into());
        token
    }

    /// Source file for write content that is exactly a registered token.
    pub fn resolve(&self, content: &str) -> Option<&Path> {
        self.entries.get(content.trim()).map(PathBuf::as_path)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything the engine needs to know about the turn in flight.
#[derive(Debug, Clone)]
pub struct TurnSession {
    pub chat_id: i64,
    pub message_id: i64,
    pub mode: ChatMode,
    pub uploads: UploadRegistry,
    cancel: CancelToken,
    turn_id: u64,
}

impl TurnSession {
    /// A session not tracked by any registry.
    pub fn detached(chat_id: i64, message_id: i64, mode: ChatMode) -> Self {
        Self {
            chat_id,
            message_id,
            mode,
            uploads: UploadRegistry::default(),
            cancel: CancelToken::new(),
            turn_id: 0,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// At most one active turn per conversation.
#[derive(Debug, Default)]
pub struct ActiveTurns {
    turns: Mutex<HashMap<i64, (u64, CancelToken)>>,
    next_id: AtomicU64,
}

impl ActiveTurns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a turn, cancelling any turn already running for the same chat.
    pub fn start(&self, chat_id: i64, message_id: i64, mode: ChatMode) -> TurnSession {
        let turn_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancelToken::new();
        let previous = self
            .turns
            .lock()
            .insert(chat_id, (turn_id, cancel.clone()));
        if let Some((previous_id, previous_cancel)) = previous {
            info!(chat_id, previous_id, turn_id, "superseding active turn");
            previous_cancel.cancel();
        }
        debug!(chat_id, message_id, turn_id, "turn started");
        TurnSession {
            chat_id,
            message_id,
            mode,
            uploads: UploadRegistry::default(),
            cancel,
            turn_id,
        }
    }

    /// Remove the session's entry unless a newer turn has replaced it.
    pub fn finish(&self, session: &TurnSession) {
        let mut turns = self.turns.lock();
        if turns
            .get(&session.chat_id)
            .is_some_and(|(id, _)| *id == session.turn_id)
        {
            turns.remove(&session.chat_id);
            debug!(chat_id = session.chat_id, turn_id = session.turn_id, "turn finished");
        }
    }

    /// Cancel the active turn for `chat_id`; false if none is running.
    pub fn cancel(&self, chat_id: i64) -> bool {
        match self.turns.lock().get(&chat_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, chat_id: i64) -> bool {
        self.turns.lock().contains_key(&chat_id)
    }
}
