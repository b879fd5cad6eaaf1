//! Relay for long-running generated content.
//!
//! A generation backend appends tokens tied to one intention; the relay
//! concatenates them in call order into a single content segment it
//! owns, persisting and reporting at most once per flush interval
//! (default 500 ms) so subscribers see partial progress without a
//! write-per-token storm. `finalize` flushes whatever remains, drives
//! the intention's lifecycle to a terminal state through the validated
//! transition path, and drops the accumulator. A failed upstream must
//! still finalize, with a readable reason persisted into the content,
//! so subscribers never wait on a non-terminal state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{Intention, IntentionStatus, SpaceId};
use crate::store::SpaceStore;

pub const DEFAULT_RELAY_FLUSH: Duration = Duration::from_millis(500);

/// Terminal outcome of a generation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Complete,
    Failed,
}

impl StreamOutcome {
    pub fn status(self) -> IntentionStatus {
        match self {
            StreamOutcome::Complete => IntentionStatus::Complete,
            StreamOutcome::Failed => IntentionStatus::Failed,
        }
    }
}

/// Result of one `append_token` call.
#[derive(Debug, Clone, Copy)]
pub struct TokenFlush {
    pub space_id: SpaceId,
    /// Whether this call persisted and should be broadcast.
    pub persisted: bool,
}

struct TokenAccumulator {
    space_id: SpaceId,
    /// Index of the content segment this stream owns; set on first
    /// persist so earlier content elements are never touched.
    segment: Option<usize>,
    /// Full concatenation of every token received, in call order.
    text: String,
    last_persist: Option<Instant>,
}

pub struct StreamingRelay {
    store: Arc<dyn SpaceStore>,
    flush_interval: Duration,
    active: Mutex<HashMap<Uuid, TokenAccumulator>>,
}

impl StreamingRelay {
    pub fn new(store: Arc<dyn SpaceStore>, flush_interval: Duration) -> Self {
        Self {
            store,
            flush_interval,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Append one token. Returns whether the accumulated content was
    /// persisted (the caller broadcasts only then).
    pub async fn append_token(
        &self,
        intention_id: Uuid,
        token: &str,
    ) -> Result<TokenFlush, SyncError> {
        let mut active = self.active.lock().await;

        if !active.contains_key(&intention_id) {
            let intention = self
                .store
                .intention(intention_id)?
                .ok_or(SyncError::UnknownIntention(intention_id))?;
            if intention.status.is_terminal() {
                return Err(SyncError::AlreadyFinalized(intention_id));
            }
            active.insert(
                intention_id,
                TokenAccumulator {
                    space_id: intention.space_id,
                    segment: None,
                    text: String::new(),
                    last_persist: None,
                },
            );
        }

        let acc = active
            .get_mut(&intention_id)
            .ok_or(SyncError::UnknownIntention(intention_id))?;
        acc.text.push_str(token);

        let due = match acc.last_persist {
            None => true,
            Some(at) => at.elapsed() >= self.flush_interval,
        };
        if !due {
            return Ok(TokenFlush {
                space_id: acc.space_id,
                persisted: false,
            });
        }

        let mut intention = self
            .store
            .intention(intention_id)?
            .ok_or(SyncError::UnknownIntention(intention_id))?;
        write_segment(&mut intention, acc);
        intention.touch();
        self.store.upsert_intention(intention)?;
        acc.last_persist = Some(Instant::now());
        log::trace!(
            "Persisted {} chars of streamed content for intention {intention_id}",
            acc.text.len()
        );

        Ok(TokenFlush {
            space_id: acc.space_id,
            persisted: true,
        })
    }

    /// Flush remaining content, drive the lifecycle to its terminal
    /// state, persist, and drop the accumulator. Exactly once per
    /// intention: a second call fails with `AlreadyFinalized`.
    pub async fn finalize(
        &self,
        intention_id: Uuid,
        outcome: StreamOutcome,
        content: Option<String>,
    ) -> Result<SpaceId, SyncError> {
        let mut active = self.active.lock().await;
        let acc = active.remove(&intention_id);

        let mut intention = self
            .store
            .intention(intention_id)?
            .ok_or(SyncError::UnknownIntention(intention_id))?;
        if intention.status.is_terminal() {
            return Err(SyncError::AlreadyFinalized(intention_id));
        }

        let mut acc = acc.unwrap_or(TokenAccumulator {
            space_id: intention.space_id,
            segment: None,
            text: String::new(),
            last_persist: None,
        });

        match outcome {
            StreamOutcome::Complete => {
                if let Some(text) = content {
                    acc.text = text;
                }
            }
            StreamOutcome::Failed => {
                let reason = content.unwrap_or_else(|| "generation failed".to_string());
                if acc.text.is_empty() {
                    acc.text = reason;
                } else {
                    acc.text.push_str("\n");
                    acc.text.push_str(&reason);
                }
            }
        }
        if !acc.text.is_empty() {
            write_segment(&mut intention, &mut acc);
        }

        let target = outcome.status();
        if !intention.status.can_transition(target)
            && intention.status.can_transition(IntentionStatus::Active)
        {
            intention.transition(IntentionStatus::Active)?;
        }
        intention.transition(target)?;
        self.store.upsert_intention(intention)?;
        log::debug!("Intention {intention_id} finalized as {target}");

        Ok(acc.space_id)
    }

    /// Whether a generation stream is currently open for the intention.
    pub async fn is_streaming(&self, intention_id: Uuid) -> bool {
        self.active.lock().await.contains_key(&intention_id)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

/// Write the accumulated text into the segment this stream owns,
/// appending it on first persist and overwriting in place after.
fn write_segment(intention: &mut Intention, acc: &mut TokenAccumulator) {
    match acc.segment {
        Some(i) if i < intention.content.len() => {
            intention.content[i] = acc.text.clone();
        }
        _ => {
            intention.content.push(acc.text.clone());
            acc.segment = Some(intention.content.len() - 1);
        }
    }
}
