//! Flush generation completion
//!
//! Every record appended between two flush cycles of a queue shares one
//! `Completion`. The flush thread swaps in a fresh one under the queue lock
//! and resolves the old one after the batch was synced.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ChangelogError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Flushed,
    Failed(String),
}

/// One-shot signal for a single flush generation
pub(crate) struct Completion {
    changelog_id: i32,
    generation: u64,
    outcome: Mutex<Option<Outcome>>,
    resolved: Condvar,
}

impl Completion {
    pub(crate) fn new(changelog_id: i32, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            changelog_id,
            generation,
            outcome: Mutex::new(None),
            resolved: Condvar::new(),
        })
    }

    /// Resolve the generation; returns false if it was already resolved
    pub(crate) fn resolve(&self, result: std::result::Result<(), String>) -> bool {
        let mut outcome = self.outcome.lock();
        if outcome.is_some() {
            return false;
        }
        *outcome = Some(match result {
            Ok(()) => Outcome::Flushed,
            Err(reason) => Outcome::Failed(reason),
        });
        self.resolved.notify_all();
        true
    }

    fn to_result(&self, outcome: &Outcome) -> Result<()> {
        match outcome {
            Outcome::Flushed => Ok(()),
            Outcome::Failed(reason) => Err(ChangelogError::FlushFailed {
                id: self.changelog_id,
                reason: reason.clone(),
            }),
        }
    }
}

/// Handle to the durability of appended records
///
/// Resolves exactly once, from the flush thread, after the records it covers
/// were written and synced (or the flush failed).
#[derive(Clone)]
pub struct FlushFuture {
    completion: Arc<Completion>,
}

impl FlushFuture {
    pub(crate) fn new(completion: Arc<Completion>) -> Self {
        Self { completion }
    }

    /// A future that is already resolved successfully
    pub(crate) fn ready(changelog_id: i32) -> Self {
        let completion = Completion::new(changelog_id, 0);
        completion.resolve(Ok(()));
        Self { completion }
    }

    /// Flush generation this future belongs to
    pub fn generation(&self) -> u64 {
        self.completion.generation
    }

    pub fn is_ready(&self) -> bool {
        self.completion.outcome.lock().is_some()
    }

    /// Block until the generation is resolved
    pub fn wait(&self) -> Result<()> {
        let mut outcome = self.completion.outcome.lock();
        loop {
            if let Some(resolved) = outcome.as_ref() {
                return self.completion.to_result(resolved);
            }
            self.completion.resolved.wait(&mut outcome);
        }
    }

    /// Block for at most `timeout`; `None` if still unresolved
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.completion.outcome.lock();
        loop {
            if let Some(resolved) = outcome.as_ref() {
                return Some(self.completion.to_result(resolved));
            }
            if self
                .completion
                .resolved
                .wait_until(&mut outcome, deadline)
                .timed_out()
            {
                return outcome
                    .as_ref()
                    .map(|resolved| self.completion.to_result(resolved));
            }
        }
    }
}

impl fmt::Debug for FlushFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushFuture")
            .field("changelog_id", &self.completion.changelog_id)
            .field("generation", &self.completion.generation)
            .field("ready", &self.is_ready())
            .finish()
    }
}
