use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::row_identity::PredicateConfidence;

/// Single-use pass for one specific set of statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfirmationToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Allowed,
    /// The plan cannot prove it targets single rows; the caller must echo
    /// this token back through `confirm` before dispatch.
    ConfirmationRequired(ConfirmationToken),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("confirmation token is unknown or was already used")]
    UnknownToken,
    #[error("statements changed since the confirmation token was issued")]
    StatementMismatch,
}

/// Stops mutations whose row identity is weaker than a full primary key
/// from running un-acknowledged. Tokens are bound to a fingerprint of the
/// exact statements and burn on first use, so neither a stale confirmation
/// nor an edited plan can slip through.
#[derive(Debug)]
pub struct MutationGuard {
    enabled: AtomicBool,
    next_token: AtomicU64,
    pending: Mutex<HashMap<ConfirmationToken, u64>>,
}

impl Default for MutationGuard {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MutationGuard {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Judges a plan by its weakest predicate. Exact plans (and empty ones)
    /// always pass; anything weaker gets a token when the guard is on.
    #[must_use]
    pub fn check(
        &self,
        worst_confidence: Option<PredicateConfidence>,
        statements: &[String],
    ) -> GuardDecision {
        let Some(confidence) = worst_confidence else {
            return GuardDecision::Allowed;
        };
        if !self.is_enabled() || confidence.is_exact() {
            return GuardDecision::Allowed;
        }

        let token = ConfirmationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.pending
            .lock()
            .expect("guard token table poisoned")
            .insert(token, fingerprint(statements));
        GuardDecision::ConfirmationRequired(token)
    }

    /// Burns the token. Succeeds only when the statements are byte-for-byte
    /// the ones the token was issued for.
    pub fn confirm(
        &self,
        token: ConfirmationToken,
        statements: &[String],
    ) -> Result<(), GuardError> {
        let expected = self
            .pending
            .lock()
            .expect("guard token table poisoned")
            .remove(&token)
            .ok_or(GuardError::UnknownToken)?;

        if expected != fingerprint(statements) {
            return Err(GuardError::StatementMismatch);
        }
        Ok(())
    }
}

fn fingerprint(statements: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    statements.hash(&mut hasher);
    hasher.finish()
}
