//! Copy-on-write transaction over a workspace.
//!
//! A [`Tx`] clones its base workspace into an owned mutable copy, exposes the
//! copy for tool mutation, and on commit computes the slot-level patch and
//! atomically replaces the caller's target. Single-use by move semantics:
//! `commit` and `rollback` consume the transaction, and a `Tx` dropped
//! without commit leaves the target untouched.
//!
//! A `Tx` is deliberately `!Send`: it belongs to the thread driving one run,
//! and the commit contract requires the caller to already hold exclusive
//! access to the target (`&mut Workspace` encodes exactly that).

use std::marker::PhantomData;

use super::{compute_patch, Workspace};

/// Single-use workspace transaction.
#[derive(Debug)]
pub struct Tx {
    base: Workspace,
    tmp: Workspace,
    // Pins the Tx to its creating thread; commit requires the caller's
    // exclusive borrow of the target and must not migrate mid-flight.
    _not_send: PhantomData<*const ()>,
}

impl Tx {
    /// Opens a transaction by cloning `base`.
    #[must_use]
    pub fn new(base: &Workspace) -> Self {
        Self {
            base: base.clone(),
            tmp: base.clone(),
            _not_send: PhantomData,
        }
    }

    /// The mutable working copy. Tools mutate this; nothing is visible
    /// outside the transaction until commit.
    pub fn tmp(&mut self) -> &mut Workspace {
        &mut self.tmp
    }

    /// Read access to the working copy without taking `&mut self`.
    #[must_use]
    pub fn tmp_ref(&self) -> &Workspace {
        &self.tmp
    }

    /// The immutable snapshot the transaction was opened against.
    #[must_use]
    pub fn base(&self) -> &Workspace {
        &self.base
    }

    /// Commits: computes the base→tmp slot patch, replaces `target` with the
    /// working copy, and returns the patch as JSON text.
    ///
    /// `target` is taken by exclusive reference; callers arrange any locking
    /// above this call. Commit itself cannot fail.
    #[must_use = "the computed patch is the audit record of this commit"]
    pub fn commit(self, target: &mut Workspace) -> String {
        let patch = compute_patch(&self.base, &self.tmp);
        *target = self.tmp;
        serde_json::to_string(&patch).unwrap_or_else(|_| "[]".to_string())
    }

    /// Rolls back, discarding the working copy.
    pub fn rollback(self) {}
}
