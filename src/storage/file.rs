use std::collections::VecDeque;

use super::ClientId;

/// Result of asking for a file lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller owns the lock now.
    Acquired,
    /// The caller waits in the file's queue and is granted the lock later.
    Queued,
}

/// A file held in memory.
#[derive(Debug, Default)]
pub struct File {
    data: Vec<u8>,
    /// Set on create, cleared by the first write.
    created_empty: bool,
    owner: Option<ClientId>,
    waiters: VecDeque<ClientId>,
}

impl File {
    pub(super) fn created(owner: Option<ClientId>) -> Self {
        Self {
            data: Vec::new(),
            created_empty: true,
            owner,
            waiters: VecDeque::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_created_empty(&self) -> bool {
        self.created_empty
    }

    pub fn owner(&self) -> Option<ClientId> {
        self.owner
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn waiters(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.waiters.iter().copied()
    }

    /// Locked by someone other than `client`.
    pub fn locked_by_other(&self, client: ClientId) -> bool {
        matches!(self.owner, Some(owner) if owner != client)
    }

    /// Replaces the content of a freshly created file, returning the size delta.
    pub(super) fn fill(&mut self, data: Vec<u8>) -> usize {
        self.data = data;
        self.created_empty = false;
        self.data.len()
    }

    pub(super) fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub(super) fn take_waiters(&mut self) -> VecDeque<ClientId> {
        std::mem::take(&mut self.waiters)
    }

    /// Grants the lock when free and nobody queued ahead; otherwise queues
    /// the caller once.
    pub(super) fn lock(&mut self, client: ClientId) -> LockOutcome {
        match self.owner {
            Some(owner) if owner == client => LockOutcome::Acquired,
            None if self.waiters.is_empty() => {
                self.owner = Some(client);
                LockOutcome::Acquired
            }
            _ => {
                if !self.waiters.contains(&client) {
                    self.waiters.push_back(client);
                }
                LockOutcome::Queued
            }
        }
    }

    /// Clears ownership if `client` holds the lock.
    pub(super) fn release(&mut self, client: ClientId) -> bool {
        if self.owner == Some(client) {
            self.owner = None;
            true
        } else {
            false
        }
    }

    pub(super) fn remove_waiter(&mut self, client: ClientId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|&waiter| waiter != client);
        before != self.waiters.len()
    }

    /// Hands a free lock to the head waiter.
    pub(super) fn grant_next(&mut self) -> Option<ClientId> {
        if self.owner.is_some() {
            return None;
        }
        let next = self.waiters.pop_front()?;
        self.owner = Some(next);
        Some(next)
    }
}
