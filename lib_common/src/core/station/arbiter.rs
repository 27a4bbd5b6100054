//! # Candidate Arbitration
//!
//! Accept mode may see several inbound sockets at once: a station reconnecting
//! before its old socket timed out, a port scanner, a stray client. Each one is
//! a candidate until it proves itself. On every tick:
//!
//! 1. an active link whose task ended is cleared;
//! 2. each candidate that completed its handshake replaces the active link
//!    (the old one is detached and stopped without waiting);
//! 3. each candidate older than the handshake timeout, or stamped in the
//!    future, is stopped and dropped;
//! 4. candidates whose task already ended are dropped.
//!
//! The arbiter is generic over [`Candidate`] so the rules can be exercised
//! without sockets.

use std::time::Duration;

use tokio::time::Instant;

/// What the arbiter needs to know about a link.
pub trait Candidate {
    /// What the active link delivers into.
    type Attachment: Clone;

    /// Peer confirmed.
    fn handshake_complete(&self) -> bool;
    /// When the link was accepted.
    fn established_at(&self) -> Instant;
    /// The link task has ended.
    fn is_finished(&self) -> bool;
    /// Starts delivering output.
    fn attach(&self, attachment: Self::Attachment);
    /// Stops delivering output.
    fn detach(&self);
    /// Requests the link to end, without waiting.
    fn stop(&self);
}

/// Summary of one tick, for status reporting and logs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// Candidates promoted to active.
    pub promoted: usize,
    /// Candidates dropped for not completing the handshake in time.
    pub expired: usize,
    /// Candidates dropped because their task had ended.
    pub closed: usize,
    /// The active link ended on its own.
    pub active_lost: bool,
}

/// Holds the active link and the pending candidates of one accept manager.
pub struct Arbiter<C: Candidate> {
    active: Option<C>,
    candidates: Vec<C>,
    attachment: C::Attachment,
    handshake_timeout: Duration,
}

impl<C: Candidate> Arbiter<C> {
    /// Creates an arbiter that attaches promoted links to `attachment`.
    pub fn new(attachment: C::Attachment, handshake_timeout: Duration) -> Self {
        Self {
            active: None,
            candidates: Vec::new(),
            attachment,
            handshake_timeout,
        }
    }

    /// Adds a freshly accepted link.
    pub fn add_candidate(&mut self, candidate: C) {
        self.candidates.push(candidate);
    }

    /// The authoritative link, if any.
    pub fn active(&self) -> Option<&C> {
        self.active.as_ref()
    }

    /// Number of links still handshaking.
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Applies the promotion and expiry rules at time `now`.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if self.active.as_ref().is_some_and(C::is_finished) {
            self.active = None;
            outcome.active_lost = true;
        }

        for candidate in std::mem::take(&mut self.candidates) {
            if candidate.is_finished() {
                outcome.closed += 1;
                continue;
            }

            if candidate.handshake_complete() {
                if let Some(old) = self.active.take() {
                    old.detach();
                    old.stop();
                }
                candidate.attach(self.attachment.clone());
                self.active = Some(candidate);
                outcome.promoted += 1;
                continue;
            }

            let expired = now
                .checked_duration_since(candidate.established_at())
                .map_or(true, |age| age > self.handshake_timeout);
            if expired {
                candidate.stop();
                outcome.expired += 1;
                continue;
            }

            self.candidates.push(candidate);
        }

        outcome
    }

    /// Detaches and stops everything, handing the links back for joining.
    pub fn drain(&mut self) -> Vec<C> {
        let mut all: Vec<C> = self.active.take().into_iter().collect();
        all.append(&mut self.candidates);
        for link in &all {
            link.detach();
            link.stop();
        }
        all
    }
}
