//! Commit ordering for one session
//!
//! Every accepted request takes a ticket. Work for tickets may finish in any
//! order, but commits happen strictly in ticket order: a ticket waits until
//! every earlier ticket has completed or been dropped.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

struct Progress {
    next_issue: u64,
    head: u64,
    /// Dropped tickets ahead of `head`, skipped when it reaches them
    abandoned: BTreeSet<u64>,
}

struct Inner {
    progress: Mutex<Progress>,
    head_tx: watch::Sender<u64>,
}

impl Inner {
    fn finish(&self, seq: u64) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if progress.head == seq {
            progress.head += 1;
            loop {
                let head = progress.head;
                if !progress.abandoned.remove(&head) {
                    break;
                }
                progress.head += 1;
            }
            self.head_tx.send_replace(progress.head);
        } else if seq > progress.head {
            progress.abandoned.insert(seq);
        }
    }
}

#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<Inner>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                progress: Mutex::new(Progress {
                    next_issue: 0,
                    head: 0,
                    abandoned: BTreeSet::new(),
                }),
                head_tx,
            }),
        }
    }

    /// Take the next position in commit order
    pub fn issue(&self) -> Ticket {
        let mut progress = self.inner.progress.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = progress.next_issue;
        progress.next_issue += 1;
        Ticket {
            seq,
            inner: self.inner.clone(),
            finished: false,
        }
    }

    /// Sequence number of the ticket allowed to commit now
    pub fn head(&self) -> u64 {
        *self.inner.head_tx.borrow()
    }
}

/// A position in commit order. Dropping it without [`Ticket::complete`]
/// releases the position so later tickets are not blocked.
pub struct Ticket {
    seq: u64,
    inner: Arc<Inner>,
    finished: bool,
}

impl Ticket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait until every earlier ticket has finished
    pub async fn wait_turn(&self) {
        let mut rx = self.inner.head_tx.subscribe();
        let seq = self.seq;
        // The sender lives as long as this ticket, so the channel cannot close
        let _ = rx.wait_for(|head| *head >= seq).await;
    }

    /// Release the next ticket
    pub fn complete(mut self) {
        self.finished = true;
        self.inner.finish(self.seq);
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.finish(self.seq);
        }
    }
}
