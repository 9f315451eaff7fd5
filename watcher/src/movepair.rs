//! Correlates the two halves of a rename into a single move notification.
//!
//! The kernel reports a rename as a `moved_from`/`moved_to` pair sharing a
//! cookie. Only same-cookie pairs are joined; a half whose partner does not
//! arrive within the timeout, or that is displaced by a half with a
//! different cookie, is emitted one-sided with the unobserved endpoint
//! empty.

use crate::Notification;

#[derive(Debug)]
struct PendingMove {
    cookie: usize,
    path: std::path::PathBuf,
    from: bool,
    started: std::time::Instant,
}

#[derive(Debug)]
pub struct MovePairTracker {
    timeout: std::time::Duration,
    pending: Option<PendingMove>,
}

impl MovePairTracker {
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            timeout,
            pending: None,
        }
    }

    fn orphan(pending: PendingMove) -> Notification {
        if pending.from {
            Notification::moved(Some(pending.path), None)
        } else {
            Notification::moved(None, Some(pending.path))
        }
    }

    /// Feed one rename half. Returns the notifications that became final:
    /// a completed pair, a flushed orphan, or nothing while a half waits
    /// for its partner.
    pub fn on_half(
        &mut self,
        cookie: Option<usize>,
        is_from: bool,
        path: std::path::PathBuf,
        now: std::time::Instant,
    ) -> Vec<Notification> {
        let mut out = Vec::new();
        if let Some(orphan) = self.flush_expired(now) {
            out.push(orphan);
        }
        let Some(cookie) = cookie else {
            // no cookie means no partner can ever match
            out.push(if is_from {
                Notification::moved(Some(path), None)
            } else {
                Notification::moved(None, Some(path))
            });
            return out;
        };
        match self.pending.take() {
            Some(pending) if pending.cookie == cookie && pending.from != is_from => {
                let (src, dst) = if pending.from {
                    (pending.path, path)
                } else {
                    (path, pending.path)
                };
                out.push(Notification::moved(Some(src), Some(dst)));
            }
            Some(pending) => {
                // a different rename started; the old half has no partner
                out.push(Self::orphan(pending));
                self.pending = Some(PendingMove {
                    cookie,
                    path,
                    from: is_from,
                    started: now,
                });
            }
            None => {
                self.pending = Some(PendingMove {
                    cookie,
                    path,
                    from: is_from,
                    started: now,
                });
            }
        }
        out
    }

    /// When the watcher task should wake up to flush a stale half.
    pub fn deadline(&self) -> Option<std::time::Instant> {
        self.pending.as_ref().map(|p| p.started + self.timeout)
    }

    /// Emit the pending half one-sided if its window has expired.
    pub fn flush_expired(&mut self, now: std::time::Instant) -> Option<Notification> {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| now >= p.started + self.timeout)
        {
            return self.pending.take().map(Self::orphan);
        }
        None
    }
}
