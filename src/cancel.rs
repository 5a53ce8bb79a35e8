//! Run-level cancellation
//!
//! A [`CancelToken`] is cloned into the producer, every worker, the signal
//! handler and the error budget check. The first `cancel` wins and its
//! reason is what the run summary reports.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::warn;

/// Why a run was cancelled
#[derive(Debug, Clone, PartialEq)]
pub enum CancelReason {
    /// SIGINT / Ctrl-C
    Interrupted,
    /// The configured error budget was exhausted
    ErrorBudgetExceeded(String),
    /// Cancelled programmatically
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Interrupted => f.write_str("interrupted"),
            CancelReason::ErrorBudgetExceeded(why) => write!(f, "error budget exceeded: {}", why),
            CancelReason::Requested => f.write_str("cancel requested"),
        }
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Handle for removing a hook registered with [`CancelToken::on_cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

#[derive(Default)]
struct Hooks {
    next_id: u64,
    pending: Vec<(u64, Hook)>,
}

struct Inner {
    reason: OnceLock<CancelReason>,
    hooks: Mutex<Hooks>,
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                reason: OnceLock::new(),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    /// Cancel with `reason`. Returns `false` if the token was already
    /// cancelled, in which case the original reason stands.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        if self.inner.reason.set(reason).is_err() {
            return false;
        }
        if let Some(reason) = self.inner.reason.get() {
            warn!("Cancelling replay: {}", reason);
        }
        let hooks = std::mem::take(&mut self.inner.hooks.lock().pending);
        for (_, hook) in hooks {
            hook();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.get().cloned()
    }

    /// Run `hook` once on cancellation; immediately if already cancelled.
    ///
    /// Tokens can outlive a run, so callers that register per-run hooks
    /// remove them with [`CancelToken::remove_hook`] when the run ends.
    pub fn on_cancel<F>(&self, hook: F) -> HookId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = {
            let mut hooks = self.inner.hooks.lock();
            let id = hooks.next_id;
            hooks.next_id += 1;
            if !self.is_cancelled() {
                hooks.pending.push((id, Box::new(hook)));
                return HookId(id);
            }
            id
        };
        hook();
        HookId(id)
    }

    /// Drop a hook that has not run yet. `false` if it already ran or was
    /// removed.
    pub fn remove_hook(&self, id: HookId) -> bool {
        let mut hooks = self.inner.hooks.lock();
        let before = hooks.pending.len();
        hooks.pending.retain(|(hid, _)| *hid != id.0);
        hooks.pending.len() != before
    }

    #[cfg(test)]
    pub(crate) fn pending_hooks(&self) -> usize {
        self.inner.hooks.lock().pending.len()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.inner.reason.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel(CancelReason::Interrupted));
        assert!(!token.cancel(CancelReason::Requested));
        assert_eq!(token.reason(), Some(CancelReason::Interrupted));
        assert!(token.clone().is_cancelled());
    }

    #[test]
    fn test_hooks_run_once() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel(CancelReason::Requested);
        token.cancel(CancelReason::Requested);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Late registration fires immediately
        let h = hits.clone();
        token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_removed_hook_never_runs() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let keep = token.on_cancel(|| {});
        assert_ne!(id, keep);
        assert_eq!(token.pending_hooks(), 2);

        assert!(token.remove_hook(id));
        assert!(!token.remove_hook(id));
        assert_eq!(token.pending_hooks(), 1);

        token.cancel(CancelReason::Requested);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(token.pending_hooks(), 0);
    }
}
