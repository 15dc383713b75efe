//! Handle-closure cancellation
//!
//! Every open device handle owns a [`CancelToken`]. Blocking transport work
//! runs on a helper thread through [`run_cancellable`], and the calling
//! thread waits on either the work's result or the token. Closing the
//! handle drops the token's sender, which wakes every waiter at once with
//! [`BackendError::Cancelled`].

use crate::error::{BackendError, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Cancellation signal shared by all calls on one handle
#[derive(Debug)]
pub struct CancelToken {
    closed: AtomicBool,
    /// Dropped on cancel; receivers observe the disconnect
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a token in the open state
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            closed: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            signal,
        }
    }

    /// Cancel every in-flight and future call
    pub fn cancel(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Ok(mut trigger) = self.trigger.lock() {
                trigger.take();
            }
        }
    }

    /// Check if the handle has been closed
    pub fn is_cancelled(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` if the handle is closed
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BackendError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Receiver that disconnects when the token is cancelled
    pub fn signal(&self) -> Receiver<()> {
        self.signal.clone()
    }
}

/// Run blocking work on a helper thread, returning early if `token` is cancelled
///
/// The helper thread is detached on cancellation; its eventual result is
/// discarded.
pub fn run_cancellable<T, F>(token: &CancelToken, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    token.check()?;

    let (result_tx, result_rx) = bounded(1);
    let signal = token.signal();
    std::thread::Builder::new()
        .name("cambackend-io".to_string())
        .spawn(move || {
            let _ = result_tx.send(work());
        })
        .map_err(BackendError::Io)?;

    select! {
        recv(result_rx) -> result => match result {
            Ok(result) => result,
            Err(_) => Err(BackendError::Transport("I/O worker exited without a result".to_string())),
        },
        recv(signal) -> _ => Err(BackendError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_completes_without_cancel() {
        let token = CancelToken::new();
        let value = run_cancellable(&token, || Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_cancel_unblocks_waiter() {
        let token = Arc::new(CancelToken::new());
        let waiter_token = token.clone();
        let start = Instant::now();

        let waiter = std::thread::spawn(move || {
            run_cancellable(&waiter_token, || {
                std::thread::sleep(Duration::from_secs(5));
                Ok(())
            })
        });

        std::thread::sleep(Duration::from_millis(50));
        token.cancel();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(BackendError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_calls_after_cancel_fail_fast() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(
            run_cancellable(&token, || Ok(())),
            Err(BackendError::Cancelled)
        ));
    }
}
