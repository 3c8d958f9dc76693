//! Background work owned by one monitor
//!
//! Components spawn their detached work (follow-up delays, budget checks,
//! draft timers and scoring calls) through a shared [`TaskScope`] so that
//! shutdown can abort all of it, not only the long-running channel loops.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;

#[derive(Default)]
struct ScopeState {
    handles: Vec<AbortHandle>,
    closed: bool,
}

/// Cloneable handle to a set of abortable tasks
#[derive(Clone, Default)]
pub struct TaskScope {
    state: Arc<Mutex<ScopeState>>,
}

impl TaskScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` in this scope.
    ///
    /// Returns `None` once the scope has been closed; the future is dropped
    /// without running.
    pub fn spawn<F>(&self, future: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().ok()?;
        if state.closed {
            return None;
        }
        state.handles.retain(|h| !h.is_finished());
        let handle = tokio::spawn(future).abort_handle();
        state.handles.push(handle.clone());
        Some(handle)
    }

    /// Abort every live task and refuse new ones.
    pub fn close(&self) {
        let handles = match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                std::mem::take(&mut state.handles)
            }
            Err(_) => return,
        };
        for handle in handles {
            handle.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Tasks spawned here that have not finished yet
    pub fn live(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.handles.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_close_aborts_pending_work() {
        let scope = TaskScope::new();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        assert!(scope
            .spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .is_some());
        assert_eq!(scope.live(), 1);

        scope.close();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert!(scope.is_closed());
        assert_eq!(scope.live(), 0);
    }

    #[tokio::test]
    async fn test_closed_scope_refuses_spawns() {
        let scope = TaskScope::new();
        scope.close();
        assert!(scope.spawn(async {}).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_tasks_are_not_counted() {
        let scope = TaskScope::new();
        scope.spawn(async {});
        scope.spawn(async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scope.live(), 1);
    }
}
