//! Cooperative suspension gate.
//!
//! A running task calls [`ExecutionFence::fence`] at a safe point. While the
//! fence is armed the call suspends; [`ExecutionFence::resume`] releases every
//! caller suspended at that moment, even if the fence is armed again before
//! they get to run. The gate only holds a single armed/disarmed slot, so
//! repeated `pause()` calls collapse into one.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
struct Gate {
    armed: bool,
    /// Bumped on every resume.
    generation: u64,
}

/// Single-slot suspend/resume gate.
#[derive(Debug)]
pub struct ExecutionFence {
    gate: watch::Sender<Gate>,
}

impl ExecutionFence {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(Gate::default());
        Self { gate }
    }

    /// Arm the gate. No-op if already armed.
    pub fn pause(&self) {
        self.gate.send_if_modified(|gate| {
            if gate.armed {
                false
            } else {
                gate.armed = true;
                true
            }
        });
    }

    /// Disarm the gate and release all suspended callers. No-op if unarmed.
    pub fn resume(&self) {
        self.gate.send_if_modified(|gate| {
            if gate.armed {
                gate.armed = false;
                gate.generation += 1;
                true
            } else {
                false
            }
        });
    }

    pub fn is_paused(&self) -> bool {
        self.gate.borrow().armed
    }

    /// Suspension point: returns immediately when unarmed, otherwise waits
    /// until the next [`resume`](Self::resume).
    pub async fn fence(&self) {
        let mut rx = self.gate.subscribe();
        let entered = *rx.borrow_and_update();
        if !entered.armed {
            return;
        }
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx
            .wait_for(|gate| gate.generation != entered.generation)
            .await;
    }
}

impl Default for ExecutionFence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_unarmed_fence_returns_immediately() {
        let fence = ExecutionFence::new();
        tokio::time::timeout(Duration::from_millis(50), fence.fence())
            .await
            .expect("unarmed fence should not block");
    }

    #[tokio::test]
    async fn test_resume_while_unarmed_is_noop() {
        let fence = ExecutionFence::new();
        fence.resume();
        assert!(!fence.is_paused());
        fence.pause();
        fence.pause();
        assert!(fence.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_releases_waiters_even_if_rearmed() {
        let fence = Arc::new(ExecutionFence::new());
        fence.pause();

        let waiter = {
            let fence = fence.clone();
            tokio::spawn(async move { fence.fence().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        fence.resume();
        fence.pause();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter suspended before resume must be released")
            .unwrap();
        assert!(fence.is_paused());

        // A caller arriving after the re-arm waits for the next resume.
        let late = {
            let fence = fence.clone();
            tokio::spawn(async move { fence.fence().await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!late.is_finished());
        fence.resume();
        late.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_fence_releases_all_waiters_on_resume() {
        let fence = Arc::new(ExecutionFence::new());
        let released = Arc::new(AtomicUsize::new(0));
        fence.pause();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let fence = fence.clone();
            let released = released.clone();
            handles.push(tokio::spawn(async move {
                fence.fence().await;
                released.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(released.load(Ordering::SeqCst), 0);

        fence.resume();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert!(!fence.is_paused());
    }
}
