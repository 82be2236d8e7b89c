// SPDX-License-Identifier: MIT OR Apache-2.0
//! Re-entrancy sentinel for the transport write path.
//!
//! The sentinel is task-local, so it survives await points and stays
//! correct when the runtime migrates a task between threads. Any log
//! emission that happens while a socket write is on the call stack sees
//! the flag set and takes the tracing-only path instead of producing a
//! new fabric message.

use std::future::Future;

tokio::task_local! {
    static IN_TRANSPORT_WRITE: bool;
}

/// Whether the current task is inside a transport write.
#[must_use]
pub fn in_transport_write() -> bool {
    IN_TRANSPORT_WRITE.try_with(|v| *v).unwrap_or(false)
}

/// Run `fut` with the transport-write sentinel set.
///
/// Socket writer tasks wrap every frame send in this scope; the log
/// pipeline refuses to create fabric messages while it is active.
pub async fn transport_write_scope<F>(fut: F) -> F::Output
where
    F: Future,
{
    IN_TRANSPORT_WRITE.scope(true, fut).await
}

/// Synchronous variant of [`transport_write_scope`].
pub fn transport_write_scope_sync<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    IN_TRANSPORT_WRITE.sync_scope(true, f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_sets_and_clears_the_flag() {
        assert!(!in_transport_write());
        transport_write_scope(async {
            assert!(in_transport_write());
        })
        .await;
        assert!(!in_transport_write());
    }

    #[test]
    fn sync_scope_sets_and_clears_the_flag() {
        assert!(!in_transport_write());
        transport_write_scope_sync(|| {
            assert!(in_transport_write());
        });
        assert!(!in_transport_write());
    }

    #[tokio::test]
    async fn flag_survives_await_points() {
        transport_write_scope(async {
            tokio::task::yield_now().await;
            assert!(in_transport_write());
        })
        .await;
    }

    #[tokio::test]
    async fn flag_is_per_task() {
        transport_write_scope(async {
            let other = tokio::spawn(async { in_transport_write() });
            assert!(!other.await.unwrap());
        })
        .await;
    }
}
