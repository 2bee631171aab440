//! Runtime helpers shared by the bootnode crates.

pub mod sync;

use std::future::Future;

use log::trace;

pub use ::tokio::{io, join, net, select, signal, time, try_join};
pub use ::tokio::task::JoinHandle;

/// Spawn a named, detached task.
///
/// The name only shows up in trace logs; the returned handle may be dropped
/// without cancelling the task.
#[track_caller]
pub fn spawn_task<F, S>(name: S, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Into<String>,
{
    let name = name.into();
    if log::log_enabled!(log::Level::Trace) {
        trace!("Spawning task: {}", name);
    }

    ::tokio::spawn(async move {
        let output = future.await;
        if log::log_enabled!(log::Level::Trace) {
            trace!("Task {} finished", name);
        }
        output
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_task_returns_output() {
        let handle = spawn_task("answer", async { 42 });
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_dropped_handle_keeps_running() {
        let (sender, receiver) = sync::oneshot::channel();
        drop(spawn_task("detached", async move {
            let _ = sender.send(());
        }));
        assert!(receiver.await.is_ok());
    }
}
