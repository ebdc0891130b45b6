use std::future::Future;
use std::thread::JoinHandle;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, error};


/// A single-threaded async runtime driven by a dedicated OS thread. Each queue owns one, so the
///  sockets of different queues never share a thread.
///
/// Stopping the loop drops the runtime, which cancels all tasks still running on it and closes
///  the sockets they own.
pub struct EventLoop {
    name: String,
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn new(name: &str) -> anyhow::Result<EventLoop> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (shutdown, shutdown_receiver) = oneshot::channel::<()>();

        let thread_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("starting event loop {}", thread_name);
                // spawned tasks make progress while this waits for the shutdown signal
                let _ = runtime.block_on(shutdown_receiver);
                debug!("event loop {} stopped", thread_name);
            })?;

        Ok(EventLoop {
            name: name.to_string(),
            handle,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// idempotent
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("event loop thread {} panicked", self.name);
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;

    #[test]
    fn test_spawned_tasks_run_on_the_loop_thread() {
        let mut event_loop = EventLoop::new("test-loop").unwrap();

        let (sender, receiver) = std::sync::mpsc::channel();
        event_loop.spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            sender.send(std::thread::current().name().map(|s| s.to_string())).unwrap();
        });

        let thread_name = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(thread_name.as_deref(), Some("test-loop"));

        event_loop.stop();
        event_loop.stop();
    }

    #[test]
    fn test_stop_cancels_pending_tasks() {
        let mut event_loop = EventLoop::new("test-loop").unwrap();
        let (sender, receiver) = std::sync::mpsc::channel::<()>();
        event_loop.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            let _ = sender.send(());
        });
        event_loop.stop();

        // the task was dropped together with its sender
        assert!(receiver.recv_timeout(Duration::from_secs(5)).is_err());
    }
}
