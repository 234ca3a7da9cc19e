//! Cooperative shutdown plumbing.
//!
//! A [`ShutdownHandle`] is a cloneable watch-channel flag. The root handle
//! is tripped by SIGINT/SIGTERM; each refresh cycle derives a child with a
//! deadline so the 60-second budget and process shutdown share one
//! cancellation path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// A cloneable cancellation flag.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Trips the flag. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// True once tripped.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when the flag trips.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// A child handle that trips when this handle trips.
    pub fn child(&self) -> ShutdownHandle {
        let child = ShutdownHandle::new();
        let parent = self.clone();
        let linked = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.wait() => linked.trigger(),
                _ = linked.wait() => {}
            }
        });
        child
    }

    /// A child handle that additionally trips after `deadline` elapses.
    pub fn child_with_deadline(&self, deadline: Duration) -> ShutdownHandle {
        let child = self.child();
        let linked = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => linked.trigger(),
                _ = linked.wait() => {}
            }
        });
        child
    }

    /// A closure view for blocking code (the panel driver polls this
    /// between bus frames).
    pub fn cancel_fn(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let handle = self.clone();
        move || handle.is_shutdown()
    }
}

/// Trips `handle` on SIGINT or SIGTERM.
#[cfg(unix)]
pub fn spawn_signal_listener(handle: ShutdownHandle) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
        handle.trigger();
    });
}

#[cfg(not(unix))]
pub fn spawn_signal_listener(handle: ShutdownHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down");
            handle.trigger();
        }
    });
}
