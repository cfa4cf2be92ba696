//! Operator interrupt handling.
//!
//! SIGINT and SIGTERM are caught for the whole build so the unwind path
//! (reverse unbind, unmount, report) gets to run. The signal is forwarded to
//! the child process that is currently running, if any, so a long installer
//! or mksquashfs run stops instead of being orphaned inside a bound chroot.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, warn};

use crate::error::BuildError;

/// Shared cancellation state for one build.
#[derive(Debug, Default)]
pub struct Interrupt {
    cancelled: AtomicBool,
    signal: AtomicI32,
    child: AtomicI32,
}

impl Interrupt {
    /// A handle that is never triggered by signals (tests, dry runs).
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install SIGINT/SIGTERM listeners and return the shared handle.
    ///
    /// Listeners are registered before this returns, so the default
    /// terminate-on-signal behaviour is already replaced.
    pub fn install() -> Result<Arc<Self>> {
        let interrupt = Self::new();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start signal runtime")?;

        let (mut sigint, mut sigterm) = {
            let _guard = runtime.enter();
            let sigint = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;
            let sigterm =
                signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
            (sigint, sigterm)
        };

        let handle = Arc::clone(&interrupt);
        std::thread::Builder::new()
            .name("stationiso-signals".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    loop {
                        let signo = tokio::select! {
                            Some(()) = sigint.recv() => libc::SIGINT,
                            Some(()) = sigterm.recv() => libc::SIGTERM,
                            else => break,
                        };
                        handle.trigger(signo);
                    }
                });
            })
            .context("Failed to spawn signal listener thread")?;

        Ok(interrupt)
    }

    /// Record cancellation and forward `signo` to the active child.
    pub fn trigger(&self, signo: i32) {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        self.signal.store(signo, Ordering::SeqCst);

        if first {
            warn!(signal = signo, "Interrupt received, unwinding after the current step");
        }

        let pid = self.child.load(Ordering::SeqCst);
        if pid > 0 {
            debug!(pid, signal = signo, "Forwarding signal to child");
            // SAFETY: kill(2) has no memory-safety preconditions; a stale pid
            // only yields ESRCH.
            unsafe {
                libc::kill(pid as libc::pid_t, signo);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Signal that caused cancellation, if any.
    pub fn received_signal(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            signo => Some(signo),
        }
    }

    /// Fail with `Cancelled` if an interrupt has been received.
    pub fn check(&self) -> std::result::Result<(), BuildError> {
        if self.is_cancelled() {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Register `pid` as the active child until the returned guard drops.
    pub fn register_child(&self, pid: u32) -> ChildRegistration<'_> {
        self.child.store(pid as i32, Ordering::SeqCst);
        ChildRegistration { interrupt: self }
    }

    /// Currently registered child pid.
    pub fn active_child(&self) -> Option<u32> {
        match self.child.load(Ordering::SeqCst) {
            pid if pid > 0 => Some(pid as u32),
            _ => None,
        }
    }
}

/// Clears the active child when dropped.
pub struct ChildRegistration<'a> {
    interrupt: &'a Interrupt,
}

impl Drop for ChildRegistration<'_> {
    fn drop(&mut self) {
        self.interrupt.child.store(0, Ordering::SeqCst);
    }
}
