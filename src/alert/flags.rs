use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};

use crate::Category;

/// Per-category "already alerted in this window" flags.
///
/// The capture worker arms flags while processing frames; the suppression timer and the
/// control thread clear them. Arming is a compare-and-swap, so a reset racing with a
/// detection either lands before it (the detection alerts) or after it (the next one does).
#[derive(Debug, Default)]
pub struct AlertFlags {
    armed: [AtomicBool; 3],
}

impl AlertFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(category: Category) -> Option<usize> {
        match category {
            Category::Weapon => Some(0),
            Category::Fire => Some(1),
            Category::Accident => Some(2),
            Category::Object => None,
        }
    }

    /// Arm the flag. Returns true only for the caller that moved it from unarmed to armed.
    pub fn try_arm(&self, category: Category) -> bool {
        match Self::slot(category) {
            Some(i) => self.armed[i]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    pub fn is_armed(&self, category: Category) -> bool {
        Self::slot(category)
            .map(|i| self.armed[i].load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn reset_all(&self) {
        for flag in &self.armed {
            flag.store(false, Ordering::Release);
        }
    }
}

enum TimerCommand {
    Restart,
    Shutdown,
}

/// Clears every alert flag once per window.
///
/// `restart` clears the flags immediately and starts a fresh window; it is what a source
/// or mode switch calls.
pub struct SuppressionTimer {
    flags: Arc<AlertFlags>,
    tx: Sender<TimerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl SuppressionTimer {
    pub fn spawn(flags: Arc<AlertFlags>, window: Duration) -> Result<Self> {
        let (tx, rx) = unbounded();
        let worker_flags = Arc::clone(&flags);
        let handle = std::thread::Builder::new()
            .name("alert-reset".to_string())
            .spawn(move || {
                let mut deadline = Instant::now() + window;
                loop {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(wait) {
                        Ok(TimerCommand::Restart) => deadline = Instant::now() + window,
                        Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            break
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            worker_flags.reset_all();
                            log::debug!("alert flags cleared");
                            deadline = Instant::now() + window;
                        }
                    }
                }
            })
            .context("failed to spawn alert reset timer")?;
        Ok(Self {
            flags,
            tx,
            handle: Some(handle),
        })
    }

    pub fn flags(&self) -> &Arc<AlertFlags> {
        &self.flags
    }

    pub fn restart(&self) {
        self.flags.reset_all();
        let _ = self.tx.send(TimerCommand::Restart);
    }
}

impl Drop for SuppressionTimer {
    fn drop(&mut self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
