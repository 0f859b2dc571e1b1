// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cooperative cancellation.
//!
//! A [`CancelSource`] owns the trigger; every [`CancelToken`] cloned from it
//! observes the signal.  Middleware forwards the token to the inner agent
//! and to any sub-task it spawns, and checks it on every pull.

use tokio::sync::watch;

use crate::error::{PipelineError, Result};

/// The owning side of a cancellation signal.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> (CancelSource, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelSource { tx }, CancelToken { rx: Some(rx) })
    }

    /// Fire the signal.  Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer handle for a cancellation signal.  Cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    /// `None` means "never cancelled" — the token handed out when the caller
    /// did not supply one.
    rx: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that never fires.
    pub fn none() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Fail fast: `Err(Cancelled)` when the signal has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when the signal fires.  Never resolves for [`Self::none`].
    pub async fn cancelled(&self) {
        match &self.rx {
            None => std::future::pending::<()>().await,
            Some(rx) => {
                let mut rx = rx.clone();
                // Closed sender without a cancel means the source was dropped
                // with no intent to cancel; treat as never-firing.
                if rx.wait_for(|v| *v).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::none()
    }
}
