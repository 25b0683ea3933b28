//! Request completions
//!
//! Every request handed to the update queue carries a [`Completion`] that is
//! invoked exactly once with the request's outcome: the server's answer, or
//! the channel failure that ended the queue first.

use coherence_core::{ChannelError, CoherenceError};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Outcome delivered to a completion.
pub type Outcome = Result<(), CoherenceError>;

type Callback = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Where a request's outcome goes.
#[derive(Default)]
pub enum Completion {
    /// Nobody is waiting.
    #[default]
    Ignore,
    /// Sent to a [`PendingRequest`].
    Notify(oneshot::Sender<Outcome>),
    /// Run on the queue's response task. A panic here shuts the queue down.
    Callback(Callback),
}

/// A completion callback panicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallbackPanicked;

impl Completion {
    pub fn callback(f: impl FnOnce(Outcome) + Send + 'static) -> Self {
        Completion::Callback(Box::new(f))
    }

    /// A completion paired with the future that resolves to its outcome.
    pub fn pending() -> (Self, PendingRequest) {
        let (tx, rx) = oneshot::channel();
        (Completion::Notify(tx), PendingRequest { rx })
    }

    pub(crate) fn complete(self, outcome: Outcome) -> Result<(), CallbackPanicked> {
        match self {
            Completion::Ignore => Ok(()),
            Completion::Notify(tx) => {
                // The waiter may have given up; that is not an error.
                let _ = tx.send(outcome);
                Ok(())
            }
            Completion::Callback(f) => {
                catch_unwind(AssertUnwindSafe(move || f(outcome))).map_err(|_| CallbackPanicked)
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Ignore => write!(f, "Completion::Ignore"),
            Completion::Notify(_) => write!(f, "Completion::Notify"),
            Completion::Callback(_) => write!(f, "Completion::Callback"),
        }
    }
}

/// Future of a request's outcome.
///
/// Resolves to a shutdown failure if the completion is dropped unused.
#[derive(Debug)]
pub struct PendingRequest {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for PendingRequest {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ChannelError::ShutDown {
                    reason: "completion dropped before delivery".to_string(),
                }
                .into())
            })
        })
    }
}
