//! Actions
//!
//! An action wraps a unit of work against an instance. Whether the body is
//! synchronous or asynchronous is fixed when the action is created.
//!
//! A synchronous body runs inside a batch, so every write it makes reaches
//! subscribers in one notify pass. An error returned by the body is handed
//! to the registered catch handlers in order; without handlers it surfaces
//! to the caller.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::error::{PulseError, Result};
use crate::instance::{Inner, Pulse};

/// Handler receiving the error of a failed action run.
pub type CatchHandler = Arc<dyn Fn(&PulseError) + Send + Sync>;

type SyncBody = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;
type AsyncBody = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
enum Body {
    Sync(SyncBody),
    Async(AsyncBody),
}

/// A registered unit of work.
#[derive(Clone)]
pub struct Action {
    pulse: Weak<Inner>,
    body: Body,
    handlers: Vec<CatchHandler>,
}

impl Action {
    /// An action whose body runs to completion on the calling thread.
    pub fn sync<F>(pulse: &Pulse, body: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            pulse: pulse.downgrade(),
            body: Body::Sync(Arc::new(body)),
            handlers: Vec::new(),
        }
    }

    /// An action whose body returns a future. Run it with
    /// [`run_async`](Self::run_async).
    pub fn asynchronous<F, Fut>(pulse: &Pulse, body: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            pulse: pulse.downgrade(),
            body: Body::Async(Arc::new(move |args| body(args).boxed())),
            handlers: Vec::new(),
        }
    }

    /// Append a catch handler.
    pub fn on_catch<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PulseError) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn is_async(&self) -> bool {
        matches!(self.body, Body::Async(_))
    }

    /// Run a synchronous action.
    ///
    /// Returns `Ok(None)` when the body failed and a catch handler took the
    /// error.
    pub fn run(&self, args: Value) -> Result<Option<Value>> {
        let pulse = Pulse::from_weak(&self.pulse).ok_or(PulseError::InstanceDropped)?;
        let body = match &self.body {
            Body::Sync(body) => body,
            Body::Async(_) => {
                return Err(PulseError::action(
                    "asynchronous action must be run with run_async",
                ))
            }
        };
        let outcome = pulse.batch(|| body(args));
        self.settle(outcome)
    }

    /// Run either kind of action. Writes made by an asynchronous body are
    /// not batched across await points.
    pub async fn run_async(&self, args: Value) -> Result<Option<Value>> {
        match &self.body {
            Body::Sync(_) => self.run(args),
            Body::Async(body) => {
                if Pulse::from_weak(&self.pulse).is_none() {
                    return Err(PulseError::InstanceDropped);
                }
                let outcome = body(args).await;
                self.settle(outcome)
            }
        }
    }

    fn settle(&self, outcome: Result<Value>) -> Result<Option<Value>> {
        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.handlers.is_empty() => Err(err),
            Err(err) => {
                debug!(handlers = self.handlers.len(), error = %err, "action failed");
                for handler in &self.handlers {
                    handler(&err);
                }
                Ok(None)
            }
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("async", &self.is_async())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
