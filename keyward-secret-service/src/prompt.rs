//! Client side of `org.freedesktop.Secret.Prompt`.
//!
//! Methods that may need user interaction return a prompt object path instead
//! of their result. The caller invokes `Prompt(window_id)` on it and then waits
//! for a single `Completed(dismissed, result)` signal. [`PromptController`]
//! tracks one waiter per outstanding prompt path and turns that signal into a
//! typed [`PromptResult`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use keyward_core::{Error, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zvariant::{OwnedObjectPath, Structure, Value};

use crate::bus::{Bus, Reply, unwrap_variant};
use crate::ss::{SS_PROMPT_INTERFACE, is_no_object};

type Decoder<T> = Box<dyn FnOnce(Value<'static>) -> Result<T> + Send>;

/// A pending prompt plus the knowledge of how to read its result.
pub struct PromptHandle<T> {
    path: OwnedObjectPath,
    decode: Decoder<T>,
}

impl<T> PromptHandle<T> {
    pub fn new(
        path: OwnedObjectPath,
        decode: impl FnOnce(Value<'static>) -> Result<T> + Send + 'static,
    ) -> Self {
        Self {
            path,
            decode: Box::new(decode),
        }
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    /// Post-process the decoded result.
    pub fn map<U>(self, f: impl FnOnce(T) -> Result<U> + Send + 'static) -> PromptHandle<U>
    where
        T: 'static,
    {
        let decode = self.decode;
        PromptHandle {
            path: self.path,
            decode: Box::new(move |value| f(decode(value)?)),
        }
    }
}

impl<T> fmt::Debug for PromptHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptHandle")
            .field("path", &self.path.as_str())
            .finish_non_exhaustive()
    }
}

/// How a prompt ended. Dismissal is an ordinary outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptResult<T> {
    Completed(T),
    Dismissed,
}

impl<T> PromptResult<T> {
    pub fn is_dismissed(&self) -> bool {
        matches!(self, Self::Dismissed)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(v) => Some(v),
            Self::Dismissed => None,
        }
    }
}

/// Result of an operation that may require a prompt.
#[derive(Debug)]
pub enum Outcome<T> {
    Ready(T),
    Prompt(PromptHandle<T>),
}

impl<T> Outcome<T> {
    pub fn is_prompt(&self) -> bool {
        matches!(self, Self::Prompt(_))
    }

    /// Wait out any prompt and return the final result.
    pub async fn resolve(
        self,
        controller: &PromptController,
        timeout: Duration,
    ) -> Result<PromptResult<T>> {
        match self {
            Self::Ready(v) => Ok(PromptResult::Completed(v)),
            Self::Prompt(handle) => controller.resolve(handle, timeout).await,
        }
    }
}

/// Build an outcome from a reply's prompt path: `/` means "no prompt needed".
pub(crate) fn outcome_from<T>(
    prompt: OwnedObjectPath,
    ready: impl FnOnce() -> Result<T>,
    decode: impl FnOnce(Value<'static>) -> Result<T> + Send + 'static,
) -> Result<Outcome<T>> {
    if is_no_object(prompt.as_str()) {
        Ok(Outcome::Ready(ready()?))
    } else {
        debug!(prompt = %prompt.as_str(), "operation requires a prompt");
        Ok(Outcome::Prompt(PromptHandle::new(prompt, decode)))
    }
}

struct Completion {
    dismissed: bool,
    result: Value<'static>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Completion>>,
}

#[derive(Default)]
struct Waiters {
    map: Mutex<HashMap<String, Waiter>>,
    next_id: AtomicU64,
}

impl Waiters {
    fn register(&self, path: &str) -> Result<(u64, oneshot::Receiver<Result<Completion>>)> {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(path) {
            return Err(Error::PromptBusy(path.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        map.insert(path.to_string(), Waiter { id, tx });
        Ok((id, rx))
    }

    /// Remove the waiter for `path` if it is still the one identified by `id`.
    fn take(&self, path: &str, id: u64) -> Option<Waiter> {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        match map.get(path) {
            Some(w) if w.id == id => map.remove(path),
            _ => None,
        }
    }

    fn deliver(&self, path: &str, id: u64, completion: Result<Completion>) {
        if let Some(waiter) = self.take(path, id) {
            // The receiver may already be gone; nothing to do then.
            let _ = waiter.tx.send(completion);
        }
    }

    fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Removes the waiter and stops its signal forwarder however `resolve` ends,
/// including when the caller drops the future.
struct WaiterGuard {
    waiters: Arc<Waiters>,
    path: String,
    id: u64,
    forwarder: Option<JoinHandle<()>>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.waiters.take(&self.path, self.id);
    }
}

/// Drives prompts to completion.
#[derive(Clone)]
pub struct PromptController {
    bus: Arc<dyn Bus>,
    waiters: Arc<Waiters>,
    window_id: String,
}

impl PromptController {
    pub fn new(bus: Arc<dyn Bus>, window_id: impl Into<String>) -> Self {
        Self {
            bus,
            waiters: Arc::new(Waiters::default()),
            window_id: window_id.into(),
        }
    }

    /// Number of prompts currently being waited on.
    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }

    /// Show the prompt and wait for its `Completed` signal.
    ///
    /// The signal subscription is in place before `Prompt()` is called, so a
    /// prompt that completes immediately is not missed. On timeout the prompt
    /// is dismissed (best effort) and [`Error::PromptTimeout`] is returned; the
    /// state of whatever the prompt was doing is then unknown.
    pub async fn resolve<T>(&self, handle: PromptHandle<T>, timeout: Duration) -> Result<PromptResult<T>> {
        let path = handle.path.as_str().to_string();
        let (id, rx) = self.waiters.register(&path)?;
        let mut guard = WaiterGuard {
            waiters: Arc::clone(&self.waiters),
            path: path.clone(),
            id,
            forwarder: None,
        };

        let mut signals = self
            .bus
            .subscribe(&path, SS_PROMPT_INTERFACE, "Completed")
            .await?;
        let waiters = Arc::clone(&self.waiters);
        let forward_path = path.clone();
        guard.forwarder = Some(tokio::spawn(async move {
            let completion = match signals.next().await {
                Some(fields) => parse_completion(fields),
                None => Err(Error::bus("prompt signal stream ended")),
            };
            waiters.deliver(&forward_path, id, completion);
        }));

        let args: Structure<'static> = (self.window_id.clone(),).into();
        self.bus
            .call(&path, SS_PROMPT_INTERFACE, "Prompt", Some(args))
            .await?;
        debug!(prompt = %path, "prompt shown, waiting for completion");

        let completion = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(completion)) => completion?,
            Ok(Err(_)) => return Err(Error::bus("prompt waiter was dropped")),
            Err(_) => {
                drop(guard);
                warn!(prompt = %path, ?timeout, "prompt timed out, dismissing");
                if let Err(e) = self.dismiss_path(&path).await {
                    warn!(prompt = %path, error = %e, "failed to dismiss timed-out prompt");
                }
                return Err(Error::PromptTimeout);
            }
        };
        drop(guard);

        if completion.dismissed {
            info!(prompt = %path, "prompt dismissed");
            return Ok(PromptResult::Dismissed);
        }
        info!(prompt = %path, "prompt completed");
        Ok(PromptResult::Completed((handle.decode)(completion.result)?))
    }

    /// Ask the service to dismiss a prompt without waiting for it.
    pub async fn dismiss<T>(&self, handle: &PromptHandle<T>) -> Result<()> {
        self.dismiss_path(handle.path.as_str()).await
    }

    async fn dismiss_path(&self, path: &str) -> Result<()> {
        self.bus
            .call(path, SS_PROMPT_INTERFACE, "Dismiss", None)
            .await?;
        Ok(())
    }
}

fn parse_completion(fields: Vec<Value<'static>>) -> Result<Completion> {
    let mut reply = Reply::new(fields);
    let dismissed = reply.next::<bool>()?;
    let result = unwrap_variant(reply.next_value()?);
    Ok(Completion { dismissed, result })
}
