//! Routing reserved jobs to handlers.
//!
//! Each subscribed tube is bound to a [`Subscription`]: a decode step plus a
//! handler. The [`Dispatcher`] looks the job's tube up, lets the subscription
//! decode the body and, when decoding fails, finishes the job according to
//! the configured [`ErrorAction`].
//!
//! Two subscription kinds exist:
//!
//! - [`TypedSubscription`]: decodes the whole body into `T` and calls a
//!   [`Handler<T>`]
//! - [`CommandRouter`]: decodes a JSON object and routes on one of its fields
//!   (see [`command`])

pub mod command;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{ConfigError, DecodeError, WorkerError};
use crate::job::{Job, JobManager};
use crate::logging::Logger;
use crate::policy::ErrorAction;

pub use command::{CommandHandler, CommandJob, CommandRouter, DEFAULT_COMMAND_FIELD};

/// Longest tube name beanstalkd accepts, in bytes.
pub const MAX_TUBE_NAME_LEN: usize = 200;

/// Handles decoded jobs of type `T`.
///
/// Implemented for any `Fn(Job, T) -> impl Future<Output = ()>`, so closures
/// and `async fn`s can be subscribed directly.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn handle(&self, job: Job, payload: T);
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(Job, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, job: Job, payload: T) {
        (self)(job, payload).await
    }
}

/// Turns a raw body into a handler payload.
pub type Decoder<T> = Arc<dyn Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync>;

/// Decoder for any `serde` type, reading the body as JSON.
pub fn json_decoder<T: DeserializeOwned + 'static>() -> Decoder<T> {
    Arc::new(|body: &[u8]| serde_json::from_slice(body).map_err(DecodeError::from))
}

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler received the job.
    Handled,
    /// The body did not decode; the error action was applied.
    DecodeFailed,
    /// The body decoded but named no registered command; the job was deleted.
    UnknownCommand,
}

/// Decode-and-invoke step bound to one tube.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn invoke(&self, job: Job, on_decode_error: ErrorAction) -> DispatchOutcome;
}

/// Logs a decode failure with the raw body and finishes the job per `action`.
pub(crate) async fn reject_undecodable<M: JobManager + ?Sized>(
    job: &M,
    body: &str,
    err: &DecodeError,
    action: ErrorAction,
) {
    let verb = match action {
        ErrorAction::Delete => "deleting",
        ErrorAction::Release => "releasing",
        ErrorAction::Bury => "burying",
    };
    job.log_error(format_args!(
        "Error decoding payload: {err}, '{body}', {verb}..."
    ));
    action.apply(job).await;
}

/// Whole-body decode into `T`.
pub struct TypedSubscription<T> {
    decoder: Decoder<T>,
    handler: Arc<dyn Handler<T>>,
}

impl<T: Send + 'static> TypedSubscription<T> {
    /// Binds `handler` to payloads produced by `decoder`.
    pub fn new(decoder: Decoder<T>, handler: impl Handler<T>) -> Self {
        Self {
            decoder,
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Subscription for TypedSubscription<T> {
    async fn invoke(&self, job: Job, on_decode_error: ErrorAction) -> DispatchOutcome {
        let decoded = (self.decoder)(job.body());
        match decoded {
            Ok(payload) => {
                self.handler.handle(job, payload).await;
                DispatchOutcome::Handled
            }
            Err(err) => {
                let body = job.body_text();
                reject_undecodable(&job, &body, &err, on_decode_error).await;
                DispatchOutcome::DecodeFailed
            }
        }
    }
}

/// Checks a tube name against beanstalkd's naming rules.
pub fn validate_tube_name(name: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTubeName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_TUBE_NAME_LEN {
        return Err(invalid("name is longer than 200 bytes"));
    }
    if name.starts_with('-') {
        return Err(invalid("name starts with '-'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || "-+/;.$_()".contains(*c)))
    {
        return Err(invalid(&format!("character {c:?} is not allowed")));
    }
    Ok(())
}

/// Tube name → subscription. Built before a run, read-only during it.
#[derive(Clone, Default)]
pub struct Subscriptions {
    by_tube: HashMap<String, Arc<dyn Subscription>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subscription` for `tube`. Invalid names and a second
    /// subscription on the same tube are rejected.
    pub fn insert(
        &mut self,
        tube: impl Into<String>,
        subscription: Arc<dyn Subscription>,
    ) -> Result<(), ConfigError> {
        let tube = tube.into();
        validate_tube_name(&tube)?;
        if self.by_tube.contains_key(&tube) {
            return Err(ConfigError::DuplicateSubscription(tube));
        }
        self.by_tube.insert(tube, subscription);
        Ok(())
    }

    /// Subscription bound to `tube`.
    pub fn get(&self, tube: &str) -> Option<&Arc<dyn Subscription>> {
        self.by_tube.get(tube)
    }

    /// Subscribed tube names, sorted.
    pub fn tubes(&self) -> Vec<String> {
        let mut tubes: Vec<String> = self.by_tube.keys().cloned().collect();
        tubes.sort();
        tubes
    }

    pub fn len(&self) -> usize {
        self.by_tube.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tube.is_empty()
    }
}

/// Routes jobs to the subscription registered for their tube.
#[derive(Clone)]
pub struct Dispatcher {
    subscriptions: Arc<Subscriptions>,
    error_action: ErrorAction,
    logger: Arc<dyn Logger>,
}

impl Dispatcher {
    /// Creates a dispatcher over a read-only subscription table.
    pub fn new(
        subscriptions: Arc<Subscriptions>,
        error_action: ErrorAction,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            subscriptions,
            error_action,
            logger,
        }
    }

    /// Action applied to undecodable payloads.
    pub fn error_action(&self) -> ErrorAction {
        self.error_action
    }

    /// Hands `job` to its tube's subscription and waits for the handler.
    ///
    /// A job from a tube nobody subscribed to means the watch list and the
    /// subscription table disagree. The job is released so it is not lost,
    /// and the error is returned so the run stops.
    pub async fn dispatch(&self, job: Job) -> Result<DispatchOutcome, WorkerError> {
        let Some(subscription) = self.subscriptions.get(job.tube()) else {
            let err = WorkerError::UnhandledTube {
                tube: job.tube().to_string(),
                job_id: job.id(),
            };
            self.logger.error(format_args!("{err}, releasing and stopping"));
            job.release().await;
            return Err(err);
        };

        Ok(subscription.invoke(job, self.error_action).await)
    }
}
