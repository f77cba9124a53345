//! Command routing for JSON object payloads.
//!
//! A tube carrying mixed job kinds can tag each payload with a command field
//! (`{"cmd": "resize", "path": "..."}`). [`CommandRouter`] decodes the object,
//! reads the field and calls the handler subscribed to that command.
//! Payloads naming an unknown command are deleted, since retrying them cannot
//! succeed.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{reject_undecodable, DispatchOutcome, Subscription};
use crate::error::{ConfigError, DecodeError};
use crate::job::{Job, JobManager};
use crate::policy::ErrorAction;

/// Field read when no other is configured.
pub const DEFAULT_COMMAND_FIELD: &str = "cmd";

/// Handles jobs for one command.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, job: CommandJob);
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(CommandJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, job: CommandJob) {
        (self)(job).await
    }
}

/// A job whose payload decoded to a JSON object.
///
/// Lifecycle calls go to the underlying [`Job`]; log lines gain a
/// `Type: <command>` prefix.
#[derive(Debug)]
pub struct CommandJob {
    job: Job,
    fields: Map<String, Value>,
    command: String,
}

impl CommandJob {
    /// The command this job was routed on.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Field value as text. Strings are returned unquoted, other JSON values
    /// in their JSON form. `null` and absent fields give `None`.
    pub fn field(&self, name: &str) -> Option<String> {
        field_text(&self.fields, name)
    }

    /// Like [`field`](Self::field), with an empty string for absent fields.
    pub fn get_field(&self, name: &str) -> String {
        self.field(name).unwrap_or_default()
    }

    /// All fields of the decoded payload.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The underlying job.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Consumes the command, returning the underlying job.
    pub fn into_job(self) -> Job {
        self.job
    }
}

fn field_text(fields: &Map<String, Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl JobManager for CommandJob {
    async fn delete(&self) {
        self.job.delete().await
    }

    async fn release(&self) {
        self.job.release().await
    }

    async fn bury(&self) {
        self.job.bury().await
    }

    async fn touch(&self) {
        self.job.touch().await
    }

    fn set_return_priority(&mut self, priority: u32) {
        self.job.set_return_priority(priority)
    }

    fn set_return_delay(&mut self, delay: Duration) {
        self.job.set_return_delay(delay)
    }

    fn id(&self) -> u64 {
        self.job.id()
    }

    fn tube(&self) -> &str {
        self.job.tube()
    }

    fn age(&self) -> Duration {
        self.job.age()
    }

    fn priority(&self) -> u32 {
        self.job.priority()
    }

    fn delay(&self) -> Duration {
        self.job.delay()
    }

    fn releases(&self) -> u32 {
        self.job.releases()
    }

    fn reserves(&self) -> u32 {
        self.job.reserves()
    }

    fn timeouts(&self) -> u32 {
        self.job.timeouts()
    }

    fn log_info(&self, args: fmt::Arguments<'_>) {
        self.job
            .log_info(format_args!("Type: {}: {}", self.command, args))
    }

    fn log_error(&self, args: fmt::Arguments<'_>) {
        self.job
            .log_error(format_args!("Type: {}: {}", self.command, args))
    }
}

/// Routes JSON object payloads on a command field.
pub struct CommandRouter {
    field: String,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
    /// Router reading the `cmd` field.
    pub fn new() -> Self {
        Self::with_field(DEFAULT_COMMAND_FIELD)
    }

    /// Creates a router that reads the command name from `field`.
    pub fn with_field(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `command`. Each command takes one handler.
    pub fn subscribe(
        &mut self,
        command: impl Into<String>,
        handler: impl CommandHandler,
    ) -> Result<&mut Self, ConfigError> {
        let command = command.into();
        if self.handlers.contains_key(&command) {
            return Err(ConfigError::DuplicateCommand(command));
        }
        self.handlers.insert(command, Arc::new(handler));
        Ok(self)
    }

    /// Payload field holding the command name.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Registered commands, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.handlers.keys().cloned().collect();
        commands.sort();
        commands
    }

    fn decode(body: &[u8]) -> Result<Map<String, Value>, DecodeError> {
        match serde_json::from_slice(body)? {
            Value::Object(fields) => Ok(fields),
            other => Err(DecodeError::Invalid(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl Subscription for CommandRouter {
    async fn invoke(&self, job: Job, on_decode_error: ErrorAction) -> DispatchOutcome {
        let decoded = Self::decode(job.body());
        let fields = match decoded {
            Ok(fields) => fields,
            Err(err) => {
                let body = job.body_text();
                reject_undecodable(&job, &body, &err, on_decode_error).await;
                return DispatchOutcome::DecodeFailed;
            }
        };

        let command = field_text(&fields, &self.field).unwrap_or_default();
        let handler = self.handlers.get(&command).cloned();
        let job = CommandJob {
            job,
            fields,
            command,
        };

        match handler {
            Some(handler) => {
                handler.handle(job).await;
                DispatchOutcome::Handled
            }
            None => {
                job.log_error(format_args!("Unrecognised command, deleting..."));
                job.delete().await;
                DispatchOutcome::UnknownCommand
            }
        }
    }
}
