//! Demo handler for the `import-jobs` tube.
//!
//! Payloads are flat JSON objects of strings. A job without a non-empty
//! `type` field cannot be processed without manual intervention, so it is
//! logged and deleted rather than retried.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::job::{Job, JobManager};

/// Tube the demo subscribes to by default.
pub const DEFAULT_IMPORT_TUBE: &str = "import-jobs";

/// Fields every import job must carry.
const REQUIRED_FIELDS: &[&str] = &["type"];

/// Import job payload.
pub type ImportJobData = BTreeMap<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImportJobError {
    #[error("Field {0} not found in job data")]
    MissingField(&'static str),

    #[error("Field {0} should not be empty")]
    EmptyField(&'static str),
}

/// Handler context: the job's lifecycle methods plus its decoded data.
pub struct ImportJobHandler<M = Job> {
    job: M,
    data: ImportJobData,
}

impl<M: JobManager> ImportJobHandler<M> {
    pub fn new(job: M, data: ImportJobData) -> Self {
        Self { job, data }
    }

    /// Processes the job and finishes it.
    pub async fn run(self) {
        if let Err(err) = self.validate() {
            match serde_json::to_string(&self.data) {
                Ok(raw) => self.job.log_error(format_args!(
                    "Job data is invalid: {err}, deleting job: {raw}"
                )),
                Err(json_err) => self.job.log_error(format_args!(
                    "Job data is invalid: {err}, deleting job (could not re-encode data: {json_err})"
                )),
            }
            self.job.delete().await;
            return;
        }

        let kind = self.data.get("type").map(String::as_str).unwrap_or_default();
        self.job
            .log_info(format_args!("Got an import job of type {kind}"));
        self.job.delete().await;
    }

    fn validate(&self) -> Result<(), ImportJobError> {
        for &field in REQUIRED_FIELDS {
            match self.data.get(field) {
                None => return Err(ImportJobError::MissingField(field)),
                Some(value) if value.is_empty() => return Err(ImportJobError::EmptyField(field)),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Entry point subscribed on the import tube.
pub async fn handle_import_job(job: Job, data: ImportJobData) {
    ImportJobHandler::new(job, data).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerCall, InMemoryBroker};
    use crate::job::{JobStats, DEFAULT_RELEASE_DELAY_FALLBACK};
    use crate::logging::RecordingLogger;
    use std::sync::Arc;
    use std::time::Duration;

    async fn reserve(broker: &InMemoryBroker, logger: Arc<RecordingLogger>) -> Job {
        let conn = broker.dial().await.expect("dial");
        conn.watch(&[DEFAULT_IMPORT_TUBE.to_string()])
            .await
            .expect("watch");
        let reserved = conn.reserve(Duration::from_secs(1)).await.expect("reserve");
        let stats = JobStats::from_map(&conn.stats_job(reserved.id).await.expect("stats"))
            .expect("parse");
        Job::new(
            reserved.id,
            reserved.body,
            stats,
            conn,
            logger,
            DEFAULT_RELEASE_DELAY_FALLBACK,
        )
    }

    fn data(pairs: &[(&str, &str)]) -> ImportJobData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_import_job_error_messages() {
        assert_eq!(
            ImportJobError::MissingField("type").to_string(),
            "Field type not found in job data"
        );
        assert_eq!(
            ImportJobError::EmptyField("type").to_string(),
            "Field type should not be empty"
        );
    }

    #[tokio::test]
    async fn test_valid_import_job_is_deleted_after_processing() {
        let broker = InMemoryBroker::new();
        let id = broker.put(DEFAULT_IMPORT_TUBE, 1, Duration::ZERO, "{}");
        let logger = Arc::new(RecordingLogger::new());

        let job = reserve(&broker, logger.clone()).await;
        handle_import_job(job, data(&[("type", "csv")])).await;

        assert_eq!(broker.calls(), vec![BrokerCall::Delete { id }]);
        assert_eq!(
            logger.infos(),
            vec![format!(
                "Tube: import-jobs, Job: {id}: Got an import job of type csv"
            )]
        );
        assert!(logger.errors().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_import_jobs_are_deleted_with_error() {
        for (payload, reason) in [
            (data(&[("source", "s3")]), "Field type not found"),
            (data(&[("type", "")]), "Field type should not be empty"),
        ] {
            let broker = InMemoryBroker::new();
            let id = broker.put(DEFAULT_IMPORT_TUBE, 1, Duration::ZERO, "{}");
            let logger = Arc::new(RecordingLogger::new());

            let job = reserve(&broker, logger.clone()).await;
            handle_import_job(job, payload).await;

            assert_eq!(broker.calls(), vec![BrokerCall::Delete { id }]);
            assert!(logger.has_error_containing(reason));
            assert!(logger.has_error_containing("deleting job: {"));
            assert!(logger.infos().is_empty());
        }
    }
}
