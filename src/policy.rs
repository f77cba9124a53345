//! What happens to a job whose payload cannot be decoded.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::job::JobManager;
use crate::logging::Logger;

/// Disposition of a job whose payload failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorAction {
    Delete,
    #[default]
    Release,
    Bury,
}

impl ErrorAction {
    /// Finishes `job` according to the action. Release and bury use the job's
    /// current return state.
    pub async fn apply<M: JobManager + ?Sized>(self, job: &M) {
        match self {
            ErrorAction::Delete => job.delete().await,
            ErrorAction::Release => job.release().await,
            ErrorAction::Bury => job.bury().await,
        }
    }

    /// Parses `name`, falling back to [`ErrorAction::Release`] for anything
    /// unrecognised. The fallback is logged.
    pub fn from_name_lossy(name: &str, logger: &dyn Logger) -> Self {
        name.parse().unwrap_or_else(|err: ConfigError| {
            logger.error(format_args!("{err}, using release"));
            ErrorAction::Release
        })
    }

    /// Lowercase name, as accepted by `FromStr`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorAction::Delete => "delete",
            ErrorAction::Release => "release",
            ErrorAction::Bury => "bury",
        }
    }
}

impl FromStr for ErrorAction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(ErrorAction::Delete),
            "release" => Ok(ErrorAction::Release),
            "bury" => Ok(ErrorAction::Bury),
            _ => Err(ConfigError::UnknownErrorAction(s.to_string())),
        }
    }
}

impl fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
