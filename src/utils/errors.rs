#![forbid(unsafe_code)]

use thiserror::Error;

/// Error enumerates the errors returned by this application.
#[derive(Error, Debug)]
pub enum Errors {
    /// Input parameter logging.
    #[error("iwa_server input parameters:\n{}", .0)]
    InputParms(String),

    /// Inaccessible logger configuration file.
    #[error("Unable to access the Log4rs configuration file: {}", .0)]
    Log4rsInitialization(String),

    #[error("Reading application configuration file: {}", .0)]
    ReadingConfigFile(String),

    #[error("Unable to parse TOML file: {}", .0)]
    TOMLParseError(String),

    #[error("Invalid IWA data directory: {}", .0)]
    DirectoryCheck(String),

    #[error("No connection string configured for key: {}", .0)]
    MissingConnectionString(String),
}

/// QueryError separates the failure modes of a fixed-query request.  An empty
/// result set is not an error, see `QueryOutcome::Empty`.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The database could not be reached or refused the login.
    #[error("unable to connect using '{key}': {source}")]
    Connect {
        key: String,
        #[source]
        source: sqlx::Error,
    },

    /// The statement was rejected or failed while executing.
    #[error("query failed using '{key}': {source}")]
    Execute {
        key: String,
        #[source]
        source: sqlx::Error,
    },

    /// A row came back but its columns could not be read.
    #[error("unable to read row using '{key}': {source}")]
    Read {
        key: String,
        #[source]
        source: sqlx::Error,
    },
}

impl QueryError {
    /// True when the failure happened before any statement was sent.
    pub fn is_connect(&self) -> bool {
        matches!(self, QueryError::Connect { .. })
    }
}
