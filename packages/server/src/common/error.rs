//! Server error kinds.
//!
//! Every kind maps one-to-one to a wire code so clients can match on the
//! integer. Handlers return these; background services log them and retry.

use wireline::{ValueError, WireCode};

/// Errors raised by the server core.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("expected parameter '{0}'")]
    ExpectedParameter(String),

    #[error("invalid value '{value}' for '{name}'")]
    InvalidValue { name: String, value: String },

    #[error("unknown value '{0}'")]
    UnknownValue(String),

    #[error("'{0}' is deprecated and ignored")]
    DeprecatedOrIgnoredValue(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("job is running: {0}")]
    JobRunning(String),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("persistence entry not found: {0}")]
    PersistenceIdNotFound(u32),

    #[error("pattern entry not found: {0}")]
    PatternIdNotFound(u32),

    #[error("mount entry not found: {0}")]
    MountIdNotFound(u32),

    #[error("delta source entry not found: {0}")]
    DeltaSourceIdNotFound(u32),

    #[error("maintenance entry not found: {0}")]
    MaintenanceIdNotFound(u32),

    #[error("server entry not found: {0}")]
    ServerIdNotFound(u32),

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("index entry not found: {0}")]
    DatabaseEntryNotFound(String),

    #[error("no index configured")]
    DatabaseIndexNotFound,

    #[error("malformed id '{0}'")]
    DatabaseParseId(String),

    #[error("index authorization failed")]
    DatabaseAuthorization,

    #[error("invalid password")]
    InvalidPassword,

    #[error("invalid crypt password")]
    InvalidCryptPassword,

    #[error("invalid FTP password")]
    InvalidFtpPassword,

    #[error("invalid SSH password")]
    InvalidSshPassword,

    #[error("invalid WebDAV password")]
    InvalidWebdavPassword,

    #[error("no crypt password given")]
    NoCryptPassword,

    #[error("cannot parse date '{0}'")]
    ParseDate(String),

    #[error("cannot parse time '{0}'")]
    ParseTime(String),

    #[error("cannot parse week days '{0}'")]
    ParseWeekdays(String),

    #[error("cannot parse schedule '{0}'")]
    ParseSchedule(String),

    #[error("cannot parse maintenance '{0}'")]
    ParseMaintenance(String),

    #[error("no TLS certificate configured")]
    NoTlsCertificate,

    #[error("no TLS key configured")]
    NoTlsKey,

    #[error("function not supported")]
    FunctionNotSupported,

    #[error("not paired with master")]
    NotPaired,

    #[error("server is not in slave mode")]
    NotASlave,

    #[error("slave disconnected: {0}")]
    SlaveDisconnected(String),

    #[error("connect failed: {0}")]
    ConnectFail(String),

    #[error("interrupted")]
    Interrupted,

    #[error("aborted")]
    Aborted,

    #[error("insufficient memory")]
    InsufficientMemory,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("not authorized")]
    NotAuthorized,

    #[error("{0}")]
    Failure(String),
}

impl ServerError {
    /// The wire code for this kind.
    pub fn wire_code(&self) -> WireCode {
        match self {
            Self::ExpectedParameter(_) => WireCode::ExpectedParameter,
            Self::InvalidValue { .. } => WireCode::InvalidValue,
            Self::UnknownValue(_) => WireCode::UnknownValue,
            Self::DeprecatedOrIgnoredValue(_) => WireCode::DeprecatedOrIgnoredValue,
            Self::JobNotFound(_) => WireCode::JobNotFound,
            Self::JobAlreadyExists(_) => WireCode::JobAlreadyExists,
            Self::JobRunning(_) => WireCode::JobRunning,
            Self::ScheduleNotFound(_) => WireCode::ScheduleNotFound,
            Self::PersistenceIdNotFound(_) => WireCode::PersistenceIdNotFound,
            Self::PatternIdNotFound(_) => WireCode::PatternIdNotFound,
            Self::MountIdNotFound(_) => WireCode::MountIdNotFound,
            Self::DeltaSourceIdNotFound(_) => WireCode::DeltaSourceIdNotFound,
            Self::MaintenanceIdNotFound(_) => WireCode::MaintenanceIdNotFound,
            Self::ServerIdNotFound(_) => WireCode::ServerIdNotFound,
            Self::EntryNotFound(_) => WireCode::EntryNotFound,
            Self::DatabaseEntryNotFound(_) => WireCode::DatabaseEntryNotFound,
            Self::DatabaseIndexNotFound => WireCode::DatabaseIndexNotFound,
            Self::DatabaseParseId(_) => WireCode::DatabaseParseId,
            Self::DatabaseAuthorization => WireCode::DatabaseAuthorization,
            Self::InvalidPassword => WireCode::InvalidPassword,
            Self::InvalidCryptPassword => WireCode::InvalidCryptPassword,
            Self::InvalidFtpPassword => WireCode::InvalidFtpPassword,
            Self::InvalidSshPassword => WireCode::InvalidSshPassword,
            Self::InvalidWebdavPassword => WireCode::InvalidWebdavPassword,
            Self::NoCryptPassword => WireCode::NoCryptPassword,
            Self::ParseDate(_) => WireCode::ParseDate,
            Self::ParseTime(_) => WireCode::ParseTime,
            Self::ParseWeekdays(_) => WireCode::ParseWeekdays,
            Self::ParseSchedule(_) => WireCode::ParseSchedule,
            Self::ParseMaintenance(_) => WireCode::ParseMaintenance,
            Self::NoTlsCertificate => WireCode::NoTlsCertificate,
            Self::NoTlsKey => WireCode::NoTlsKey,
            Self::FunctionNotSupported => WireCode::FunctionNotSupported,
            Self::NotPaired => WireCode::NotPaired,
            Self::NotASlave => WireCode::NotASlave,
            Self::SlaveDisconnected(_) => WireCode::SlaveDisconnected,
            Self::ConnectFail(_) => WireCode::ConnectFail,
            Self::Interrupted => WireCode::Interrupted,
            Self::Aborted => WireCode::Aborted,
            Self::InsufficientMemory => WireCode::InsufficientMemory,
            Self::UnknownCommand(_) => WireCode::UnknownCommand,
            Self::NotAuthorized => WireCode::NotAuthorized,
            Self::Failure(_) => WireCode::Failure,
        }
    }

    /// Transient errors that background loops retry after a short back-off
    /// instead of the normal loop period.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectFail(_) | Self::Interrupted)
    }

    /// Reconstruct an error from a received wire code and message, used when
    /// proxying results from a slave.
    pub fn from_wire(code: WireCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            WireCode::Ok => Self::Failure("unexpected success code".to_string()),
            WireCode::ExpectedParameter => Self::ExpectedParameter(message),
            WireCode::InvalidValue => Self::InvalidValue {
                name: message,
                value: String::new(),
            },
            WireCode::UnknownValue => Self::UnknownValue(message),
            WireCode::DeprecatedOrIgnoredValue => Self::DeprecatedOrIgnoredValue(message),
            WireCode::JobNotFound => Self::JobNotFound(message),
            WireCode::JobAlreadyExists => Self::JobAlreadyExists(message),
            WireCode::JobRunning => Self::JobRunning(message),
            WireCode::ScheduleNotFound => Self::ScheduleNotFound(message),
            WireCode::PersistenceIdNotFound => Self::PersistenceIdNotFound(0),
            WireCode::PatternIdNotFound => Self::PatternIdNotFound(0),
            WireCode::MountIdNotFound => Self::MountIdNotFound(0),
            WireCode::DeltaSourceIdNotFound => Self::DeltaSourceIdNotFound(0),
            WireCode::MaintenanceIdNotFound => Self::MaintenanceIdNotFound(0),
            WireCode::ServerIdNotFound => Self::ServerIdNotFound(0),
            WireCode::EntryNotFound => Self::EntryNotFound(message),
            WireCode::DatabaseEntryNotFound => Self::DatabaseEntryNotFound(message),
            WireCode::DatabaseIndexNotFound => Self::DatabaseIndexNotFound,
            WireCode::DatabaseParseId => Self::DatabaseParseId(message),
            WireCode::DatabaseAuthorization => Self::DatabaseAuthorization,
            WireCode::InvalidPassword => Self::InvalidPassword,
            WireCode::InvalidCryptPassword => Self::InvalidCryptPassword,
            WireCode::InvalidFtpPassword => Self::InvalidFtpPassword,
            WireCode::InvalidSshPassword => Self::InvalidSshPassword,
            WireCode::InvalidWebdavPassword => Self::InvalidWebdavPassword,
            WireCode::NoCryptPassword => Self::NoCryptPassword,
            WireCode::ParseDate => Self::ParseDate(message),
            WireCode::ParseTime => Self::ParseTime(message),
            WireCode::ParseWeekdays => Self::ParseWeekdays(message),
            WireCode::ParseSchedule => Self::ParseSchedule(message),
            WireCode::ParseMaintenance => Self::ParseMaintenance(message),
            WireCode::NoTlsCertificate => Self::NoTlsCertificate,
            WireCode::NoTlsKey => Self::NoTlsKey,
            WireCode::FunctionNotSupported => Self::FunctionNotSupported,
            WireCode::NotPaired => Self::NotPaired,
            WireCode::NotASlave => Self::NotASlave,
            WireCode::SlaveDisconnected => Self::SlaveDisconnected(message),
            WireCode::ConnectFail => Self::ConnectFail(message),
            WireCode::Interrupted => Self::Interrupted,
            WireCode::Aborted => Self::Aborted,
            WireCode::InsufficientMemory => Self::InsufficientMemory,
            WireCode::UnknownCommand => Self::UnknownCommand(message),
            WireCode::NotAuthorized => Self::NotAuthorized,
            WireCode::Failure => Self::Failure(message),
        }
    }
}

impl From<ValueError> for ServerError {
    fn from(err: ValueError) -> Self {
        match err {
            ValueError::Missing(key) => Self::ExpectedParameter(key),
            ValueError::Invalid { key, value } => Self::InvalidValue { name: key, value },
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Failure(err.to_string())
    }
}

/// Shorthand used by command handlers and kernel services.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_distinct_code() {
        let kinds: Vec<ServerError> = vec![
            ServerError::ExpectedParameter("x".into()),
            ServerError::InvalidValue {
                name: "x".into(),
                value: "y".into(),
            },
            ServerError::UnknownValue("x".into()),
            ServerError::DeprecatedOrIgnoredValue("x".into()),
            ServerError::JobNotFound("x".into()),
            ServerError::JobAlreadyExists("x".into()),
            ServerError::JobRunning("x".into()),
            ServerError::ScheduleNotFound("x".into()),
            ServerError::PersistenceIdNotFound(1),
            ServerError::PatternIdNotFound(1),
            ServerError::MountIdNotFound(1),
            ServerError::DeltaSourceIdNotFound(1),
            ServerError::MaintenanceIdNotFound(1),
            ServerError::ServerIdNotFound(1),
            ServerError::EntryNotFound("x".into()),
            ServerError::DatabaseEntryNotFound("x".into()),
            ServerError::DatabaseIndexNotFound,
            ServerError::DatabaseParseId("x".into()),
            ServerError::DatabaseAuthorization,
            ServerError::InvalidPassword,
            ServerError::InvalidCryptPassword,
            ServerError::InvalidFtpPassword,
            ServerError::InvalidSshPassword,
            ServerError::InvalidWebdavPassword,
            ServerError::NoCryptPassword,
            ServerError::ParseDate("x".into()),
            ServerError::ParseTime("x".into()),
            ServerError::ParseWeekdays("x".into()),
            ServerError::ParseSchedule("x".into()),
            ServerError::ParseMaintenance("x".into()),
            ServerError::NoTlsCertificate,
            ServerError::NoTlsKey,
            ServerError::FunctionNotSupported,
            ServerError::NotPaired,
            ServerError::NotASlave,
            ServerError::SlaveDisconnected("x".into()),
            ServerError::ConnectFail("x".into()),
            ServerError::Interrupted,
            ServerError::Aborted,
            ServerError::InsufficientMemory,
            ServerError::UnknownCommand("x".into()),
            ServerError::NotAuthorized,
            ServerError::Failure("x".into()),
        ];

        let mut seen = std::collections::HashSet::new();
        for kind in &kinds {
            assert!(
                seen.insert(kind.wire_code()),
                "duplicate wire code for {kind:?}"
            );
        }
    }

    #[test]
    fn test_value_error_conversion() {
        let err: ServerError = ValueError::Missing("jobUUID".into()).into();
        assert_eq!(err.wire_code(), WireCode::ExpectedParameter);
    }
}
