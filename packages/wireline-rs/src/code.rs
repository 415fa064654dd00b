//! Wire error codes.
//!
//! Every error kind the server raises maps to exactly one integer code on
//! the wire. Peers that receive a code they do not know treat it as a
//! generic failure.

/// Wire error codes, one per server error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WireCode {
    Ok = 0,
    ExpectedParameter = 1,
    InvalidValue = 2,
    UnknownValue = 3,
    DeprecatedOrIgnoredValue = 4,
    JobNotFound = 5,
    JobAlreadyExists = 6,
    JobRunning = 7,
    ScheduleNotFound = 8,
    PersistenceIdNotFound = 9,
    PatternIdNotFound = 10,
    MountIdNotFound = 11,
    DeltaSourceIdNotFound = 12,
    MaintenanceIdNotFound = 13,
    ServerIdNotFound = 14,
    EntryNotFound = 15,
    DatabaseEntryNotFound = 16,
    DatabaseIndexNotFound = 17,
    DatabaseParseId = 18,
    DatabaseAuthorization = 19,
    InvalidPassword = 20,
    InvalidCryptPassword = 21,
    InvalidFtpPassword = 22,
    InvalidSshPassword = 23,
    InvalidWebdavPassword = 24,
    NoCryptPassword = 25,
    ParseDate = 26,
    ParseTime = 27,
    ParseWeekdays = 28,
    ParseSchedule = 29,
    ParseMaintenance = 30,
    NoTlsCertificate = 31,
    NoTlsKey = 32,
    FunctionNotSupported = 33,
    NotPaired = 34,
    NotASlave = 35,
    SlaveDisconnected = 36,
    ConnectFail = 37,
    Interrupted = 38,
    Aborted = 39,
    InsufficientMemory = 40,
    UnknownCommand = 41,
    NotAuthorized = 42,
    Failure = 255,
}

impl WireCode {
    /// The integer representation carried on the wire.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decode a wire integer. Unknown codes collapse to [`WireCode::Failure`].
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::ExpectedParameter,
            2 => Self::InvalidValue,
            3 => Self::UnknownValue,
            4 => Self::DeprecatedOrIgnoredValue,
            5 => Self::JobNotFound,
            6 => Self::JobAlreadyExists,
            7 => Self::JobRunning,
            8 => Self::ScheduleNotFound,
            9 => Self::PersistenceIdNotFound,
            10 => Self::PatternIdNotFound,
            11 => Self::MountIdNotFound,
            12 => Self::DeltaSourceIdNotFound,
            13 => Self::MaintenanceIdNotFound,
            14 => Self::ServerIdNotFound,
            15 => Self::EntryNotFound,
            16 => Self::DatabaseEntryNotFound,
            17 => Self::DatabaseIndexNotFound,
            18 => Self::DatabaseParseId,
            19 => Self::DatabaseAuthorization,
            20 => Self::InvalidPassword,
            21 => Self::InvalidCryptPassword,
            22 => Self::InvalidFtpPassword,
            23 => Self::InvalidSshPassword,
            24 => Self::InvalidWebdavPassword,
            25 => Self::NoCryptPassword,
            26 => Self::ParseDate,
            27 => Self::ParseTime,
            28 => Self::ParseWeekdays,
            29 => Self::ParseSchedule,
            30 => Self::ParseMaintenance,
            31 => Self::NoTlsCertificate,
            32 => Self::NoTlsKey,
            33 => Self::FunctionNotSupported,
            34 => Self::NotPaired,
            35 => Self::NotASlave,
            36 => Self::SlaveDisconnected,
            37 => Self::ConnectFail,
            38 => Self::Interrupted,
            39 => Self::Aborted,
            40 => Self::InsufficientMemory,
            41 => Self::UnknownCommand,
            42 => Self::NotAuthorized,
            _ => Self::Failure,
        }
    }

    /// True when this code reports success.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_known_codes() {
        for code in 0..=42u32 {
            let decoded = WireCode::from_code(code);
            assert_eq!(decoded.code(), code, "code {code} must round-trip");
        }
    }

    #[test]
    fn test_unknown_code_is_generic_failure() {
        assert_eq!(WireCode::from_code(9999), WireCode::Failure);
        assert_eq!(WireCode::from_code(200), WireCode::Failure);
    }

    #[test]
    fn test_ok() {
        assert!(WireCode::Ok.is_ok());
        assert!(!WireCode::Aborted.is_ok());
    }
}
