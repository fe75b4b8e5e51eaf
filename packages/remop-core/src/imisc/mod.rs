//! IMISC: a module of miscellaneous network services (time, users, quotes,
//! character generation, finger, echo, ...) expressed as remote operations.
//!
//! Each operation is a zero-sized marker implementing [`RemoteOperation`];
//! [`table()`] returns the module's operation table.

pub mod types;

use std::sync::OnceLock;

use crate::codec::CodecError;
use crate::operation::{RemoteError, RemoteOperation};
use crate::table::{ErrorDescriptor, OperationTable};
use crate::types::{ErrorCode, OperationCode};

pub use types::{Data, Empty, GenResult, Ia5List, NotIa5, TimeResult, UtcResult};

/// Module name used in tables and logs.
pub const MODULE: &str = "IMISC";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// IMISC error codes.
pub mod errors {
    use crate::types::ErrorCode;

    pub const CONGESTED: ErrorCode = ErrorCode(0);
    pub const UNABLE_TO_DETERMINE_TIME: ErrorCode = ErrorCode(1);
    pub const UNABLE_TO_OPEN_FILE: ErrorCode = ErrorCode(2);
    pub const UNABLE_TO_ACCESS_FILE: ErrorCode = ErrorCode(3);
    pub const USER_NOT_LOGGED_IN: ErrorCode = ErrorCode(4);
}

use errors::{
    CONGESTED, UNABLE_TO_ACCESS_FILE, UNABLE_TO_DETERMINE_TIME, UNABLE_TO_OPEN_FILE,
    USER_NOT_LOGGED_IN,
};

/// Typed view of the IMISC errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImiscError {
    #[error("congested")]
    Congested,
    #[error("unable to determine time")]
    UnableToDetermineTime,
    #[error("unable to open file: {0}")]
    UnableToOpenFile(Ia5List),
    #[error("unable to access file: {0}")]
    UnableToAccessFile(Ia5List),
    #[error("user not logged in: {0}")]
    UserNotLoggedIn(Ia5List),
}

impl ImiscError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ImiscError::Congested => CONGESTED,
            ImiscError::UnableToDetermineTime => UNABLE_TO_DETERMINE_TIME,
            ImiscError::UnableToOpenFile(_) => UNABLE_TO_OPEN_FILE,
            ImiscError::UnableToAccessFile(_) => UNABLE_TO_ACCESS_FILE,
            ImiscError::UserNotLoggedIn(_) => USER_NOT_LOGGED_IN,
        }
    }

    /// Encodes the error for transmission.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the parameter cannot be encoded.
    pub fn into_remote(self) -> Result<RemoteError, CodecError> {
        let code = self.code();
        match self {
            ImiscError::Congested | ImiscError::UnableToDetermineTime => Ok(RemoteError::new(code)),
            ImiscError::UnableToOpenFile(p)
            | ImiscError::UnableToAccessFile(p)
            | ImiscError::UserNotLoggedIn(p) => RemoteError::with_parameter(code, &p),
        }
    }

    /// Decodes a received error. Returns `Ok(None)` for codes outside IMISC.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if a parameter is present but malformed.
    pub fn from_remote(err: &RemoteError) -> Result<Option<Self>, CodecError> {
        let param = || -> Result<Ia5List, CodecError> {
            Ok(err.parameter::<Ia5List>()?.unwrap_or_default())
        };
        Ok(Some(match err.code {
            CONGESTED => ImiscError::Congested,
            UNABLE_TO_DETERMINE_TIME => ImiscError::UnableToDetermineTime,
            UNABLE_TO_OPEN_FILE => ImiscError::UnableToOpenFile(param()?),
            UNABLE_TO_ACCESS_FILE => ImiscError::UnableToAccessFile(param()?),
            USER_NOT_LOGGED_IN => ImiscError::UserNotLoggedIn(param()?),
            _ => return Ok(None),
        }))
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Declare one marker type per operation.
macro_rules! imisc_operations {
    (
        $(
            $(#[$meta:meta])*
            $marker:ident = $code:literal, $name:literal, $arg:ty => $res:ty, [$($err:ident),*];
        )*
    ) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy)]
            pub struct $marker;

            impl RemoteOperation for $marker {
                const CODE: OperationCode = OperationCode($code);
                const NAME: &'static str = $name;
                const ERRORS: &'static [ErrorCode] = &[$($err),*];
                type Argument = $arg;
                type Result = $res;
            }
        )*

        fn build_table() -> Result<OperationTable, crate::table::TableError> {
            OperationTable::builder(MODULE)
                $(.operation::<$marker>())*
                .error(ErrorDescriptor::new(CONGESTED, "congested"))
                .error(ErrorDescriptor::new(UNABLE_TO_DETERMINE_TIME, "unableToDetermineTime"))
                .error(ErrorDescriptor::new(UNABLE_TO_OPEN_FILE, "unableToOpenFile").with_parameter::<Ia5List>())
                .error(ErrorDescriptor::new(UNABLE_TO_ACCESS_FILE, "unableToAccessFile").with_parameter::<Ia5List>())
                .error(ErrorDescriptor::new(USER_NOT_LOGGED_IN, "userNotLoggedIn").with_parameter::<Ia5List>())
                .build()
        }
    };
}

imisc_operations! {
    /// Current time as UTCTime.
    UtcTime = 0, "utcTime", Empty => UtcResult, [CONGESTED, UNABLE_TO_DETERMINE_TIME];
    /// Current time as seconds since 1900.
    TimeOfDay = 1, "timeOfDay", Empty => TimeResult, [CONGESTED, UNABLE_TO_DETERMINE_TIME];
    /// Users currently logged in.
    Users = 2, "users", Empty => Ia5List, [CONGESTED, UNABLE_TO_OPEN_FILE, UNABLE_TO_ACCESS_FILE];
    /// Character generator lines.
    CharGen = 3, "charGen", Empty => Ia5List, [CONGESTED];
    /// Quote of the day.
    Qotd = 4, "qotd", Empty => Ia5List, [CONGESTED, UNABLE_TO_OPEN_FILE, UNABLE_TO_ACCESS_FILE];
    /// Information about the named users, or all users if none are named.
    Finger = 5, "finger", Ia5List => Ia5List, [CONGESTED, UNABLE_TO_OPEN_FILE, USER_NOT_LOGGED_IN];
    /// Freshly generated passwords.
    PwdGen = 6, "pwdGen", Empty => Ia5List, [CONGESTED];
    /// Current time as GeneralizedTime.
    GenTime = 7, "genTime", Empty => GenResult, [CONGESTED, UNABLE_TO_DETERMINE_TIME];
    /// Deliver a message: first element names the recipient, the rest are lines.
    TellUser = 8, "tellUser", Ia5List => Empty, [CONGESTED, USER_NOT_LOGGED_IN, UNABLE_TO_ACCESS_FILE];
    Ping = 9, "ping", Empty => Empty, [CONGESTED];
    /// Discard the argument.
    Sink = 10, "sink", Data => Empty, [CONGESTED];
    /// Return the argument unchanged.
    Echo = 11, "echo", Data => Data, [CONGESTED];
}

/// The IMISC operation table.
///
/// # Panics
///
/// Never in practice: the definitions above are fixed and covered by tests.
pub fn table() -> &'static OperationTable {
    static TABLE: OnceLock<OperationTable> = OnceLock::new();
    TABLE.get_or_init(|| build_table().expect("IMISC operation definitions are consistent"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_contains_every_operation_once() {
        let table = table();
        assert_eq!(table.module(), "IMISC");
        assert_eq!(table.len(), 12);
        let names: Vec<&str> = table.operations().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "utcTime", "timeOfDay", "users", "charGen", "qotd", "finger", "pwdGen",
                "genTime", "tellUser", "ping", "sink", "echo",
            ]
        );
    }

    #[test]
    fn markers_verify_against_table() {
        let table = table();
        assert!(table.verify::<UtcTime>().is_ok());
        assert!(table.verify::<Finger>().is_ok());
        assert!(table.verify::<TellUser>().is_ok());
        assert!(table.verify::<Echo>().is_ok());
    }

    #[test]
    fn error_parameters_declared() {
        let table = table();
        assert!(table.error(CONGESTED).unwrap().parameter_type.is_none());
        assert!(table.error(USER_NOT_LOGGED_IN).unwrap().parameter_type.is_some());
    }

    #[test]
    fn imisc_error_remote_roundtrip() {
        let sent = ImiscError::UserNotLoggedIn(Ia5List::new(["mrose"]).unwrap());
        let remote = sent.clone().into_remote().unwrap();
        assert_eq!(remote.code, USER_NOT_LOGGED_IN);
        assert_eq!(ImiscError::from_remote(&remote).unwrap(), Some(sent));
    }

    #[test]
    fn foreign_error_code_is_not_imisc() {
        let remote = RemoteError::new(ErrorCode(77));
        assert_eq!(ImiscError::from_remote(&remote).unwrap(), None);
    }
}
