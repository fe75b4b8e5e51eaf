//! `remop` core: operation tables, Remote Operations PDUs, payload codec,
//! and the IMISC module definitions.

pub mod clock;
pub mod codec;
pub mod imisc;
pub mod operation;
pub mod pdu;
pub mod table;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use codec::{decode_payload, encode_payload, CodecError};
pub use operation::{RemoteError, RemoteOperation};
pub use pdu::{
    ErrorPdu, GeneralProblem, InvokePdu, InvokeProblem, Pdu, RejectPdu, RejectProblem,
    ResultPdu, ReturnErrorProblem, ReturnResultProblem,
};
pub use table::{
    ErrorDescriptor, OperationDescriptor, OperationTable, ParameterType, TableBuilder, TableError,
};
pub use types::{ErrorCode, InvokeId, OperationClass, OperationCode, Priority};
