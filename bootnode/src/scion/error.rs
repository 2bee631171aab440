use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::address::IsdAs;

#[derive(Debug, Error)]
pub enum ScionError {
    #[error("invalid ISD-AS '{0}'")]
    InvalidIsdAs(String),

    #[error("invalid address '{0}': {1}")]
    InvalidAddress(String, &'static str),

    #[error("stack already initialised for {current}, refusing {requested}")]
    AlreadyInitialized { current: IsdAs, requested: IsdAs },

    #[error("stack is not initialised")]
    NotInitialized,

    #[error("address in {requested} does not belong to the local AS {local}")]
    ForeignAddress { requested: IsdAs, local: IsdAs },

    #[error("daemon socket {} is unreachable: {source}", path.display())]
    DaemonUnreachable { path: PathBuf, source: io::Error },

    #[error("dispatcher socket {} does not exist", .0.display())]
    DispatcherMissing(PathBuf),

    #[error("dispatcher refused registration: {0}")]
    RegistrationRefused(String),

    #[error("malformed dispatcher reply: {0}")]
    Protocol(String),

    #[error("dispatcher I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type ScionResult<T> = Result<T, ScionError>;
