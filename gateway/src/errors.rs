use crate::config::ValidationError;
use experiments::RemoteErrorKind;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),
    #[error("could not create remote client: {0}")]
    RemoteClient(#[from] RemoteErrorKind),
}
