use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenesysError {
    #[error("serial I/O error: {0}")]
    Io(String),

    #[error("no reply to {command:?}")]
    NoReply { command: String },

    #[error("address {address} did not acknowledge select after {attempts} attempts")]
    AddressSelectFailed { address: u8, attempts: u32 },

    #[error("unexpected reply {reply:?} to {command:?}")]
    UnexpectedReply { command: String, reply: String },
}

impl From<std::io::Error> for GenesysError {
    fn from(e: std::io::Error) -> Self {
        GenesysError::Io(e.to_string())
    }
}

pub type GenesysResult<T> = Result<T, GenesysError>;
