use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no route to host")]
    NoRoute,

    #[error("unknown protocol")]
    UnknownProtocol,

    #[error("unknown NIC id")]
    UnknownNicId,

    #[error("duplicate NIC id")]
    DuplicateNicId,

    #[error("bad local address")]
    BadLocalAddress,

    #[error("address already in use")]
    AddressInUse,

    #[error("operation would block")]
    WouldBlock,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("endpoint is closed for send")]
    ClosedForSend,

    #[error("endpoint is closed for receive")]
    ClosedForReceive,

    #[error("buffer too small")]
    BufferTooSmall,

    #[error("no ephemeral port available")]
    RangeExhausted,

    #[error("invalid port range")]
    InvalidPortRange,

    #[error("endpoint is in an invalid state")]
    InvalidEndpointState,

    #[error("unknown protocol option")]
    UnknownProtocolOption,

    #[error("malformed header")]
    MalformedHeader,

    #[error("operation not supported")]
    NotSupported,

    #[error("message too long")]
    MessageTooLong,

    #[error("destination address required")]
    DestinationRequired,

    #[error("invalid table: {0}")]
    InvalidTable(String),
}

impl Error {
    /// Reports whether the error should be left out of failure counters.
    pub fn ignore_stats(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
