use crate::address::Address;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Kind-tagged errors for the chat fabric.
///
/// The router only terminates a loop on a critical kind; everything else is
/// logged and the loop continues. User-facing kinds are surfaced to the UI
/// and never tear anything down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The three-message connect sequence was not honored.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A session with this identity is already attached to this CAP.
    #[error("user exists")]
    AlreadyExists,

    /// The user is not attached to this CAP.
    #[error("user doesn't exist")]
    NotExists,

    /// Recovery failed or the recovered address does not match the sender.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A store nonce update that is not the strict successor.
    #[error("nonce out of order: got {got}, expected {expected}")]
    NonceOutOfOrder { got: u64, expected: u64 },

    /// An inbound nonce that is evidence of tampering or state desync.
    #[error("possible replay: got nonce {got}, expected {expected}")]
    PossibleReplay { got: u64, expected: u64 },

    /// The bus rejected a publish or a pull.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// The peer or transport is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// The surrounding context was canceled.
    #[error("canceled")]
    Canceled,

    /// The durable bus consumer no longer exists.
    #[error("consumer deleted")]
    ConsumerDeleted,

    /// A frame or file that does not parse.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown contact: {0}")]
    UnknownContact(Address),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// `/share key` without a share key configured.
    #[error("no share key available")]
    NoKey,

    /// A frame left the host but the local record could not be updated.
    #[error("state drift: {0}")]
    StateDrift(String),

    /// Identity key material could not be created or loaded.
    #[error("identity: {0}")]
    Identity(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Critical errors terminate the owning loop and remove the user.
    /// Everything else is transient: log and continue.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::Canceled | Error::ConsumerDeleted
        )
    }
}
