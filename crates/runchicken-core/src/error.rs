//! 错误类型

use crate::ble::transport::TransportError;
use crate::protocol::{DecodeError, DoorCommand, EncodeError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 会话从未关联过设备地址，调用方也没有提供
    #[error("No device address associated with this session")]
    ConnectionUnavailable,

    #[error("{command} command failed: {source}")]
    CommandFailed {
        command: DoorCommand,
        #[source]
        source: Box<Error>,
    },

    #[error("Status poll failed: {0}")]
    PollFailed(#[source] Box<Error>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// 是否值得重试 (仅限瞬时传输错误)
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(e) if e.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_transport_errors_are_retryable() {
        assert!(Error::Transport(TransportError::LinkLost).is_transient());
        assert!(Error::Transport(TransportError::Timeout("write".into())).is_transient());
        assert!(!Error::Transport(TransportError::DeviceNotFound("AA".into())).is_transient());
        assert!(!Error::ConnectionUnavailable.is_transient());
        assert!(!Error::Decode(DecodeError::PayloadTooShort { len: 3 }).is_transient());
    }

    #[test]
    fn test_command_failed_message() {
        let err = Error::CommandFailed {
            command: DoorCommand::Close,
            source: Box::new(Error::Transport(TransportError::NoAdapter)),
        };
        assert_eq!(
            err.to_string(),
            "close command failed: No Bluetooth adapters found"
        );
    }
}
