use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// Transient condition, the operation should be retried.
    Wait,
    /// Unrecoverable condition, the connection must be dropped.
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    BadMarker,
    Closed,
    PayloadTooLarge,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => NetworkError::Wait,
            io::ErrorKind::UnexpectedEof => NetworkError::Fatal(ErrorType::Closed),
            io::ErrorKind::InvalidInput => {
                // Invalid arguments on a transport call are programming errors
                debug_assert!(false, "invalid argument on transport call");
                NetworkError::Fatal(ErrorType::Io(io::ErrorKind::InvalidInput))
            }
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds_map_to_wait() {
        let result = NetworkError::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert_eq!(result, NetworkError::Wait);

        let result = NetworkError::from(io::Error::from(io::ErrorKind::Interrupted));
        assert_eq!(result, NetworkError::Wait);
    }

    #[test]
    fn test_fatal_kinds_keep_their_kind() {
        let result = NetworkError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(
            result,
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetworkError>(()).has_failed());
        assert!(!Err::<(), _>(NetworkError::Wait).has_failed());
        assert!(Err::<(), _>(NetworkError::Fatal(ErrorType::Closed)).has_failed());
    }
}
