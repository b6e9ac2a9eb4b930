use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// The peer closed the connection before a full message was transferred.
    Disconnected,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    UnknownMessage(u16),
    Malformed,
    Encoding,
    PayloadTooLarge,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => NetworkError::Disconnected,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
/// Decoders check the remaining size upfront and only read once everything they need
/// is known to be present.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}
