use std::{fmt, io};

use bytes::Bytes;

use crate::error::UserError;
use crate::frame::{Reason, StreamId};

/// Either an H2 reason or an I/O error
#[derive(Clone, Debug)]
pub enum Error {
    /// A fault scoped to one stream: emit RST_STREAM, keep the connection.
    Reset(StreamId, Reason, Initiator),
    /// A fault scoped to the connection: emit GOAWAY, then close.
    GoAway(Bytes, Reason, Initiator),
    /// A transport fault; the connection is already unusable.
    Io(io::ErrorKind, Option<String>),
    /// An invalid action taken by the user of the library.
    User(UserError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Initiator {
    Library,
    Remote,
}

impl Error {
    pub(crate) fn library_reset(stream_id: StreamId, reason: Reason) -> Self {
        Self::Reset(stream_id, reason, Initiator::Library)
    }

    pub(crate) fn library_go_away(reason: Reason) -> Self {
        Self::GoAway(Bytes::new(), reason, Initiator::Library)
    }

    pub(crate) fn library_go_away_data(reason: Reason, debug_data: impl Into<Bytes>) -> Self {
        Self::GoAway(debug_data.into(), reason, Initiator::Library)
    }

    pub(crate) fn remote_reset(stream_id: StreamId, reason: Reason) -> Self {
        Self::Reset(stream_id, reason, Initiator::Remote)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Reset(_, reason, _) | Self::GoAway(_, reason, _) => reason.fmt(fmt),
            Self::Io(_, Some(ref inner)) => inner.fmt(fmt),
            Self::Io(kind, None) => io::Error::from(kind).fmt(fmt),
            Self::User(ref err) => err.fmt(fmt),
        }
    }
}

impl From<io::ErrorKind> for Error {
    fn from(src: io::ErrorKind) -> Self {
        Self::Io(src, None)
    }
}

impl From<io::Error> for Error {
    fn from(src: io::Error) -> Self {
        Self::Io(src.kind(), src.get_ref().map(|inner| inner.to_string()))
    }
}

impl From<UserError> for Error {
    fn from(value: UserError) -> Self {
        Self::User(value)
    }
}
