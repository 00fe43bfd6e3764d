//! Session fatal error types surfaced at the command boundary.

use std::borrow::Cow;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;

pub type PeerResult<T> = Result<T, PeerError>;

/// A list specifying the categories of PeerErrors that may occur.
///
/// Every kind is fatal to the session it occurred in but never to the
/// process or to other sessions.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum PeerErrorKind {
    /// No readiness progress was made within the session deadline.
    Timeout,
    /// The peer violated the wire protocol (malformed handshake, oversized
    /// frame, detected flooding).
    ProtocolViolation,
    /// The peer or a collaborator raised a failure the session cannot
    /// recover from.
    Aborted,
    /// A transient failure, the peer may be worth another connection
    /// attempt later.
    Retryable,
}

#[derive(Debug)]
pub struct PeerError {
    kind: PeerErrorKind,
    desc: &'static str,
    detail: Option<Cow<'static, str>>,
}

impl PeerError {
    pub fn new(kind: PeerErrorKind, desc: &'static str) -> PeerError {
        PeerError {
            kind: kind,
            desc: desc,
            detail: None,
        }
    }

    pub fn with_detail<T>(kind: PeerErrorKind, desc: &'static str, detail: T) -> PeerError
        where T: Into<Cow<'static, str>>
    {
        PeerError {
            kind: kind,
            desc: desc,
            detail: Some(detail.into()),
        }
    }

    pub fn kind(&self) -> PeerErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_ref().map(|x| &**x)
    }
}

impl Display for PeerError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.write_fmt(format_args!("Kind: {:?}, Description: {}", self.kind, self.desc))?;

        if let Some(detail) = self.detail.as_ref() {
            f.write_fmt(format_args!(", Detail: {}", detail))?;
        }

        Ok(())
    }
}

impl Error for PeerError {
    fn description(&self) -> &str {
        self.desc
    }
}

impl From<io::Error> for PeerError {
    fn from(error: io::Error) -> PeerError {
        let kind = match error.kind() {
            io::ErrorKind::ConnectionRefused |
            io::ErrorKind::ConnectionReset |
            io::ErrorKind::TimedOut => PeerErrorKind::Retryable,
            _ => PeerErrorKind::Aborted,
        };

        PeerError::with_detail(kind, "IO Error Occurred On The Peer Socket", format!("{}", error))
    }
}
