use std::{fmt, io, num::ParseFloatError, str::Utf8Error};
use quick_xml::events::attributes::AttrError;

/// Broad class of a failure, so callers can tell bad input from bad data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    /// The input is not well-formed OSM XML.
    Xml,
    /// A typed column (`lon`, `lat`, `timestamp`) holds text that does not parse.
    Coercion,
    Fetch,
    Cache,
    Config,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn xml(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Xml, message)
    }

    pub fn coercion(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Coercion, message)
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Cache, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Config, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            message: value.to_string()
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(value: quick_xml::Error) -> Self {
        Error {
            kind: ErrorKind::Xml,
            message: value.to_string()
        }
    }
}

impl From<AttrError> for Error {
    fn from(value: AttrError) -> Self {
        Error {
            kind: ErrorKind::Xml,
            message: value.to_string()
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Error {
            kind: ErrorKind::Xml,
            message: value.to_string()
        }
    }
}

impl From<ParseFloatError> for Error {
    fn from(value: ParseFloatError) -> Self {
        Error {
            kind: ErrorKind::Coercion,
            message: value.to_string()
        }
    }
}

impl From<chrono::ParseError> for Error {
    fn from(value: chrono::ParseError) -> Self {
        Error {
            kind: ErrorKind::Coercion,
            message: value.to_string()
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Config,
            message: value.to_string()
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(value: ureq::Error) -> Self {
        Error {
            kind: ErrorKind::Fetch,
            message: value.to_string()
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
