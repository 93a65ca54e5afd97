//! Error classes shared by the MME handlers

use std::fmt;

/// How a dropped message is reported at the dispatcher boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Missing mandatory IE, wrong field length
    Malformed,
    /// Unknown or unimplemented enumerated value
    Unimplemented,
    /// UE, session or eNB context absent
    NotFound,
    /// Allocation, build or commit failure; protocol invariant broken
    Fatal,
}

impl ErrorClass {
    /// Log level used for this class
    pub fn level(&self) -> log::Level {
        match self {
            ErrorClass::Unimplemented => log::Level::Warn,
            ErrorClass::Malformed | ErrorClass::NotFound | ErrorClass::Fatal => log::Level::Error,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Malformed => "malformed",
            ErrorClass::Unimplemented => "not implemented",
            ErrorClass::NotFound => "not found",
            ErrorClass::Fatal => "assertion failed",
        };
        f.write_str(name)
    }
}
