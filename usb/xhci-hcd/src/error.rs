use thiserror::Error;

pub const EIO: i32 = 5;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const ETIMEDOUT: i32 = 110;

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum XhciError {
    /// A bounded hardware poll ran out of iterations.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("out of DMA memory")]
    NoMemory,

    /// The controller completed a command or transfer with a code other than success.
    #[error("completion code {code}")]
    Completion { code: u8 },

    #[error("resource temporarily unavailable")]
    Again,

    #[error("invalid: {0}")]
    Invalid(&'static str),

    #[error("I/O error")]
    Io,

    #[error("misaligned {0}")]
    Misaligned(&'static str),

    #[error("no such controller")]
    NoController,
}

impl XhciError {
    /// The negative errno reported across the C-style entry points.
    pub fn errno(&self) -> i32 {
        -match self {
            XhciError::Timeout(_) => ETIMEDOUT,
            XhciError::NoMemory => ENOMEM,
            XhciError::Completion { .. } | XhciError::Io => EIO,
            XhciError::Again => EAGAIN,
            XhciError::Invalid(_) | XhciError::Misaligned(_) => EINVAL,
            XhciError::NoController => ENODEV,
        }
    }
}

pub type Result<T, E = XhciError> = std::result::Result<T, E>;
