use std::borrow::Cow;
use std::fmt;

use hyper::StatusCode;

pub type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type GateResult<T = (), E = GateError> = Result<T, E>;

/// Error codes produced by the gate itself.
///
/// Everything else the client sees comes from the upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum GateErrorCode {
    /// No identity token on the request.
    Unauthenticated,
    /// The token is malformed, expired, or its signature does not verify.
    InvalidToken,
    /// Authenticated, but the identity claim is missing or the path is not permitted.
    Forbidden,
    /// The access control document is unreadable or malformed.
    ConfigError,
    /// The upstream service failed or sent a listing the filter could not hold.
    BadGateway,
    InternalError,
}

impl GateErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "Unauthenticated",
            Self::InvalidToken => "InvalidToken",
            Self::Forbidden => "Forbidden",
            Self::ConfigError => "ConfigError",
            Self::BadGateway => "BadGateway",
            Self::InternalError => "InternalError",
        }
    }

    #[must_use]
    pub const fn status_code(self) -> StatusCode {
        match self {
            Self::Unauthenticated | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ConfigError | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway => StatusCode::BAD_GATEWAY,
        }
    }

    /// The text sent to clients. Internal details never leave the process.
    #[must_use]
    pub const fn public_message(self) -> &'static str {
        match self {
            Self::Unauthenticated => "Unauthorized",
            Self::InvalidToken => "Invalid token",
            Self::Forbidden => "Forbidden",
            Self::ConfigError => "Access configuration error",
            Self::BadGateway => "Bad gateway",
            Self::InternalError => "Internal server error",
        }
    }
}

impl fmt::Display for GateErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal failure of one request.
#[derive(Debug)]
pub struct GateError(Box<Inner>);

#[derive(Debug)]
struct Inner {
    code: GateErrorCode,
    message: Option<Cow<'static, str>>,
    source: Option<StdError>,
}

impl GateError {
    #[must_use]
    pub fn new(code: GateErrorCode) -> Self {
        Self(Box::new(Inner {
            code,
            message: None,
            source: None,
        }))
    }

    #[must_use]
    pub fn with_message(code: GateErrorCode, msg: impl Into<Cow<'static, str>>) -> Self {
        let mut this = Self::new(code);
        this.0.message = Some(msg.into());
        this
    }

    #[must_use]
    pub fn with_source(code: GateErrorCode, source: StdError) -> Self {
        let mut this = Self::new(code);
        this.0.source = Some(source);
        this
    }

    pub fn set_message(&mut self, msg: impl Into<Cow<'static, str>>) {
        self.0.message = Some(msg.into());
    }

    pub fn set_source(&mut self, source: StdError) {
        self.0.source = Some(source);
    }

    #[must_use]
    pub fn code(&self) -> GateErrorCode {
        self.0.code
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.0.message.as_deref()
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.0.code.status_code()
    }
}

impl From<GateErrorCode> for GateError {
    fn from(code: GateErrorCode) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.code)?;
        if let Some(msg) = &self.0.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for GateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Creates a [`GateError`].
///
/// ```
/// use keygate::gate_error;
///
/// let err = gate_error!(Forbidden, "key {:?} is outside the permitted prefixes", "b/2.txt");
/// assert_eq!(err.status_code(), 403);
/// ```
#[macro_export]
macro_rules! gate_error {
    ($source:expr, $code:ident) => {{
        let mut err = $crate::GateError::new($crate::GateErrorCode::$code);
        err.set_source(Box::new($source));
        err
    }};
    ($source:expr, $code:ident, $($arg:tt)+) => {{
        let mut err = $crate::GateError::with_message($crate::GateErrorCode::$code, format!($($arg)+));
        err.set_source(Box::new($source));
        err
    }};
    ($code:ident) => {
        $crate::GateError::new($crate::GateErrorCode::$code)
    };
    ($code:ident, $($arg:tt)+) => {
        $crate::GateError::with_message($crate::GateErrorCode::$code, format!($($arg)+))
    };
}
