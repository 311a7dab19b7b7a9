use std::{
    error::Error,
    fmt::{self, Display, Formatter},
};

/// Classifies what went wrong; every [`FolError`](FolError) carries exactly one kind.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum FolErrorKind {
    /// A character was registered for a role (operator, comma, delimiter)
    /// that conflicts with a role it already has.
    Config,
    /// The input string cannot be parsed, e.g., an unmatched closing
    /// parenthesis or a second decimal separator within one literal.
    Syntax,
    /// An operation was requested in a state that does not permit it, e.g.,
    /// evaluation while variables are still unbound.
    State,
    /// A compute function was called with arguments outside its domain,
    /// e.g., a negative base raised to a fractional power.
    Domain,
}

impl Display for FolErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            FolErrorKind::Config => "configuration conflict",
            FolErrorKind::Syntax => "syntax error",
            FolErrorKind::State => "state error",
            FolErrorKind::Domain => "domain error",
        };
        write!(f, "{}", s)
    }
}

/// This will be thrown at you if something within Folex went wrong. Ok,
/// obviously it is not an exception, so thrown needs to be understood
/// figuratively.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct FolError {
    kind: FolErrorKind,
    msg: String,
}

impl FolError {
    pub fn new(kind: FolErrorKind, msg: String) -> Self {
        FolError { kind, msg }
    }
    pub fn kind(&self) -> FolErrorKind {
        self.kind
    }
    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl Display for FolError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)
    }
}
impl Error for FolError {}

/// Folex' result type with [`FolError`](FolError) as error type.
pub type FolResult<U> = Result<U, FolError>;

/// Creates a [`FolError`](FolError) with a formatted message.
///
/// ```rust
/// use folex::{folerr, FolErrorKind};
/// let e = folerr!(FolErrorKind::Syntax, "unexpected character {}", ')');
/// assert_eq!(e.kind(), FolErrorKind::Syntax);
/// ```
#[macro_export]
macro_rules! folerr {
    ($kind:expr, $($arg:tt)*) => {
        $crate::FolError::new($kind, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = folerr!(FolErrorKind::State, "{} variables unbound", 2);
        assert_eq!(format!("{}", e), "state error: 2 variables unbound");
        assert_eq!(e.kind(), FolErrorKind::State);
    }
}
