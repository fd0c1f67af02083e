use crate::CancelReason;

/// Result of a request that was not rejected with an error.
///
/// Cancelled requests, whether superseded by an identical request or
/// cancelled by the caller, resolve to [`Outcome::Cancelled`] rather than an
/// error.
#[must_use]
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled(CancelReason),
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The value, or `None` when cancelled.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Cancelled(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Completed(value) => Outcome::Completed(f(value)),
            Self::Cancelled(reason) => Outcome::Cancelled(reason),
        }
    }
}
