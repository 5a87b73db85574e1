use std::fmt;

/// Outcome of a map operation.
///
/// `NeedSplit` is intentionally absent: it is an index-internal signal
/// (see `crate::index::NeedSplit`) caught and retried before any
/// `IndexContract` method returns, and never escapes to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    InsertKeyExists,
    NotFound,
    NotDefined,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "Ok",
            Status::InsertKeyExists => "InsertKeyExists",
            Status::NotFound => "NotFound",
            Status::NotDefined => "NotDefined",
            Status::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}
