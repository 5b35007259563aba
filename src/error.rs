//! Definition of errors.

use std::error;
use std::fmt;

/// Returned by `LockFreeStack::try_push` when the node for the value could not be allocated.
/// The stack is left untouched and the value is handed back.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct AllocError<T>(pub T);

impl<T> AllocError<T> {
    /// Take back the value which was not pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for AllocError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("AllocError { .. }")
    }
}

impl<T> fmt::Display for AllocError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("node allocation failed")
    }
}

impl<T> error::Error for AllocError<T> {}

mod test {

    #[test]
    fn test_base() {
        use error::AllocError;

        let e = AllocError(5);
        assert_eq!(format!("{}", e), "node allocation failed");
        assert_eq!(format!("{:?}", e), "AllocError { .. }");
        assert_eq!(e.into_inner(), 5);
    }
}
