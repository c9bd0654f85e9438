use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// cooperative cancellation flag shared between a session and its callers
///
/// a child token reports cancelled when either itself or its parent is
/// cancelled, while resetting the child leaves the parent untouched.
/// the session keeps a parent token for teardown and hands a child to
/// every blocking call so that `unlock` and `stop` both wake them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    /// a fresh, not cancelled token
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// a token that also observes the cancellation of `self`
    pub fn child(&self) -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(self.flag.clone()),
        }
    }

    /// signal every holder of this token
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// clear this token's own flag, a cancelled parent still shows through
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// check the token, called at each suspension point
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::Acquire))
    }
}
