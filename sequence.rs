use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct RequestSequencer {
    latest: AtomicU64,
}

impl RequestSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> RequestToken {
        RequestToken(self.latest.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn is_current(&self, token: RequestToken) -> bool {
        self.latest.load(Ordering::Acquire) == token.0
    }

    /// Passes `result` through only if no newer request has been issued.
    pub fn accept<T>(&self, token: RequestToken, result: T) -> Option<T> {
        if self.is_current(token) {
            Some(result)
        } else {
            log::info!(
                "Discarding result of request {} (latest is {})",
                token.0,
                self.latest.load(Ordering::Acquire)
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_increase() {
        let seq = RequestSequencer::new();
        let a = seq.issue();
        let b = seq.issue();
        assert!(b > a);
        assert_eq!(a.value() + 1, b.value());
    }

    #[test]
    fn superseded_results_are_discarded() {
        let seq = RequestSequencer::new();
        let first = seq.issue();
        let second = seq.issue();
        assert_eq!(seq.accept(first, "stale"), None);
        assert_eq!(seq.accept(second, "fresh"), Some("fresh"));
        assert!(!seq.is_current(first));
    }
}
