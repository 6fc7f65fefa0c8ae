//! Always-admit ledger used when quota enforcement is disabled.

use std::time::Duration;

use super::{Verdict, reset_after};

/// Stand-in for the real ledger when `QUOTAGATE_REDIS_ENABLED=false`.
/// Every check admits with a full window remaining.
#[derive(Debug, Default)]
pub struct NoopLedger;

impl NoopLedger {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, limit: i64, window: Duration, now_ms: i64) -> Verdict {
        Verdict::admit(limit - 1, reset_after(now_ms, window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_always_admits() {
        let ledger = NoopLedger::new();
        for _ in 0..1_000 {
            let verdict = ledger.check(3, Duration::from_secs(60), 1_000);
            assert!(verdict.admitted);
            assert_eq!(verdict.remaining, 2);
        }
    }
}
