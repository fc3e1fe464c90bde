use std::sync::atomic::{AtomicBool, Ordering};

/// Held while a sweep runs. A second sweep that cannot acquire it skips.
pub struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_skips_until_release() {
        let flag = AtomicBool::new(false);
        let guard = RunGuard::try_acquire(&flag);
        assert!(guard.is_some());
        assert!(RunGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(RunGuard::try_acquire(&flag).is_some());
    }
}
