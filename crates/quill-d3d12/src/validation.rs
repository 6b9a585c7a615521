use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

/// What to do when a device call fails or a frame invariant is broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Panic with the failure message.
    Panic,
    /// Emit a `tracing` error event and continue.
    Log,
    /// Continue silently. Failures are still counted.
    Ignore,
}

impl Default for ValidationMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Panic
        } else {
            Self::Log
        }
    }
}

/// Single funnel for device failures and state-machine violations.
///
/// The mode is chosen at construction and is independent of the build
/// profile; the failure counter is always maintained so release builds that
/// log or ignore still expose how often something went wrong.
#[derive(Debug, Default)]
pub struct Validator {
    mode: ValidationMode,
    failures: AtomicU64,
}

impl Validator {
    pub fn new(mode: ValidationMode) -> Self {
        Self {
            mode,
            failures: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn fail(&self, context: &str, message: impl Display) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            ValidationMode::Panic => panic!("{context}: {message}"),
            ValidationMode::Log => tracing::error!(context, "{message}"),
            ValidationMode::Ignore => {}
        }
    }

    /// Unwrap `result`, reporting the error (and returning `None`) on failure.
    pub fn check<T, E: Display>(&self, result: Result<T, E>, context: &str) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.fail(context, err);
                None
            }
        }
    }

    /// Report `message` when `condition` does not hold. Returns `condition`.
    pub fn ensure(&self, condition: bool, context: &str, message: impl FnOnce() -> String) -> bool {
        if !condition {
            self.fail(context, message());
        }
        condition
    }
}
