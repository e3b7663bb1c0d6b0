use anyhow::Error;
use log::{debug, warn};

use keel_api::error::{KeelError, ServicingError};

type CleanupFn<'a> = Box<dyn FnOnce() -> Result<(), Error> + 'a>;

/// Reversal actions registered as an orchestrated operation makes progress,
/// run unconditionally at the end in reverse registration order.
///
/// Every action runs exactly once. A primary servicing error is never masked
/// by a later cleanup failure.
#[derive(Default)]
pub struct CleanupStack<'a> {
    actions: Vec<(String, CleanupFn<'a>)>,
}

impl<'a> CleanupStack<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<(), Error> + 'a,
    {
        self.actions.push((label.into(), Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Unwinds the stack. Returns `primary` when set; otherwise the first
    /// cleanup failure, if any. Cleanup failures beyond the first are only
    /// logged.
    pub fn unwind(self, primary: Option<KeelError>) -> Result<(), KeelError> {
        let mut first_failure: Option<Error> = None;
        for (label, action) in self.actions.into_iter().rev() {
            debug!("Running cleanup step '{label}'");
            if let Err(e) = action() {
                warn!("Cleanup step '{label}' failed: {e:?}");
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }

        match (primary, first_failure) {
            (Some(e), _) => Err(e),
            (None, Some(e)) => Err(KeelError::with_source(ServicingError::Cleanup, e)),
            (None, None) => Ok(()),
        }
    }

    /// Unwinds the stack logging failures as warnings only. Used once an
    /// operation has passed its point of no return and is considered
    /// complete regardless of cleanup outcome.
    pub fn unwind_best_effort(self) {
        for (label, action) in self.actions.into_iter().rev() {
            debug!("Running cleanup step '{label}'");
            if let Err(e) = action() {
                warn!("Cleanup step '{label}' failed: {e:?}");
            }
        }
    }
}
