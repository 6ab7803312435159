//! Scoped machine sessions.
//!
//! An armed session resets the controller, zeroes the work origin and selects
//! millimetres + absolute mode. Ending it homes the machine twice and closes
//! the port. Both sequences run every step even when some fail, and the
//! teardown runs on every exit path: explicit [`ArmedSession::finish`], early
//! return, `?` or a panic unwinding through the guard.

use crate::driver::{ConnectionState, GrblDriver};
use gantry_core::{AppResult, GantryError, SessionPhase};
use std::ops::{Deref, DerefMut};
use tracing::{error, instrument};

/// Guard for an armed machine. Derefs to the driver.
pub struct ArmedSession<'a> {
    driver: &'a mut GrblDriver,
    finished: bool,
}

impl<'a> ArmedSession<'a> {
    /// End the session now and report teardown failures.
    pub fn finish(mut self) -> AppResult<()> {
        self.finished = true;
        let errors = self.driver.teardown_sequence();
        into_result(SessionPhase::Teardown, errors)
    }
}

impl Deref for ArmedSession<'_> {
    type Target = GrblDriver;

    fn deref(&self) -> &GrblDriver {
        self.driver
    }
}

impl DerefMut for ArmedSession<'_> {
    fn deref_mut(&mut self) -> &mut GrblDriver {
        self.driver
    }
}

impl Drop for ArmedSession<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let errors = self.driver.teardown_sequence();
        if let Err(e) = into_result(SessionPhase::Teardown, errors) {
            error!(error = %e, "Session teardown on drop failed");
        }
    }
}

fn into_result(phase: SessionPhase, errors: Vec<GantryError>) -> AppResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(GantryError::SessionFailed { phase, errors })
    }
}

impl GrblDriver {
    /// Open the configured port (if closed) and run the start sequence.
    ///
    /// If the start sequence fails the teardown still runs, so the port is
    /// closed when this returns an error.
    #[instrument(skip(self))]
    pub fn arm(&mut self) -> AppResult<ArmedSession<'_>> {
        if self.connection_state() == ConnectionState::Closed {
            self.open_configured()?;
        }
        let start_errors = self.start_sequence();
        if !start_errors.is_empty() {
            let teardown = self.teardown_sequence();
            if let Err(e) = into_result(SessionPhase::Teardown, teardown) {
                error!(error = %e, "Teardown after failed start also failed");
            }
            return Err(GantryError::SessionFailed {
                phase: SessionPhase::Start,
                errors: start_errors,
            });
        }
        Ok(ArmedSession {
            driver: self,
            finished: false,
        })
    }

    /// Arm, run `body`, tear down.
    ///
    /// The body's error wins over a teardown error; a teardown error is
    /// reported when the body succeeded.
    pub fn run_session<T>(
        &mut self,
        body: impl FnOnce(&mut GrblDriver) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut session = self.arm()?;
        let result = body(&mut *session);
        let teardown = session.finish();
        match (result, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                error!(error = %teardown, "Teardown failed after session error");
                Err(e)
            }
        }
    }
}
