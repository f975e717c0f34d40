//! Module lifecycle

use crate::FynxResult;

/// A protocol daemon as seen by the process hosting it
///
/// The host calls `init` once before feeding the module any input and
/// `shutdown` once when it stops; both default to doing nothing.
pub trait SecurityModule: Send + Sync {
    /// Unique module identifier
    fn id(&self) -> &'static str;

    /// Module version
    fn version(&self) -> &'static str;

    /// One-line description
    fn description(&self) -> &'static str;

    /// Prepare the module for input
    ///
    /// # Errors
    ///
    /// Returns an error if the module's configuration cannot be used
    fn init(&mut self) -> FynxResult<()> {
        Ok(())
    }

    /// Release everything the module holds
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails
    fn shutdown(&mut self) -> FynxResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FynxError;

    struct Probe {
        started: bool,
    }

    impl SecurityModule for Probe {
        fn id(&self) -> &'static str {
            "probe"
        }

        fn version(&self) -> &'static str {
            "0.0.1"
        }

        fn description(&self) -> &'static str {
            "lifecycle probe"
        }

        fn init(&mut self) -> FynxResult<()> {
            if self.started {
                return Err(FynxError::Config("already started".into()));
            }
            self.started = true;
            Ok(())
        }
    }

    #[test]
    fn test_default_shutdown() {
        let mut probe = Probe { started: false };
        assert!(probe.init().is_ok());
        assert!(probe.init().is_err());
        assert!(probe.shutdown().is_ok());
        assert_eq!(probe.id(), "probe");
    }
}
