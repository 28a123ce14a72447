//! The benchmark drivers behind the `matvec_multinode` and `dot_test` binaries.

use crate::warnings::RuntimeWarning;

use serde::{Deserialize, Serialize};

pub mod dot;
pub mod matvec;

/// What a benchmark does when it has more workers than elements to work on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// stop the run with an error
    Abort,
    /// log a warning and continue
    Warn,
}

impl MismatchPolicy {
    /// `Ok` when `workers <= elements`, otherwise apply the policy
    pub fn check(
        &self,
        what: &'static str,
        workers: usize,
        elements: usize,
    ) -> Result<(), ConfigMismatch> {
        if workers <= elements {
            return Ok(());
        }
        match self {
            MismatchPolicy::Abort => Err(ConfigMismatch {
                what,
                workers,
                elements,
            }),
            MismatchPolicy::Warn => {
                RuntimeWarning::ConfigMismatch {
                    what,
                    workers,
                    elements,
                }
                .print();
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMismatch {
    pub what: &'static str,
    pub workers: usize,
    pub elements: usize,
}

impl std::fmt::Display for ConfigMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "number of elements ({}) is less than the number of {} ({})",
            self.elements, self.what, self.workers
        )
    }
}

impl std::error::Error for ConfigMismatch {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies() {
        assert_eq!(MismatchPolicy::Abort.check("threads", 4, 4), Ok(()));
        assert_eq!(MismatchPolicy::Warn.check("threads", 8, 4), Ok(()));
        let err = MismatchPolicy::Abort.check("threads", 8, 4).unwrap_err();
        assert_eq!(
            err.to_string(),
            "number of elements (4) is less than the number of threads (8)"
        );
    }
}
