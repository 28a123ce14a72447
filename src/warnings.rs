use crate::config;

pub(crate) enum RuntimeWarning<'a> {
    BarrierTimeout(f64),
    ConfigMismatch {
        what: &'a str,
        workers: usize,
        elements: usize,
    },
    UnevenPartition {
        len: usize,
        num_pes: usize,
        remainder: usize,
    },
}

impl<'a> RuntimeWarning<'a> {
    fn print_warning(&self) -> bool {
        match self {
            RuntimeWarning::BarrierTimeout(elapsed) => {
                config().deadlock_timeout > 0.0 && *elapsed > config().deadlock_timeout
            }
            RuntimeWarning::ConfigMismatch { .. } | RuntimeWarning::UnevenPartition { .. } => true,
        }
    }

    pub(crate) fn print(self) {
        #[cfg(not(feature = "disable-runtime-warnings"))]
        if self.print_warning() {
            match self {
                RuntimeWarning::BarrierTimeout(elapsed) => {
                    tracing::warn!(
                        "[{:?}] potential deadlock detected after {:.1}s in a barrier. \
                        Barrier is a collective operation requiring all PEs to enter the barrier call, \
                        and gathers use barriers internally, so every PE must call the same collectives in the same order. \
                        The timeout can be set via LAMELLAR_DEADLOCK_TIMEOUT (current: {} seconds, 0 disables this warning).",
                        std::thread::current().name().unwrap_or("main"),
                        elapsed,
                        config().deadlock_timeout
                    );
                }
                RuntimeWarning::ConfigMismatch {
                    what,
                    workers,
                    elements,
                } => {
                    tracing::warn!(
                        "number of elements ({elements}) is less than the number of {what} ({workers}), continuing. \
                        Set LAMELLAR_ON_CONFIG_MISMATCH=abort to stop instead."
                    );
                }
                RuntimeWarning::UnevenPartition {
                    len,
                    num_pes,
                    remainder,
                } => {
                    tracing::warn!(
                        "totalsize of the matrix {len} is not a multiple of the number of processes ({num_pes}), \
                        the last {remainder} rows are handled by the LAMELLAR_REMAINDER policy"
                    );
                }
            }
        }
    }
}
