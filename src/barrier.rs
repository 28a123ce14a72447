use crate::lamellae::comm::{Comm, CommInfo, CommRdma, WordLayout};
use crate::warnings::RuntimeWarning;

use crossbeam::utils::Backoff;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Panic payload of a PE unwinding out of a barrier because another PE of its group panicked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PeAborted;

/// Two phase counter barrier.
///
/// Every PE owns `num_pes` words per phase, entering PE writes its counter into slot `my_pe`
/// of every PE and then waits until all slots of its own copy hold the same counter.
pub(crate) struct Barrier {
    my_pe: usize,
    num_pes: usize,
    comm: Arc<Comm>,
    barrier_cnt: AtomicUsize,
    layout: WordLayout,
}

#[derive(Clone, Copy)]
enum Phase {
    One,
    Two,
}

impl Barrier {
    pub(crate) fn new(comm: Arc<Comm>) -> Barrier {
        let my_pe = comm.my_pe();
        let num_pes = comm.num_pes();
        Barrier {
            my_pe,
            num_pes,
            comm,
            barrier_cnt: AtomicUsize::new(0),
            layout: WordLayout::new(num_pes),
        }
    }

    fn slot(&self, phase: Phase, pe: usize) -> usize {
        match phase {
            Phase::One => self.layout.barrier1(pe),
            Phase::Two => self.layout.barrier2(pe),
        }
    }

    fn print_bar(&self) {
        let read = |phase| {
            (0..self.num_pes)
                .map(|pe| self.comm.word(self.slot(phase, pe)))
                .collect::<Vec<_>>()
        };
        tracing::debug!(
            "[{:?}] [LAMELLAR BARRIER] {:?} {:?}",
            self.my_pe,
            read(Phase::One),
            read(Phase::Two)
        );
    }

    fn check_barrier_vals(&self, barrier_id: usize, phase: Phase) {
        let mut s = Instant::now();
        let backoff = Backoff::new();
        for pe in 0..self.num_pes {
            while self.comm.word(self.slot(phase, pe)) != barrier_id {
                self.check_aborted();
                backoff.snooze();
                let elapsed = s.elapsed().as_secs_f64();
                if config_timeout_exceeded(elapsed) {
                    RuntimeWarning::BarrierTimeout(elapsed).print();
                    self.print_bar();
                    s = Instant::now();
                }
            }
        }
    }

    fn check_aborted(&self) {
        if self.comm.word(self.layout.aborted()) != 0 {
            tracing::error!("[{}] leaving barrier, another pe panicked", self.my_pe);
            std::panic::panic_any(PeAborted);
        }
    }

    /// Release every PE of the group waiting in (or later entering) a barrier by making it panic
    pub(crate) fn abort(&self) {
        for pe in 0..self.num_pes {
            self.comm.put_word(pe, self.layout.aborted(), 1);
        }
    }

    fn put_barrier_val(&self, barrier_id: usize, phase: Phase) {
        let slot = self.slot(phase, self.my_pe);
        for pe in 0..self.num_pes {
            self.comm.put_word(pe, slot, barrier_id);
        }
    }

    pub(crate) fn barrier(&self) {
        if self.num_pes > 1 {
            let mut barrier_id = self.barrier_cnt.fetch_add(1, Ordering::SeqCst);
            self.check_barrier_vals(barrier_id, Phase::Two);
            barrier_id += 1;
            self.put_barrier_val(barrier_id, Phase::One);
            self.check_barrier_vals(barrier_id, Phase::One);
            self.put_barrier_val(barrier_id, Phase::Two);
        }
    }
}

fn config_timeout_exceeded(elapsed: f64) -> bool {
    let timeout = crate::config().deadlock_timeout;
    timeout > 0.0 && elapsed > timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lamellae::thread_lamellae::ThreadBuilder;
    use crate::lamellae::LamellaeInit;

    #[test]
    fn phases_observe_prior_writes() {
        let num_pes = 4;
        let comms = ThreadBuilder::new(num_pes, 64).init_comms().unwrap();
        let layout = WordLayout::new(num_pes);
        std::thread::scope(|s| {
            for comm in comms.iter() {
                s.spawn(move || {
                    let barrier = Barrier::new(comm.clone());
                    let me = comm.my_pe();
                    for round in 1..=5 {
                        // everyone writes its round into its gather_len slot on pe 0
                        comm.put_word(0, layout.gather_len(me), round);
                        barrier.barrier();
                        if me == 0 {
                            for pe in 0..num_pes {
                                assert_eq!(comm.word(layout.gather_len(pe)), round);
                            }
                        }
                        barrier.barrier();
                    }
                });
            }
        });
    }

    #[test]
    fn abort_releases_waiting_pes() {
        let comms = ThreadBuilder::new(3, 64).init_comms().unwrap();
        let results = std::thread::scope(|s| {
            let handles = comms
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let barrier = Barrier::new(comm.clone());
                        if comm.my_pe() == 2 {
                            barrier.abort();
                            return Ok(());
                        }
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| barrier.barrier()))
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        for res in &results[..2] {
            let payload = res.as_ref().unwrap_err();
            assert_eq!(payload.downcast_ref::<PeAborted>(), Some(&PeAborted));
        }
        assert!(results[2].is_ok());
    }

    #[test]
    fn single_pe_is_a_no_op() {
        let comms = ThreadBuilder::new(1, 8).init_comms().unwrap();
        let barrier = Barrier::new(comms[0].clone());
        barrier.barrier();
        barrier.barrier();
        assert_eq!(comms[0].word(WordLayout::new(1).barrier1(0)), 0);
    }
}
