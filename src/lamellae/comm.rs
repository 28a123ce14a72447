pub(crate) mod error;

pub use error::*;

use super::Backend;

use crate::lamellae::{
    local_lamellae::LocalComm, shmem_lamellae::ShmemComm, thread_lamellae::ThreadComm,
};
use enum_dispatch::enum_dispatch;

use std::sync::atomic::{AtomicUsize, Ordering};

/// Every backend exposes, for each PE, a region of atomic words (used for barriers and
/// gather bookkeeping) followed by a byte heap (used to stage gathered payloads).
#[enum_dispatch(CommInfo, CommRdma)]
#[derive(Debug)]
pub(crate) enum Comm {
    Local(LocalComm),
    Threads(ThreadComm),
    Shmem(ShmemComm),
}

#[enum_dispatch]
pub(crate) trait CommInfo {
    fn my_pe(&self) -> usize;
    fn num_pes(&self) -> usize;
    fn backend(&self) -> Backend;
}

#[enum_dispatch]
pub(crate) trait CommRdma {
    /// size in bytes of every PE's heap
    fn heap_size(&self) -> usize;
    /// copy `src` into the heap of `pe` starting at byte `offset`
    fn put(&self, pe: usize, offset: usize, src: &[u8]) -> CommResult<()>;
    /// copy from the heap of the calling PE
    fn get_local(&self, offset: usize, dst: &mut [u8]) -> CommResult<()>;
    /// store `val` into word `index` of `pe`
    fn put_word(&self, pe: usize, index: usize, val: usize);
    /// load word `index` of the calling PE
    fn word(&self, index: usize) -> usize;
}

/// Indices into the per-PE word region.
///
/// `[0, n)` barrier phase one, `[n, 2n)` barrier phase two, `[2n, 3n)` gather lengths,
/// `3n` gather round count, `3n + 1` set once some PE of the group has panicked.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WordLayout {
    num_pes: usize,
}

impl WordLayout {
    pub(crate) fn new(num_pes: usize) -> WordLayout {
        WordLayout { num_pes }
    }
    pub(crate) fn len(&self) -> usize {
        3 * self.num_pes + 2
    }
    pub(crate) fn barrier1(&self, pe: usize) -> usize {
        pe
    }
    pub(crate) fn barrier2(&self, pe: usize) -> usize {
        self.num_pes + pe
    }
    pub(crate) fn gather_len(&self, pe: usize) -> usize {
        2 * self.num_pes + pe
    }
    pub(crate) fn gather_rounds(&self) -> usize {
        3 * self.num_pes
    }
    pub(crate) fn aborted(&self) -> usize {
        3 * self.num_pes + 1
    }
}

pub(crate) fn check_bounds(offset: usize, len: usize, heap_size: usize) -> CommResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= heap_size => Ok(()),
        _ => Err(CommError::OutOfBounds {
            offset,
            len,
            heap_size,
        }),
    }
}

pub(crate) fn check_pe(pe: usize, num_pes: usize) -> CommResult<()> {
    if pe < num_pes {
        Ok(())
    } else {
        Err(CommError::InvalidPe { pe, num_pes })
    }
}

pub(crate) fn new_words(len: usize) -> Box<[AtomicUsize]> {
    (0..len).map(|_| AtomicUsize::new(0)).collect()
}

pub(crate) fn store_word(words: &[AtomicUsize], index: usize, val: usize) {
    words[index].store(val, Ordering::SeqCst);
}

pub(crate) fn load_word(words: &[AtomicUsize], index: usize) -> usize {
    words[index].load(Ordering::SeqCst)
}
