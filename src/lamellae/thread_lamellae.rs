use super::comm::{
    check_bounds, check_pe, load_word, new_words, store_word, Comm, CommInfo, CommRdma,
    CommResult, WordLayout,
};
use super::{Backend, LamellaeInit};

use parking_lot::Mutex;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// The memory one PE exposes to the others: atomic words plus a byte heap
pub(crate) struct PeRegion {
    words: Box<[AtomicUsize]>,
    heap: Mutex<Vec<u8>>,
}

impl PeRegion {
    pub(crate) fn new(num_words: usize, heap_size: usize) -> PeRegion {
        PeRegion {
            words: new_words(num_words),
            heap: Mutex::new(vec![0u8; heap_size]),
        }
    }

    pub(crate) fn put(&self, offset: usize, src: &[u8]) -> CommResult<()> {
        let mut heap = self.heap.lock();
        check_bounds(offset, src.len(), heap.len())?;
        heap[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub(crate) fn get(&self, offset: usize, dst: &mut [u8]) -> CommResult<()> {
        let heap = self.heap.lock();
        check_bounds(offset, dst.len(), heap.len())?;
        dst.copy_from_slice(&heap[offset..offset + dst.len()]);
        Ok(())
    }

    pub(crate) fn put_word(&self, index: usize, val: usize) {
        store_word(&self.words, index, val);
    }

    pub(crate) fn word(&self, index: usize) -> usize {
        load_word(&self.words, index)
    }
}

/// One PE of a group whose PEs are threads of the current process.
///
/// All PEs of the group hold the same `regions`, a "put" is a copy into another thread's region.
pub(crate) struct ThreadComm {
    my_pe: usize,
    num_pes: usize,
    heap_size: usize,
    regions: Arc<Vec<PeRegion>>,
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ThreadComm {{ my_pe: {}, num_pes: {}, heap_size: {} }}",
            self.my_pe, self.num_pes, self.heap_size
        )
    }
}

impl CommInfo for ThreadComm {
    fn my_pe(&self) -> usize {
        self.my_pe
    }
    fn num_pes(&self) -> usize {
        self.num_pes
    }
    fn backend(&self) -> Backend {
        Backend::Threads
    }
}

impl CommRdma for ThreadComm {
    fn heap_size(&self) -> usize {
        self.heap_size
    }
    fn put(&self, pe: usize, offset: usize, src: &[u8]) -> CommResult<()> {
        check_pe(pe, self.num_pes)?;
        self.regions[pe].put(offset, src)
    }
    fn get_local(&self, offset: usize, dst: &mut [u8]) -> CommResult<()> {
        self.regions[self.my_pe].get(offset, dst)
    }
    fn put_word(&self, pe: usize, index: usize, val: usize) {
        self.regions[pe].put_word(index, val);
    }
    fn word(&self, index: usize) -> usize {
        self.regions[self.my_pe].word(index)
    }
}

pub(crate) struct ThreadBuilder {
    num_pes: usize,
    heap_size: usize,
}

impl ThreadBuilder {
    pub(crate) fn new(num_pes: usize, heap_size: usize) -> ThreadBuilder {
        ThreadBuilder { num_pes, heap_size }
    }
}

impl LamellaeInit for ThreadBuilder {
    fn init_fabric(&mut self) -> (usize, usize) {
        (0, self.num_pes)
    }
    fn init_comms(&mut self) -> CommResult<Vec<Arc<Comm>>> {
        let layout = WordLayout::new(self.num_pes);
        let regions = Arc::new(
            (0..self.num_pes)
                .map(|_| PeRegion::new(layout.len(), self.heap_size))
                .collect::<Vec<_>>(),
        );
        Ok((0..self.num_pes)
            .map(|pe| {
                Arc::new(Comm::Threads(ThreadComm {
                    my_pe: pe,
                    num_pes: self.num_pes,
                    heap_size: self.heap_size,
                    regions: regions.clone(),
                }))
            })
            .collect())
    }
}
