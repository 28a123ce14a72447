use super::comm::{check_pe, Comm, CommInfo, CommRdma, CommResult, WordLayout};
use super::thread_lamellae::PeRegion;
use super::{Backend, LamellaeInit};

use std::sync::Arc;

/// The single PE of a one-process, one-PE execution
pub(crate) struct LocalComm {
    heap_size: usize,
    region: PeRegion,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Local")
    }
}

impl LocalComm {
    pub(crate) fn new(heap_size: usize) -> LocalComm {
        LocalComm {
            heap_size,
            region: PeRegion::new(WordLayout::new(1).len(), heap_size),
        }
    }
}

impl CommInfo for LocalComm {
    fn my_pe(&self) -> usize {
        0
    }
    fn num_pes(&self) -> usize {
        1
    }
    fn backend(&self) -> Backend {
        Backend::Local
    }
}

impl CommRdma for LocalComm {
    fn heap_size(&self) -> usize {
        self.heap_size
    }
    fn put(&self, pe: usize, offset: usize, src: &[u8]) -> CommResult<()> {
        check_pe(pe, 1)?;
        self.region.put(offset, src)
    }
    fn get_local(&self, offset: usize, dst: &mut [u8]) -> CommResult<()> {
        self.region.get(offset, dst)
    }
    fn put_word(&self, _pe: usize, index: usize, val: usize) {
        self.region.put_word(index, val);
    }
    fn word(&self, index: usize) -> usize {
        self.region.word(index)
    }
}

pub(crate) struct LocalBuilder {
    heap_size: usize,
}

impl LocalBuilder {
    pub(crate) fn new(heap_size: usize) -> LocalBuilder {
        LocalBuilder { heap_size }
    }
}

impl LamellaeInit for LocalBuilder {
    fn init_fabric(&mut self) -> (usize, usize) {
        (0, 1)
    }
    fn init_comms(&mut self) -> CommResult<Vec<Arc<Comm>>> {
        Ok(vec![Arc::new(Comm::Local(LocalComm::new(self.heap_size)))])
    }
}
