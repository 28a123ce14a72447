use super::comm::{check_bounds, check_pe, Comm, CommError, CommInfo, CommRdma, CommResult, WordLayout};
use super::{Backend, LamellaeInit};

use shared_memory::{Shmem, ShmemConf, ShmemError};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HEADER_WORDS: usize = 2;
const HEADER_LEN: usize = HEADER_WORDS * std::mem::size_of::<usize>();
const READY_TAG: usize = 0x4c41_4d45_4c4c_4152;
const RETIRED_TAG: usize = usize::MAX;

struct MyShmem {
    data: *mut u8,
    len: usize,
    _shmem: Shmem,
}
unsafe impl Sync for MyShmem {}
unsafe impl Send for MyShmem {}

impl MyShmem {
    fn as_ptr(&self) -> *mut u8 {
        self.data
    }
    fn len(&self) -> usize {
        self.len
    }
}

fn ready_tag(job_id: usize) -> usize {
    READY_TAG ^ job_id
}

fn timed_out(start: Instant, timeout: f64) -> bool {
    timeout > 0.0 && start.elapsed().as_secs_f64() > timeout
}

/// `[0]` ready tag, `[1]` pid of the creating process
fn header(m: &Shmem) -> &[AtomicUsize; HEADER_WORDS] {
    // the mapping is page aligned and at least HEADER_LEN bytes long
    unsafe { &*(m.as_ptr() as *const [AtomicUsize; HEADER_WORDS]) }
}

fn process_alive(pid: usize) -> bool {
    let pid = pid as libc::pid_t;
    if pid <= 0 {
        return false;
    }
    // signal 0 only checks that the process exists
    (unsafe { libc::kill(pid, 0) == 0 })
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// What a joining PE found in the header of the segment it opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    /// the creator has not published the segment yet
    Pending,
    /// published by a live creator
    Ready,
    /// left over by a dead run or retired by a new creator, reopen by name
    Stale,
}

fn segment_state(m: &Shmem, job_id: usize) -> SegmentState {
    let [tag, pid] = header(m);
    match tag.load(Ordering::SeqCst) {
        RETIRED_TAG => SegmentState::Stale,
        t if t == ready_tag(job_id) => {
            if process_alive(pid.load(Ordering::SeqCst)) {
                SegmentState::Ready
            } else {
                SegmentState::Stale
            }
        }
        _ => SegmentState::Pending,
    }
}

/// Create a fresh segment, retiring and unlinking one left behind by an earlier run under the same name
fn create_segment(shmem_id: &str, size: usize) -> CommResult<Shmem> {
    match ShmemConf::new().size(size).os_id(shmem_id).create() {
        Ok(m) => Ok(m),
        Err(ShmemError::LinkExists) | Err(ShmemError::MappingIdExists) => {
            tracing::debug!("replacing leftover segment {:?}", shmem_id);
            let mut stale = ShmemConf::new().os_id(shmem_id).open()?;
            if stale.len() >= HEADER_LEN {
                header(&stale)[0].store(RETIRED_TAG, Ordering::SeqCst);
            }
            stale.set_owner(true);
            drop(stale);
            Ok(ShmemConf::new().size(size).os_id(shmem_id).create()?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Open the segment published by the creator, skipping over stale ones
fn join_segment(shmem_id: &str, job_id: usize, timeout: f64) -> CommResult<Shmem> {
    let start = Instant::now();
    loop {
        match ShmemConf::new().os_id(shmem_id).open() {
            Ok(m) => loop {
                match segment_state(&m, job_id) {
                    SegmentState::Ready => return Ok(m),
                    SegmentState::Stale => break,
                    SegmentState::Pending => {
                        if timed_out(start, timeout) {
                            return Err(CommError::AttachTimeout(shmem_id.to_owned()));
                        }
                        std::thread::yield_now();
                    }
                }
            },
            Err(e) => {
                tracing::trace!("waiting for {:?}: {}", shmem_id, e);
            }
        }
        if timed_out(start, timeout) {
            tracing::error!("unable to attach to {:?}", shmem_id);
            return Err(CommError::AttachTimeout(shmem_id.to_owned()));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Attach to (pe 0: create) the segment shared by every PE of the job.
///
/// The creator zeroes the segment and then publishes its pid and the ready tag in the header,
/// everyone else waits for that tag from a live creator before touching the segment.
fn attach_to_shmem(size: usize, job_id: usize, create: bool, timeout: f64) -> CommResult<MyShmem> {
    let size = size + HEADER_LEN;
    let shmem_id = format!("/lamellar_kernels_{}_{}", job_id, size);
    let m = if create {
        create_segment(&shmem_id, size)?
    } else {
        join_segment(&shmem_id, job_id, timeout)?
    };
    if m.len() < size {
        return Err(CommError::OutOfBounds {
            offset: 0,
            len: size,
            heap_size: m.len(),
        });
    }
    if create {
        unsafe {
            std::ptr::write_bytes(m.as_ptr().add(HEADER_LEN), 0, size - HEADER_LEN);
        }
        let [tag, pid] = header(&m);
        pid.store(std::process::id() as usize, Ordering::SeqCst);
        tag.store(ready_tag(job_id), Ordering::SeqCst);
        tracing::debug!("created {:?}", shmem_id);
    } else {
        tracing::debug!("attached {:?}", shmem_id);
    }
    let data = unsafe { m.as_ptr().add(HEADER_LEN) };
    Ok(MyShmem {
        data,
        len: size - HEADER_LEN,
        _shmem: m,
    })
}

/// One PE of a group whose PEs are processes on the same node.
///
/// The segment holds one region per PE, each region is the word array followed by the heap.
pub(crate) struct ShmemComm {
    shmem: MyShmem,
    my_pe: usize,
    num_pes: usize,
    heap_size: usize,
    num_words: usize,
    region_size: usize,
}

impl std::fmt::Debug for ShmemComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ShmemComm {{ my_pe: {}, num_pes: {}, heap_size: {}, segment: {} }}",
            self.my_pe,
            self.num_pes,
            self.heap_size,
            self.shmem.len()
        )
    }
}

impl ShmemComm {
    pub(crate) fn new(
        my_pe: usize,
        num_pes: usize,
        job_id: usize,
        heap_size: usize,
        timeout: f64,
    ) -> CommResult<ShmemComm> {
        check_pe(my_pe, num_pes)?;
        let num_words = WordLayout::new(num_pes).len();
        let words_len = num_words * std::mem::size_of::<AtomicUsize>();
        let align = std::mem::align_of::<AtomicUsize>();
        let region_size = (words_len + heap_size + align - 1) / align * align;
        let shmem = attach_to_shmem(region_size * num_pes, job_id, my_pe == 0, timeout)?;
        Ok(ShmemComm {
            shmem,
            my_pe,
            num_pes,
            heap_size,
            num_words,
            region_size,
        })
    }

    fn region(&self, pe: usize) -> *mut u8 {
        unsafe { self.shmem.as_ptr().add(pe * self.region_size) }
    }

    fn heap(&self, pe: usize) -> *mut u8 {
        unsafe {
            self.region(pe)
                .add(self.num_words * std::mem::size_of::<AtomicUsize>())
        }
    }

    fn word_ref(&self, pe: usize, index: usize) -> &AtomicUsize {
        assert!(index < self.num_words, "word index {} out of range", index);
        unsafe { &*(self.region(pe) as *const AtomicUsize).add(index) }
    }
}

impl CommInfo for ShmemComm {
    fn my_pe(&self) -> usize {
        self.my_pe
    }
    fn num_pes(&self) -> usize {
        self.num_pes
    }
    fn backend(&self) -> Backend {
        Backend::Shmem
    }
}

impl CommRdma for ShmemComm {
    fn heap_size(&self) -> usize {
        self.heap_size
    }
    fn put(&self, pe: usize, offset: usize, src: &[u8]) -> CommResult<()> {
        check_pe(pe, self.num_pes)?;
        check_bounds(offset, src.len(), self.heap_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.heap(pe).add(offset), src.len());
        }
        Ok(())
    }
    fn get_local(&self, offset: usize, dst: &mut [u8]) -> CommResult<()> {
        check_bounds(offset, dst.len(), self.heap_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.heap(self.my_pe).add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }
    fn put_word(&self, pe: usize, index: usize, val: usize) {
        assert!(pe < self.num_pes, "invalid pe {}", pe);
        self.word_ref(pe, index).store(val, Ordering::SeqCst);
    }
    fn word(&self, index: usize) -> usize {
        self.word_ref(self.my_pe, index).load(Ordering::SeqCst)
    }
}

pub(crate) struct ShmemBuilder {
    my_pe: usize,
    num_pes: usize,
    job_id: usize,
    heap_size: usize,
    timeout: f64,
}

impl ShmemBuilder {
    pub(crate) fn new(
        my_pe: usize,
        num_pes: usize,
        job_id: usize,
        heap_size: usize,
        timeout: f64,
    ) -> ShmemBuilder {
        ShmemBuilder {
            my_pe,
            num_pes,
            job_id,
            heap_size,
            timeout,
        }
    }
}

impl LamellaeInit for ShmemBuilder {
    fn init_fabric(&mut self) -> (usize, usize) {
        (self.my_pe, self.num_pes)
    }
    fn init_comms(&mut self) -> CommResult<Vec<Arc<Comm>>> {
        let comm = ShmemComm::new(
            self.my_pe,
            self.num_pes,
            self.job_id,
            self.heap_size,
            self.timeout,
        )?;
        Ok(vec![Arc::new(Comm::Shmem(comm))])
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    fn exited_pid() -> usize {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        child.id() as usize
    }

    /// Leave a published segment behind, as a run that crashed before unlinking it would
    fn leave_segment(job_id: usize, size: usize, creator_pid: usize) {
        let size = size + HEADER_LEN;
        let shmem_id = format!("/lamellar_kernels_{}_{}", job_id, size);
        let mut m = ShmemConf::new().size(size).os_id(&shmem_id).create().unwrap();
        let [tag, pid] = header(&m);
        pid.store(creator_pid, Ordering::SeqCst);
        tag.store(ready_tag(job_id), Ordering::SeqCst);
        m.set_owner(false);
    }

    #[test]
    fn joiner_ignores_leftover_of_dead_run() {
        let job_id = rand::random::<u32>() as usize;
        leave_segment(job_id, 64, exited_pid());
        assert!(matches!(
            attach_to_shmem(64, job_id, false, 0.2),
            Err(CommError::AttachTimeout(_))
        ));

        let joiner = std::thread::spawn(move || attach_to_shmem(64, job_id, false, 10.0).ok());
        std::thread::sleep(Duration::from_millis(50));
        let creator = attach_to_shmem(64, job_id, true, 10.0).unwrap();
        let joiner = joiner.join().unwrap().unwrap();
        unsafe {
            *creator.as_ptr().add(7) = 42;
            assert_eq!(*joiner.as_ptr().add(7), 42);
        }
    }

    #[test]
    fn creator_replaces_leftover_segment() {
        let job_id = rand::random::<u32>() as usize;
        leave_segment(job_id, 32, std::process::id() as usize);
        let creator = attach_to_shmem(32, job_id, true, 1.0).unwrap();
        let joiner = attach_to_shmem(32, job_id, false, 1.0).unwrap();
        unsafe {
            assert_eq!(*joiner.as_ptr(), 0);
            *creator.as_ptr() = 9;
            assert_eq!(*joiner.as_ptr(), 9);
        }
    }
}
