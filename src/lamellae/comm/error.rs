/// Errors raised while setting up a backend or moving data between PEs
#[derive(Debug)]
pub enum CommError {
    /// a pe id outside `0..num_pes`
    InvalidPe { pe: usize, num_pes: usize },
    /// an access past the end of a PE heap
    OutOfBounds {
        offset: usize,
        len: usize,
        heap_size: usize,
    },
    /// the heap cannot hold one byte per PE
    HeapTooSmall { heap_size: usize, num_pes: usize },
    /// a PE contributed a different number of elements than its block
    CountMismatch {
        pe: usize,
        expected: usize,
        found: usize,
    },
    /// a decomposition built for a different number of PEs
    DecompositionMismatch { expected: usize, found: usize },
    /// the backend can only be started through `LamellarWorldBuilder::launch`
    RequiresLaunch,
    Serialization(bincode::Error),
    Shmem(shared_memory::ShmemError),
    AttachTimeout(String),
    Spawn(std::io::Error),
    ThreadPool(rayon::ThreadPoolBuildError),
}

impl std::fmt::Display for CommError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CommError::InvalidPe { pe, num_pes } => {
                write!(f, "invalid pe {} (num_pes: {})", pe, num_pes)
            }
            CommError::OutOfBounds {
                offset,
                len,
                heap_size,
            } => write!(
                f,
                "access of {} bytes at offset {} exceeds heap of {} bytes",
                len, offset, heap_size
            ),
            CommError::HeapTooSmall { heap_size, num_pes } => write!(
                f,
                "heap of {} bytes is too small for {} pes, increase LAMELLAR_HEAP_SIZE",
                heap_size, num_pes
            ),
            CommError::CountMismatch {
                pe,
                expected,
                found,
            } => write!(
                f,
                "pe {} contributed {} elements but its block holds {}",
                pe, found, expected
            ),
            CommError::DecompositionMismatch { expected, found } => write!(
                f,
                "decomposition describes {} pes but the world has {}",
                found, expected
            ),
            CommError::RequiresLaunch => {
                write!(f, "the threads backend must be started with launch()")
            }
            CommError::Serialization(e) => write!(f, "serialization error: {}", e),
            CommError::Shmem(e) => write!(f, "shared memory error: {}", e),
            CommError::AttachTimeout(id) => {
                write!(f, "timed out waiting for shared memory segment {}", id)
            }
            CommError::Spawn(e) => write!(f, "unable to spawn pe thread: {}", e),
            CommError::ThreadPool(e) => write!(f, "unable to build worker pool: {}", e),
        }
    }
}

impl std::error::Error for CommError {}

impl From<bincode::Error> for CommError {
    fn from(e: bincode::Error) -> Self {
        CommError::Serialization(e)
    }
}

impl From<shared_memory::ShmemError> for CommError {
    fn from(e: shared_memory::ShmemError) -> Self {
        CommError::Shmem(e)
    }
}

impl From<rayon::ThreadPoolBuildError> for CommError {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        CommError::ThreadPool(e)
    }
}

pub type CommResult<T> = Result<T, CommError>;
