use crate::config;
use std::sync::Arc;

use enum_dispatch::enum_dispatch;

pub(crate) mod comm;
use comm::{Comm, CommResult};

pub(crate) mod local_lamellae;
use local_lamellae::LocalBuilder;

pub(crate) mod thread_lamellae;
use thread_lamellae::ThreadBuilder;

pub(crate) mod shmem_lamellae;
use shmem_lamellae::ShmemBuilder;

/// The list of available lamellae backends, used to specify how data is transfered between PEs
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The Local backend -- a single PE in this process
    Local,
    /// The Threads backend -- every PE is a thread of this process, intended for testing multi PE code
    Threads,
    /// The Shmem backend -- intended for multi process single node environments
    Shmem,
}

impl Default for Backend {
    fn default() -> Self {
        config().backend
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
            Backend::Threads => write!(f, "threads"),
            Backend::Shmem => write!(f, "shmem"),
        }
    }
}

#[enum_dispatch(LamellaeInit)]
pub(crate) enum LamellaeBuilder {
    LocalBuilder,
    ThreadBuilder,
    ShmemBuilder,
}

#[enum_dispatch]
pub(crate) trait LamellaeInit {
    fn init_fabric(&mut self) -> (usize, usize); //(my_pe,num_pes)
    /// one comm per PE hosted by this process, ordered by pe id
    fn init_comms(&mut self) -> CommResult<Vec<Arc<Comm>>>;
}

pub(crate) fn create_lamellae(backend: Backend, num_pes: usize, heap_size: usize) -> LamellaeBuilder {
    match backend {
        Backend::Local => LamellaeBuilder::LocalBuilder(LocalBuilder::new(heap_size)),
        Backend::Threads => LamellaeBuilder::ThreadBuilder(ThreadBuilder::new(num_pes, heap_size)),
        Backend::Shmem => {
            let my_pe = config().pe_id.unwrap_or(0);
            let job_id = config().job_id.unwrap_or(0);
            LamellaeBuilder::ShmemBuilder(ShmemBuilder::new(
                my_pe,
                num_pes,
                job_id,
                heap_size,
                config().deadlock_timeout,
            ))
        }
    }
}
