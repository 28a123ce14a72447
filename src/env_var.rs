use std::sync::OnceLock;

use serde::Deserialize;

use crate::bench::MismatchPolicy;
use crate::decomposition::RemainderPolicy;
use crate::lamellae::Backend;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_backend() -> Backend {
    Backend::Local
}

fn default_num_pes() -> usize {
    1
}

fn default_threads() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.into(),
        Err(_) => 4,
    }
}

fn default_parallel_kernel() -> bool {
    true
}

fn default_heap_size() -> usize {
    8 * 1024 * 1024
}

fn default_matvec_n() -> usize {
    4 * 15360
}

fn default_remainder() -> RemainderPolicy {
    RemainderPolicy::Drop
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// A general timeout in seconds after which a PE stuck in a barrier reports a potential deadlock, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// The lamellae backend to use
    /// local -- single pe execution (default)
    /// threads -- multi pe execution, one thread per pe inside this process
    /// shmem -- multi pe single node execution, one process per pe
    #[serde(default = "default_backend")]
    pub backend: Backend, //local,threads,shmem

    /// Number of PEs for the threads and shmem backends, default: 1
    #[serde(default = "default_num_pes")]
    pub num_pes: usize,
    /// Id of this process, set by the launcher for the shmem backend
    pub pe_id: Option<usize>,
    /// Shared memory key for the shmem backend, set by the launcher
    pub job_id: Option<usize>,

    /// Worker threads available to each PE for the intra-pe kernel
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Run the local kernels on the worker pool (true) or on the calling thread (false), default: true
    #[serde(default = "default_parallel_kernel")]
    pub parallel_kernel: bool,
    /// Pin each PE to a core (pe % cores), default: false
    #[serde(default)]
    pub bind_cores: bool,

    /// Size in bytes of the per-PE heap used to stage gathers, default: 8MB
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,

    /// Global matrix size for the matvec benchmark, default: 61440
    #[serde(default = "default_matvec_n")]
    pub matvec_n: usize,
    /// What to do when there are more workers than elements, each benchmark supplies its own default
    pub on_config_mismatch: Option<MismatchPolicy>,
    /// Thread counts the dot benchmark sweeps over, comma separated, e.g. `1,2,4,8`
    pub sweep_threads: Option<Vec<usize>>,
    /// What to do with the rows left over when the matrix size is not a multiple of the number of PEs
    #[serde(default = "default_remainder")]
    pub remainder: RemainderPolicy,
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("LAMELLAR_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
