//! lamellar-kernels measures two basic numeric kernels, a vector dot product and a dense matrix-vector multiply,
//! within a single PE (processing element) and across several PEs.
//!
//! The distributed matrix-vector benchmark partitions the rows of the matrix over the PEs,
//! every PE fills and multiplies its own block, the partial results are gathered on a root PE
//! and checked against a serial reference, and finally the root checks that no two PEs on the same host were
//! scheduled on the same CPU.
//!
//! PEs communicate through Lamellae, the communication backends:
//! - "local": a single PE in the current process
//! - "threads": every PE is a thread of the current process, useful for testing multi PE code
//! - "shmem": every PE is a process on the same node, sharing a POSIX shared memory segment (see `lamellar_run.sh`)
//!
//! EXAMPLES
//! --------
//!
//! # Running the matvec benchmark on four PEs hosted as threads
//! ```
//! use lamellar_kernels::{Backend, LamellarWorldBuilder};
//! use lamellar_kernels::bench::matvec::{run_matvec, MatvecSettings};
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = MatvecSettings { n: 1024, ..Default::default() };
//!     let reports = LamellarWorldBuilder::new()
//!         .with_lamellae(Backend::Threads)
//!         .with_num_pes(4)
//!         .launch(|world| run_matvec(world, &settings))?;
//!     for report in reports {
//!         report?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Gathering a value from every PE
//! ```
//! let world = lamellar_kernels::LamellarWorldBuilder::new().build()?;
//! let all = world.gather(0, &world.my_pe())?; // Some(vec![..]) on pe 0, None elsewhere
//! ```
//!
//! Runtime behaviour is configured with `LAMELLAR_*` environment variables, see [Config].

pub mod bench;
pub mod collectives;
pub mod decomposition;
pub mod kernel;
pub mod placement;
pub mod verify;

mod barrier;
mod env_var;
mod lamellae;
mod lamellar_env;
mod lamellar_world;
mod warnings;

pub use crate::env_var::{config, Config};
pub use crate::lamellae::comm::{CommError, CommResult};
pub use crate::lamellae::Backend;
pub use crate::lamellar_env::LamellarEnv;
pub use crate::lamellar_world::{LamellarWorld, LamellarWorldBuilder};

#[doc(hidden)]
pub fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, bincode::Error>
where
    T: serde::Serialize,
{
    bincode::serialize(obj)
}

#[doc(hidden)]
pub fn deserialize<'a, T>(bytes: &'a [u8]) -> Result<T, bincode::Error>
where
    T: serde::Deserialize<'a>,
{
    bincode::deserialize(bytes)
}

/// Install a `tracing` subscriber writing to stderr, filtered by `RUST_LOG` (default: warn)
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();
}
