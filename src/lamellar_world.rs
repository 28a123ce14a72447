use crate::barrier::{Barrier, PeAborted};
use crate::config;
use crate::kernel::KernelMode;
use crate::lamellae::comm::{Comm, CommError, CommInfo, CommResult};
use crate::lamellae::{create_lamellae, Backend, LamellaeInit};
use crate::lamellar_env::LamellarEnv;
use crate::placement::bind_to_core;

use tracing::*;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// An abstraction representing one PE's view of all the PE's (processing elements) within a given distributed execution.
///
/// A LamellarWorld owns the communication handle of its PE, the barrier shared with the other PEs,
/// and the worker pool its kernels run on.
/// Collective operations (barriers and gathers) must be called by every PE in the same order.
pub struct LamellarWorld {
    my_pe: usize,
    num_pes: usize,
    pub(crate) comm: Arc<Comm>,
    barrier: Barrier,
    pool: Arc<rayon::ThreadPool>,
    kernel_mode: KernelMode,
}

impl std::fmt::Debug for LamellarWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LamellarWorld")
            .field("my_pe", &self.my_pe)
            .field("num_pes", &self.num_pes)
            .field("comm", &self.comm)
            .field("threads", &self.pool.current_num_threads())
            .field("kernel_mode", &self.kernel_mode)
            .finish()
    }
}

impl LamellarWorld {
    /// Returns the id of this PE (roughly equivalent to MPI Rank)
    ///
    /// # Examples
    ///```
    /// let my_pe = world.my_pe();
    ///```
    pub fn my_pe(&self) -> usize {
        self.my_pe
    }

    /// Returns nummber of PE's in this execution
    ///
    /// # Examples
    ///```
    /// let num_pes = world.num_pes();
    ///```
    pub fn num_pes(&self) -> usize {
        self.num_pes
    }

    /// Block until every PE has entered the barrier
    #[tracing::instrument(skip_all)]
    pub fn barrier(&self) {
        self.barrier.barrier();
    }

    /// Run `op` on this PE's worker pool, kernels called with [KernelMode::Parallel] inside `op` use its threads
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// The kernel mode selected with `LAMELLAR_PARALLEL_KERNEL`
    pub fn kernel_mode(&self) -> KernelMode {
        self.kernel_mode
    }
}

impl LamellarEnv for LamellarWorld {
    fn my_pe(&self) -> usize {
        self.my_pe
    }
    fn num_pes(&self) -> usize {
        self.num_pes
    }
    fn num_threads_per_pe(&self) -> usize {
        self.pool.current_num_threads()
    }
    fn backend(&self) -> Backend {
        self.comm.backend()
    }
}

/// An implementation of the Builder design pattern, used to construct LamellarWorlds.
///
/// Every setting defaults to the corresponding `LAMELLAR_*` environment variable.
///
/// # Examples
///
///```
/// use lamellar_kernels::{LamellarWorldBuilder,Backend};
///
/// let results = LamellarWorldBuilder::new()
///                             .with_lamellae(Backend::Threads)
///                             .with_num_pes(4)
///                             .launch(|world| world.my_pe())?;
///```
#[derive(Debug, Clone)]
pub struct LamellarWorldBuilder {
    primary_lamellae: Backend,
    num_pes: usize,
    threads: usize,
    kernel_mode: KernelMode,
    bind_cores: bool,
    heap_size: usize,
}

impl Default for LamellarWorldBuilder {
    fn default() -> Self {
        LamellarWorldBuilder::new()
    }
}

impl LamellarWorldBuilder {
    /// Construct a new lamellar world builder
    #[tracing::instrument(skip_all)]
    pub fn new() -> LamellarWorldBuilder {
        LamellarWorldBuilder {
            primary_lamellae: Default::default(),
            num_pes: config().num_pes,
            threads: config().threads,
            kernel_mode: KernelMode::from_flag(config().parallel_kernel),
            bind_cores: config().bind_cores,
            heap_size: config().heap_size,
        }
    }

    /// Specify the lamellae backend to use for this execution
    pub fn with_lamellae(mut self, lamellae: Backend) -> LamellarWorldBuilder {
        self.primary_lamellae = lamellae;
        self
    }

    /// Number of PEs for the threads and shmem backends, the local backend always has one
    pub fn with_num_pes(mut self, num_pes: usize) -> LamellarWorldBuilder {
        self.num_pes = num_pes;
        self
    }

    /// Worker threads per PE
    pub fn with_threads(mut self, threads: usize) -> LamellarWorldBuilder {
        self.threads = threads.max(1);
        self
    }

    pub fn with_kernel_mode(mut self, kernel_mode: KernelMode) -> LamellarWorldBuilder {
        self.kernel_mode = kernel_mode;
        self
    }

    /// Pin every PE and its workers to cores, worker `i` of PE `p` takes core `(p * threads + i) % cores`
    pub fn with_core_binding(mut self, bind_cores: bool) -> LamellarWorldBuilder {
        self.bind_cores = bind_cores;
        self
    }

    /// Per PE bytes available to stage gathers
    pub fn with_heap_size(mut self, heap_size: usize) -> LamellarWorldBuilder {
        self.heap_size = heap_size;
        self
    }

    fn create_worlds(&self) -> CommResult<Vec<LamellarWorld>> {
        let num_pes = match self.primary_lamellae {
            Backend::Local => 1,
            _ => self.num_pes,
        };
        if num_pes == 0 || self.heap_size / num_pes == 0 {
            return Err(CommError::HeapTooSmall {
                heap_size: self.heap_size,
                num_pes,
            });
        }
        let mut lamellae_builder = create_lamellae(self.primary_lamellae, num_pes, self.heap_size);
        let (my_pe, num_pes) = lamellae_builder.init_fabric();
        debug!(
            "initializing {:?} backend, first local pe {} of {}",
            self.primary_lamellae, my_pe, num_pes
        );
        let comms = lamellae_builder.init_comms()?;
        comms
            .into_iter()
            .map(|comm| -> CommResult<LamellarWorld> {
                let pe = comm.my_pe();
                let (threads, bind_cores) = (self.threads, self.bind_cores);
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(move |i| format!("lamellar-pe{}-worker{}", pe, i))
                    .start_handler(move |i| {
                        if bind_cores {
                            bind_to_core(pe * threads + i);
                        }
                    })
                    .build()?;
                Ok(LamellarWorld {
                    my_pe: pe,
                    num_pes: comm.num_pes(),
                    barrier: Barrier::new(comm.clone()),
                    comm,
                    pool: Arc::new(pool),
                    kernel_mode: self.kernel_mode,
                })
            })
            .collect()
    }

    /// Instantiate the LamellarWorld of the single PE hosted by this process.
    ///
    /// Backends that host several PEs in one process (threads) must use [launch][LamellarWorldBuilder::launch].
    #[tracing::instrument(skip_all)]
    pub fn build(self) -> CommResult<LamellarWorld> {
        let mut worlds = self.create_worlds()?;
        if worlds.len() != 1 {
            return Err(CommError::RequiresLaunch);
        }
        let world = worlds.remove(0);
        if self.bind_cores {
            bind_to_core(world.my_pe() * self.threads);
        }
        world.barrier();
        Ok(world)
    }

    /// Run `f` once for every PE hosted by this process and return the results ordered by pe id.
    ///
    /// Every PE enters a barrier before and after `f`. When `f` panics on some PE, the other PEs
    /// unwind out of their next barrier and the first panic is resumed on the calling thread.
    #[tracing::instrument(skip_all)]
    pub fn launch<F, R>(self, f: F) -> CommResult<Vec<R>>
    where
        F: Fn(&LamellarWorld) -> R + Sync,
        R: Send,
    {
        let worlds = self.create_worlds()?;
        let bind_cores = self.bind_cores;
        let threads = self.threads;
        let run_pe = |world: LamellarWorld| {
            if bind_cores {
                bind_to_core(world.my_pe() * threads);
            }
            let res = panic::catch_unwind(AssertUnwindSafe(|| {
                world.barrier();
                let res = f(&world);
                world.barrier();
                res
            }));
            if res.is_err() {
                error!("pe {} panicked, aborting the group", world.my_pe());
                world.barrier.abort();
            }
            res
        };
        let results = if worlds.len() == 1 {
            worlds.into_iter().map(run_pe).collect::<Vec<_>>()
        } else {
            std::thread::scope(|s| -> CommResult<Vec<_>> {
                let mut handles = Vec::with_capacity(worlds.len());
                for world in worlds {
                    let run_pe = &run_pe;
                    let handle = std::thread::Builder::new()
                        .name(format!("lamellar-pe-{}", world.my_pe()))
                        .spawn_scoped(s, move || run_pe(world))
                        .map_err(CommError::Spawn)?;
                    handles.push(handle);
                }
                Ok(handles
                    .into_iter()
                    .map(|handle| handle.join().and_then(|res| res))
                    .collect::<Vec<_>>())
            })?
        };
        if results.iter().any(|res| res.is_err()) {
            let mut panics = results.into_iter().filter_map(|res| res.err()).collect::<Vec<_>>();
            // resume the panic that started the abort, not one of the PeAborted it caused
            let first = panics
                .iter()
                .position(|p| p.downcast_ref::<PeAborted>().is_none())
                .unwrap_or(0);
            panic::resume_unwind(panics.swap_remove(first));
        }
        Ok(results.into_iter().filter_map(|res| res.ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn with_timeout<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv_timeout(Duration::from_secs(60))
            .expect("launch did not finish")
    }

    fn builder(backend: Backend, num_pes: usize) -> LamellarWorldBuilder {
        LamellarWorldBuilder::new()
            .with_lamellae(backend)
            .with_num_pes(num_pes)
            .with_threads(2)
            .with_heap_size(4096)
    }

    #[test]
    fn launch_orders_results_by_pe() {
        let results = builder(Backend::Threads, 4)
            .launch(|world| (world.my_pe(), world.num_pes()))
            .unwrap();
        assert_eq!(results, vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    }

    #[test]
    fn local_world_has_one_pe() {
        let world = builder(Backend::Local, 8).build().unwrap();
        assert_eq!(world.my_pe(), 0);
        assert_eq!(world.num_pes(), 1);
        assert_eq!(world.backend(), Backend::Local);
        assert_eq!(world.num_threads_per_pe(), 2);
        world.barrier();
    }

    #[test]
    fn threads_backend_requires_launch() {
        assert!(matches!(
            builder(Backend::Threads, 3).build(),
            Err(CommError::RequiresLaunch)
        ));
    }

    #[test]
    fn heap_must_cover_every_pe() {
        assert!(matches!(
            builder(Backend::Threads, 8).with_heap_size(4).launch(|_| ()),
            Err(CommError::HeapTooSmall { .. })
        ));
    }

    #[test]
    fn install_uses_the_pe_pool() {
        let results = builder(Backend::Threads, 2)
            .with_threads(3)
            .launch(|world| world.install(rayon::current_num_threads))
            .unwrap();
        assert_eq!(results, vec![3, 3]);
    }

    #[test]
    fn panic_on_one_pe_reaches_the_caller() {
        let res = with_timeout(|| {
            panic::catch_unwind(|| {
                builder(Backend::Threads, 2)
                    .launch(|world| {
                        if world.my_pe() == 1 {
                            panic!("pe 1 failed");
                        }
                        world.barrier();
                        world.my_pe()
                    })
                    .map_err(|e| e.to_string())
            })
        });
        let payload = res.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"pe 1 failed"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn core_binding_pins_pes_and_workers() {
        use crate::placement::{core_ids, current_cpu};

        let results = with_timeout(|| {
            builder(Backend::Threads, 2)
                .with_threads(1)
                .with_core_binding(true)
                .launch(|world| (current_cpu(), world.install(current_cpu)))
                .map_err(|e| e.to_string())
        })
        .unwrap();
        let cores = core_ids();
        for (pe, (pe_cpu, worker_cpu)) in results.into_iter().enumerate() {
            let expected = cores[pe % cores.len()].id as i32;
            assert_eq!(pe_cpu, expected, "pe {}", pe);
            assert_eq!(worker_cpu, expected, "worker of pe {}", pe);
        }
    }
}
