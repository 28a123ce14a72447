use crate::lamellae::Backend;

/// A trait for accessing various data about the current lamellar envrionment
pub trait LamellarEnv {
    /// Return the PE id of the calling PE
    fn my_pe(&self) -> usize;

    /// Return the number of PEs in the execution
    fn num_pes(&self) -> usize;

    /// Return the number of threads per PE
    fn num_threads_per_pe(&self) -> usize;

    /// Return the backend moving data between the PEs
    fn backend(&self) -> Backend;
}
