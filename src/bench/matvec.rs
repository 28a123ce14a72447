//! Distributed dense matrix-vector multiply.
//!
//! Every PE builds and multiplies its own row block, the root gathers the pieces, checks them against
//! a serial reference, then checks that no two PEs on one host ran on the same CPU.

use crate::bench::MismatchPolicy;
use crate::config;
use crate::decomposition::{Decomposition, LocalOperands, RemainderPolicy};
use crate::kernel::{mat_vec, Elem};
use crate::lamellar_env::LamellarEnv;
use crate::placement::{verify_placement, DiagnosticsRecord, PlacementOutcome};
use crate::verify::{compute_reference, verify, VerificationOutcome};
use crate::warnings::RuntimeWarning;
use crate::LamellarWorld;

use anyhow::Context;

use std::time::Instant;

/// Global matrix size when `LAMELLAR_MATVEC_N` is not set
pub const DEFAULT_N: usize = 4 * 15360;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatvecSettings {
    pub n: usize,
    pub root: usize,
    pub on_config_mismatch: MismatchPolicy,
    pub remainder: RemainderPolicy,
}

impl Default for MatvecSettings {
    fn default() -> Self {
        MatvecSettings {
            n: DEFAULT_N,
            root: 0,
            on_config_mismatch: MismatchPolicy::Warn,
            remainder: RemainderPolicy::Drop,
        }
    }
}

impl MatvecSettings {
    pub fn from_config() -> MatvecSettings {
        MatvecSettings {
            n: config().matvec_n,
            root: 0,
            on_config_mismatch: config().on_config_mismatch.unwrap_or(MismatchPolicy::Warn),
            remainder: config().remainder,
        }
    }
}

/// What one PE knows at the end of a run, the root holds the outcomes
#[derive(Debug, Clone)]
pub struct MatvecReport {
    pub my_pe: usize,
    pub num_pes: usize,
    pub result: Option<Vec<Elem>>,
    pub verification: Option<VerificationOutcome>,
    pub placement: Option<PlacementOutcome>,
    /// seconds from the start of the fill to the end of the gather, root only
    pub elapsed: Option<f64>,
}

impl MatvecReport {
    /// False when the root saw a wrong result or a shared CPU
    pub fn ok(&self) -> bool {
        self.verification.as_ref().map_or(true, |v| v.ok())
            && self.placement.as_ref().map_or(true, |p| p.ok())
    }
}

#[tracing::instrument(skip_all)]
pub fn run_matvec(world: &LamellarWorld, settings: &MatvecSettings) -> anyhow::Result<MatvecReport> {
    let my_pe = world.my_pe();
    let num_pes = world.num_pes();
    let root = settings.root;
    let n = settings.n;
    let mode = world.kernel_mode();
    let is_root = my_pe == root;

    settings
        .on_config_mismatch
        .check("processes", num_pes, n)?;
    let decomp = Decomposition::block(n, num_pes, settings.remainder)?;
    if is_root {
        println!(
            "### Running with {} process(es), {} thread(s) each",
            num_pes,
            world.num_threads_per_pe()
        );
        println!("### Matrix size: {}", n);
        if n % num_pes != 0 {
            RuntimeWarning::UnevenPartition {
                len: n,
                num_pes,
                remainder: n % num_pes,
            }
            .print();
        }
    }
    let block = decomp
        .block_of(my_pe)
        .with_context(|| format!("no block for pe {}", my_pe))?;

    let t1 = Instant::now();
    let timer = Instant::now();
    let ops = world.install(|| LocalOperands::for_block(block, n, mode));
    let fill_time = timer.elapsed().as_secs_f64();
    let timer = Instant::now();
    let local = world.install(|| mat_vec(&ops.matrix, &ops.vector, mode));
    let compute_time = timer.elapsed().as_secs_f64();
    drop(ops);
    tracing::debug!(
        "[{}] rows {:?} fill {:.6}s compute {:.6}s",
        my_pe,
        block.range(),
        fill_time,
        compute_time
    );

    let result = world.gather_results(&local, &decomp, root)?;
    world.barrier();

    let mut elapsed = None;
    let verification = match &result {
        Some(result) => {
            let t2 = t1.elapsed().as_secs_f64();
            elapsed = Some(t2);
            println!("### Local fill time: {} seconds", fill_time);
            println!("### Local compute time: {} seconds", compute_time);
            let reference = world.install(|| compute_reference(n, mode));
            let outcome = verify(result, &reference);
            match &outcome.mismatch {
                None => println!("result OK"),
                Some(mismatch) => {
                    println!("{}", mismatch);
                    println!("ERROR: result is wrong in parallel");
                }
            }
            println!("time elapsed: {}", t2);
            Some(outcome)
        }
        None => None,
    };
    world.barrier();

    let record = DiagnosticsRecord::capture(my_pe);
    let diagnostics = world.gather_diagnostics(&record, root)?;
    world.barrier();

    let placement = diagnostics.map(|diagnostics| {
        let outcome = verify_placement(&diagnostics);
        for violation in &outcome.violations {
            println!("{}", violation);
        }
        if outcome.ok() {
            println!("scheduling OK");
        } else {
            println!(
                "ERROR: scheduling of the processes is wrong - at least 2 processes are running on the same CPU"
            );
        }
        outcome
    });
    world.barrier();

    Ok(MatvecReport {
        my_pe,
        num_pes,
        result,
        verification,
        placement,
        elapsed,
    })
}
