//! Single PE dot product of two vectors, run on the PE's worker pool.

use crate::bench::MismatchPolicy;
use crate::config;
use crate::kernel::{dot_product, fill_vectors, FillType, KernelMode};
use crate::lamellar_env::LamellarEnv;
use crate::{Backend, LamellarWorld, LamellarWorldBuilder};

use anyhow::Context;

use std::time::Instant;

pub const DEFAULT_NUM_ELEMENTS: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotSettings {
    pub num_elements: usize,
    pub fill: FillType,
    pub on_config_mismatch: MismatchPolicy,
    /// run once per thread count and report parallel efficiency, see [run_dot_sweep]
    pub sweep_threads: Option<Vec<usize>>,
}

impl Default for DotSettings {
    fn default() -> Self {
        DotSettings {
            num_elements: DEFAULT_NUM_ELEMENTS,
            fill: FillType::Random,
            on_config_mismatch: MismatchPolicy::Abort,
            sweep_threads: None,
        }
    }
}

impl DotSettings {
    /// `[num_elements] [rnd|seq|uni]`, program name already stripped
    pub fn from_args<I, S>(args: I) -> anyhow::Result<DotSettings>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut settings = DotSettings {
            on_config_mismatch: config()
                .on_config_mismatch
                .unwrap_or(MismatchPolicy::Abort),
            sweep_threads: config().sweep_threads.clone(),
            ..Default::default()
        };
        let mut args = args.into_iter();
        if let Some(num_elements) = args.next() {
            let num_elements = num_elements.as_ref();
            settings.num_elements = num_elements
                .parse()
                .with_context(|| format!("invalid number of elements {:?}", num_elements))?;
        }
        if let Some(fill) = args.next() {
            settings.fill = fill.as_ref().parse()?;
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DotReport {
    pub threads: usize,
    pub fill_seconds: f64,
    pub dot_seconds: f64,
    pub result: f64,
}

#[tracing::instrument(skip_all)]
pub fn run_dot(world: &LamellarWorld, settings: &DotSettings) -> anyhow::Result<DotReport> {
    let mode = world.kernel_mode();
    let threads = match mode {
        KernelMode::Parallel => world.num_threads_per_pe(),
        KernelMode::Serial => 1,
    };
    println!();
    println!("### Running with {} thread(s)", threads);
    if let Err(e) = settings
        .on_config_mismatch
        .check("threads", threads, settings.num_elements)
    {
        println!("### Error: number of elements is less than the number of threads");
        return Err(e.into());
    }

    let mut v1 = vec![0.0; settings.num_elements];
    let mut v2 = vec![0.0; settings.num_elements];
    println!("### Population type: {}", settings.fill);
    let fill_seconds = world.install(|| fill_vectors(&mut v1, &mut v2, settings.fill, mode));
    println!("### Vector population time: {} seconds", fill_seconds);

    let timer = Instant::now();
    let result = world.install(|| dot_product(&v1, &v2, mode));
    let dot_seconds = timer.elapsed().as_secs_f64();
    println!("### Dot-product time: {} seconds", dot_seconds);
    println!("### Result: {}", result);
    println!();

    Ok(DotReport {
        threads,
        fill_seconds,
        dot_seconds,
        result,
    })
}

/// Efficiency below this fraction of the ideal ends the scalable range of a sweep
pub const EFFICIENCY_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    pub threads: usize,
    pub dot_seconds: f64,
    /// `(t_0 * p_0) / (t * p)` relative to the first point of the sweep
    pub efficiency: f64,
}

/// Parallel efficiency of every `(threads, seconds)` measurement relative to the first one.
///
/// A zero time (too few elements for the timer) counts as perfectly efficient.
pub fn parallel_efficiency(times: &[(usize, f64)]) -> Vec<SweepPoint> {
    let reference = match times.first() {
        Some((threads, seconds)) => *threads as f64 * seconds,
        None => return Vec::new(),
    };
    times
        .iter()
        .map(|&(threads, dot_seconds)| {
            let cost = threads as f64 * dot_seconds;
            let efficiency = if cost > 0.0 { reference / cost } else { 1.0 };
            SweepPoint {
                threads,
                dot_seconds,
                efficiency,
            }
        })
        .collect()
}

/// The largest thread count reached before the efficiency first drops under [EFFICIENCY_THRESHOLD]
pub fn best_thread_count(points: &[SweepPoint]) -> Option<usize> {
    let mut best = points.first()?;
    for point in &points[1..] {
        if point.efficiency < EFFICIENCY_THRESHOLD {
            break;
        }
        best = point;
    }
    Some(best.threads)
}

/// Run [run_dot] on a fresh single PE world for every thread count in `thread_counts`.
#[tracing::instrument(skip_all)]
pub fn run_dot_sweep(
    settings: &DotSettings,
    thread_counts: &[usize],
) -> anyhow::Result<Vec<SweepPoint>> {
    anyhow::ensure!(!thread_counts.is_empty(), "no thread counts to sweep");
    let mut times = Vec::with_capacity(thread_counts.len());
    for &threads in thread_counts {
        let world = LamellarWorldBuilder::new()
            .with_lamellae(Backend::Local)
            .with_threads(threads)
            .with_kernel_mode(KernelMode::Parallel)
            .build()?;
        let report = run_dot(&world, settings)
            .with_context(|| format!("sweep step with {} thread(s)", threads))?;
        times.push((report.threads, report.dot_seconds));
    }
    let points = parallel_efficiency(&times);
    println!("### Thread sweep");
    for point in &points {
        println!(
            "### threads: {} time: {} seconds efficiency: {:.3}",
            point.threads, point.dot_seconds, point.efficiency
        );
    }
    if let Some(best) = best_thread_count(&points) {
        println!("### Best thread count: {}", best);
    }
    Ok(points)
}
