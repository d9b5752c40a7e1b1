//! GC measurement collection and benchmark summaries.
//!
//! The engine reports every measured GC event (collection, cascade decref,
//! physical release) to the thread's GC callback. [`GcStats`] is a callback
//! sink that accumulates those events; [`GcBenchmark`] wraps a test function
//! with one and aggregates statistics over repeated runs.
use crate::api;
use crate::region::RegionType;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// One measured GC event.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GcSample {
    pub duration_ns: u64,
    pub region_type: RegionType,
    pub bytes_before: usize,
    pub objects_before: usize,
}

/// Accumulator for GC events observed during one run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct GcStats {
    samples: Vec<GcSample>,
    total_ns: u64,
}

impl GcStats {
    pub fn record(&mut self, sample: GcSample) {
        self.total_ns += sample.duration_ns;
        self.samples.push(sample);
    }

    pub fn total_gc_time_ns(&self) -> u64 {
        self.total_ns
    }

    pub fn gc_count(&self) -> usize {
        self.samples.len()
    }

    pub fn gc_count_by_type(&self, region_type: RegionType) -> usize {
        self.samples
            .iter()
            .filter(|s| s.region_type == region_type)
            .count()
    }

    pub fn gc_time_by_type(&self, region_type: RegionType) -> u64 {
        self.samples
            .iter()
            .filter(|s| s.region_type == region_type)
            .map(|s| s.duration_ns)
            .sum()
    }

    pub fn samples(&self) -> &[GcSample] {
        &self.samples
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.total_ns = 0;
    }
}

/// Statistics of one benchmark run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RunResult {
    pub total_gc_time_ns: u64,
    pub gc_call_count: usize,
    pub average_gc_time_ns: u64,
    pub max_gc_time_ns: u64,
}

/// Harness for benchmarking GC performance across multiple runs.
#[derive(Default)]
pub struct GcBenchmark {
    runs: Vec<RunResult>,
    all_samples: Vec<GcSample>,
}

impl GcBenchmark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `test_fn` `runs` times (after `warmup_runs` unrecorded warmups),
    /// collecting every GC event the runs produce on this thread.
    pub fn run_benchmark(&mut self, mut test_fn: impl FnMut(), runs: usize, warmup_runs: usize) {
        for _ in 0..warmup_runs {
            collect_run(&mut test_fn);
        }
        for _ in 0..runs {
            let stats = collect_run(&mut test_fn);
            let max = stats
                .samples()
                .iter()
                .map(|s| s.duration_ns)
                .max()
                .unwrap_or(0);
            let count = stats.gc_count();
            let total = stats.total_gc_time_ns();
            self.runs.push(RunResult {
                total_gc_time_ns: total,
                gc_call_count: count,
                average_gc_time_ns: if count > 0 { total / count as u64 } else { 0 },
                max_gc_time_ns: max,
            });
            self.all_samples.extend_from_slice(stats.samples());
        }
    }

    pub fn runs(&self) -> &[RunResult] {
        &self.runs
    }

    pub fn summary(&self) -> Summary {
        let mut sorted: Vec<u64> = self.all_samples.iter().map(|s| s.duration_ns).collect();
        sorted.sort_unstable();
        let p50 = percentile(&sorted, 50.0);
        let p99 = percentile(&sorted, 99.0);
        let average_total_ns = if self.runs.is_empty() {
            0
        } else {
            self.runs.iter().map(|r| r.total_gc_time_ns).sum::<u64>() / self.runs.len() as u64
        };
        let average_calls = if self.runs.is_empty() {
            0.0
        } else {
            self.runs.iter().map(|r| r.gc_call_count).sum::<usize>() as f64
                / self.runs.len() as f64
        };
        let by_type = [RegionType::Trace, RegionType::Arena, RegionType::Rc]
            .into_iter()
            .filter_map(|ty| {
                let samples: Vec<_> = self
                    .all_samples
                    .iter()
                    .filter(|s| s.region_type == ty)
                    .collect();
                if samples.is_empty() {
                    return None;
                }
                let total: u64 = samples.iter().map(|s| s.duration_ns).sum();
                Some(TypeBreakdown {
                    region_type: ty,
                    calls: samples.len(),
                    total_ns: total,
                    average_ns: total / samples.len() as u64,
                })
            })
            .collect();
        Summary {
            runs: self.runs.clone(),
            average_total_ns,
            average_calls,
            p50_ns: p50,
            p99_ns: p99,
            normalized_jitter: if p50 == 0 {
                0.0
            } else {
                (p99 as f64 - p50 as f64) / p50 as f64
            },
            by_type,
        }
    }
}

fn collect_run(test_fn: &mut impl FnMut()) -> GcStats {
    let stats = Rc::new(RefCell::new(GcStats::default()));
    let sink = stats.clone();
    let prev = api::set_gc_callback(Some(Box::new(
        move |duration_ns, region_type, bytes_before, objects_before| {
            sink.borrow_mut().record(GcSample {
                duration_ns,
                region_type,
                bytes_before,
                objects_before,
            });
        },
    )));
    test_fn();
    api::set_gc_callback(prev);
    Rc::try_unwrap(stats)
        .map(RefCell::into_inner)
        .unwrap_or_else(|rc| rc.borrow().clone())
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64) as usize;
    sorted[idx]
}

/// Aggregated benchmark statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub runs: Vec<RunResult>,
    pub average_total_ns: u64,
    pub average_calls: f64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    /// `(P99 - P50) / P50` across all GC calls.
    pub normalized_jitter: f64,
    pub by_type: Vec<TypeBreakdown>,
}

/// Per-region-type share of the collected samples.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TypeBreakdown {
    pub region_type: RegionType,
    pub calls: usize,
    pub total_ns: u64,
    pub average_ns: u64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Number of runs: {}", self.runs.len())?;
        writeln!(f)?;
        writeln!(
            f,
            "{:<6}{:<18}{:<12}{:<14}{:<14}",
            "Run", "Total (ns)", "Calls", "Avg (ns)", "Max (ns)"
        )?;
        writeln!(f, "{}", "-".repeat(64))?;
        for (i, run) in self.runs.iter().enumerate() {
            writeln!(
                f,
                "{:<6}{:<18}{:<12}{:<14}{:<14}",
                i + 1,
                run.total_gc_time_ns,
                run.gc_call_count,
                run.average_gc_time_ns,
                run.max_gc_time_ns
            )?;
        }
        writeln!(f, "{}", "-".repeat(64))?;
        writeln!(
            f,
            "{:<6}{:<18}{:<12}",
            "Avg", self.average_total_ns, self.average_calls as usize
        )?;
        writeln!(f, "P50 (across all GC calls): {} ns", self.p50_ns)?;
        writeln!(f, "P99 (across all GC calls): {} ns", self.p99_ns)?;
        writeln!(
            f,
            "Normalized Jitter (P99-P50)/P50: {:.4}",
            self.normalized_jitter
        )?;
        if self.by_type.len() > 1 {
            writeln!(f)?;
            writeln!(f, "Per-Region Type Breakdown:")?;
            for t in &self.by_type {
                writeln!(
                    f,
                    "{:<8} Calls: {:<8} Total: {:<12} ns Avg: {} ns",
                    t.region_type.to_string(),
                    t.calls,
                    t.total_ns,
                    t.average_ns
                )?;
            }
        }
        Ok(())
    }
}
