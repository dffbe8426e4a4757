// Latency benchmark for policy compilation, staging and symbol lookup
// Targets: compile p95 < 1ms for a 16-preload, 32-rule manifest;
// loader lookup p95 < 50us

use hostpal::config::manifest::Manifest;
use hostpal::kernel::LinuxHost;
use hostpal::loader::{ImageKind, LoaderOptions, LoaderRegistry, MappedImage};
use hostpal::policy::{compile, Permissions, PolicyRule, WirePayload};
use hostpal::testing::ImageBuilder;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 1000;
const WARMUP_ITERATIONS: usize = 50;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = (len as f64 * 0.95) as usize;
        let p99_idx = (len as f64 * 0.99) as usize;

        let sum: Duration = samples.iter().sum();
        let mean = sum / len as u32;

        Self {
            p50: samples[p50_idx],
            p95: samples[p95_idx],
            p99: samples[p99_idx],
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

struct BenchmarkResult {
    scenario: String,
    stats: LatencyStats,
    budget: Duration,
}

impl BenchmarkResult {
    fn passed(&self) -> bool {
        self.stats.p95 < self.budget
    }

    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        self.stats.print("Latency");
        if self.passed() {
            println!("PASS");
        } else {
            println!("FAIL: p95={:?} (target <{:?})", self.stats.p95, self.budget);
        }
    }
}

fn measure<F: FnMut()>(scenario: &str, budget: Duration, mut f: F) -> BenchmarkResult {
    for _ in 0..WARMUP_ITERATIONS {
        f();
    }
    let samples = (0..ITERATIONS)
        .map(|_| {
            let start = Instant::now();
            f();
            start.elapsed()
        })
        .collect();
    BenchmarkResult {
        scenario: scenario.to_string(),
        stats: LatencyStats::from_samples(samples),
        budget,
    }
}

fn large_manifest() -> Manifest {
    let mut manifest = Manifest::new();
    let preload = (0..16)
        .map(|i| format!("file:/usr/lib/libbench{}.so", i))
        .collect::<Vec<_>>()
        .join(",");
    manifest.insert("loader.preload", preload);
    manifest.insert("fs.mount.root.uri", "file:/");
    for i in 0..8 {
        manifest.insert(format!("fs.mount.other.m{}.uri", i), format!("file:/srv/m{}", i));
    }
    for i in 0..32 {
        manifest.insert(
            format!("net.rules.r{:02}", i),
            format!("10.0.{}.1:{}-{}:10.1.0.1:443", i, 8000 + i, 8100 + i),
        );
    }
    manifest
}

fn main() {
    println!("=== hostpal Policy and Loader Benchmark ===");
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    let manifest = large_manifest();
    let defaults = vec![PolicyRule::path_exact("/etc/hosts", Permissions::READ)];
    let set = compile(&manifest, &defaults).expect("benchmark manifest compiles");

    let mut registry = LoaderRegistry::new(Arc::new(LinuxHost::new()), LoaderOptions::default());
    for i in 0..8 {
        let mut builder = ImageBuilder::new(&format!("libbench{}.so", i));
        for j in 0..64 {
            builder = builder.define(&format!("sym_{}_{}", i, j), j);
        }
        let image = MappedImage::from_bytes(builder.build().bytes()).expect("image");
        registry
            .load(&format!("libbench{}.so", i), image, ImageKind::Library)
            .expect("load");
    }

    let results = vec![
        measure("compile", Duration::from_millis(1), || {
            let _ = compile(&manifest, &defaults);
        }),
        measure("stage wire payload", Duration::from_micros(200), || {
            let _ = WirePayload::stage(set.rules());
        }),
        measure("lookup (oldest image)", Duration::from_micros(50), || {
            let _ = registry.lookup("sym_0_63");
        }),
    ];

    for result in &results {
        result.print();
    }

    let passed_count = results.iter().filter(|r| r.passed()).count();
    let total_count = results.len();

    println!("\n=== Summary ===");
    println!("{}/{} scenarios passed", passed_count, total_count);

    if passed_count == total_count {
        println!("All latency budgets met");
        std::process::exit(0);
    } else {
        println!("Some latency budgets exceeded");
        std::process::exit(1);
    }
}
