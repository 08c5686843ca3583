use anyhow::Result;
use tracing::info;

use crate::cli::ListBenchmarksArgs;
use crate::config::{self, Settings};
use crate::fetch;

pub fn run(args: ListBenchmarksArgs) -> Result<()> {
    let settings = Settings::load(args.data_root)?;

    let defaults = fetch::registry()
        .into_iter()
        .map(|fetcher| fetcher.benchmark_meta())
        .collect();
    let benchmarks = config::load_benchmarks(&settings.benchmarks_path, defaults)?;

    for benchmark in benchmarks.values() {
        let has_fetcher = fetch::for_benchmark(&benchmark.benchmark_id).is_some();
        info!(
            benchmark = %benchmark.benchmark_id,
            name = %benchmark.name,
            category = %benchmark.category,
            unit = %benchmark.unit,
            scale_min = benchmark.scale_min,
            scale_max = benchmark.scale_max,
            higher_is_better = benchmark.higher_is_better,
            fetcher = has_fetcher,
            "benchmark"
        );
    }

    info!(count = benchmarks.len(), "benchmarks configured");
    Ok(())
}
