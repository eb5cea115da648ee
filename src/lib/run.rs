use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    time::Instant,
};

use anyhow::{Context, Result};
use log::{debug, info};

use crate::{
    demux::{DemultiplexWorker, DemuxContext},
    metrics::{aggregate, write_summary, DemuxMetrics},
    opts::Opts,
    record_io::count_lines,
    single_index::SingleIndexDemultiplexer,
    utils::built_info,
};

/// Run the demultiplexing described by `opts`.
///
/// With an I2, the read pairs are demultiplexed on all four index barcodes by a
/// [`ParallelScheduler`]. Without one, the I1 barcodes alone are used by a
/// [`SingleIndexDemultiplexer`].
pub fn run(opts: Opts) -> Result<()> {
    info!("Running atacdemux version {}", built_info::VERSION.as_str());
    let ctx = DemuxContext::from_opts(&opts)?;
    if ctx.fastq_i2.is_none() {
        info!("No I2 given, demultiplexing on the I1 barcodes only");
        return SingleIndexDemultiplexer::new(&ctx).run();
    }
    ParallelScheduler::new(&ctx).run()
}

/// The record range of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerRange {
    /// The 0-based number of the first record.
    pub start_record: usize,
    /// The number of records to evaluate, 0 for all remaining records.
    pub budget: usize,
}

/// Split the records between `threads` workers.
///
/// When `max_reads` is not 0 every worker gets `max_reads / threads` records. Otherwise the
/// `total_records` are split in equal ranges rounded down to a multiple of 4, and the last worker
/// takes whatever remains. Too few records for more than one worker give a single range.
pub fn worker_ranges(threads: usize, max_reads: usize, total_records: usize) -> Vec<WorkerRange> {
    let single = vec![WorkerRange { start_record: 0, budget: max_reads }];
    if threads <= 1 {
        return single;
    }
    let budget = if max_reads > 0 {
        max_reads / threads
    } else {
        let per_thread = total_records / threads;
        per_thread - per_thread % 4
    };
    if budget == 0 {
        return single;
    }
    (0..threads)
        .map(|i| {
            let last = i == threads - 1 && max_reads == 0;
            WorkerRange { start_record: i * budget, budget: if last { 0 } else { budget } }
        })
        .collect()
}

/// Runs [`DemultiplexWorker`]s over ranges of the inputs and merges their outputs.
pub struct ParallelScheduler<'a> {
    ctx: &'a DemuxContext,
}

impl<'a> ParallelScheduler<'a> {
    pub fn new(ctx: &'a DemuxContext) -> Self {
        Self { ctx }
    }

    /// Demultiplex, then write the run summary and, if requested, the reports.
    pub fn run(&self) -> Result<()> {
        let start = Instant::now();
        let metrics = self.demultiplex()?;
        let replicates = self.ctx.registry().num_replicates();
        let outcomes = metrics.outcomes(replicates);
        for (outcome, reads) in &outcomes {
            info!("{}: {} reads", outcome, reads);
        }
        write_summary(self.ctx.naming.report_path("summary.tsv"), &outcomes)?;
        if self.ctx.write_logs {
            metrics.write_reports(
                &self.ctx.naming,
                replicates,
                self.ctx.registry().lengths(),
                self.ctx.sort_logs,
            )?;
        }
        info!("Demultiplexing finished in {:.2}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Run the workers and merge their outputs, returning the merged metrics.
    pub fn demultiplex(&self) -> Result<DemuxMetrics> {
        let ctx = self.ctx;
        let total_records = if ctx.threads > 1 && ctx.max_nb_reads == 0 {
            let records = count_lines(&ctx.fastq_i1)? / 4;
            info!("Estimated number of reads: {}", records);
            records
        } else {
            0
        };
        let ranges = worker_ranges(ctx.threads, ctx.max_nb_reads, total_records);

        if let [range] = ranges.as_slice() {
            debug!("Running a single worker over {:?}", range);
            return DemultiplexWorker::new(ctx, String::new(), range.start_record, range.budget)
                .run();
        }

        info!("Splitting the reads between {} workers of {} reads", ranges.len(), ranges[0].budget);
        let per_worker: Vec<Result<DemuxMetrics>> = std::thread::scope(|scope| {
            let handles: Vec<_> = ranges
                .iter()
                .enumerate()
                .map(|(i, range)| {
                    let worker =
                        DemultiplexWorker::new(ctx, shard_prefix(i), range.start_record, range.budget);
                    scope.spawn(move || worker.run())
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(e) => std::panic::resume_unwind(e),
                })
                .collect()
        });
        let per_worker = per_worker.into_iter().collect::<Result<Vec<_>>>()?;

        self.merge_shards(ranges.len())?;
        Ok(aggregate(per_worker))
    }

    /// Concatenate the shards of every worker into the final outputs, in worker order, and
    /// remove the shards.
    fn merge_shards(&self, workers: usize) -> Result<()> {
        let naming = &self.ctx.naming;
        for replicate in 1..=self.ctx.registry().num_replicates() {
            let (r1, r2) = naming.paths("", replicate, None);
            let shards: Vec<_> =
                (0..workers).map(|i| naming.paths(&shard_prefix(i), replicate, None)).collect();
            info!("Concatenating {} shards into {}", workers, r1.display());
            concatenate(shards.iter().map(|(r1, _)| r1.as_path()), &r1)?;
            concatenate(shards.iter().map(|(_, r2)| r2.as_path()), &r2)?;
            for (shard_r1, shard_r2) in shards {
                fs::remove_file(&shard_r1)
                    .with_context(|| format!("Failed to remove {}", shard_r1.display()))?;
                fs::remove_file(&shard_r2)
                    .with_context(|| format!("Failed to remove {}", shard_r2.display()))?;
            }
        }
        Ok(())
    }
}

/// The prefix of the output files of worker `i`.
fn shard_prefix(i: usize) -> String {
    format!("index_{}.", i)
}

/// Append the bytes of every `part` to `output`. Gzipped parts give a multi-member gzip file.
fn concatenate<'p>(parts: impl Iterator<Item = &'p Path>, output: &Path) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(output)
            .with_context(|| format!("Unable to create file: {}", output.display()))?,
    );
    for part in parts {
        let mut reader =
            File::open(part).with_context(|| format!("Failed to open {}", part.display()))?;
        std::io::copy(&mut reader, &mut writer)
            .with_context(|| format!("Failed to copy {} to {}", part.display(), output.display()))?;
    }
    writer.flush().with_context(|| format!("Failed to flush {}", output.display()))?;
    Ok(())
}
