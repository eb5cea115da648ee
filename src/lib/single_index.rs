//! Demultiplexing of paired-end reads on the barcodes of a single index read.
//!
//! Without an I2, each read pair is assigned by the p7 barcode at the head of I1, falling back on
//! the i7 barcode at its tail. Accepted pairs go to a default writer pair, or to the writer pair of
//! their routing tag when an output files index maps the barcode. Reads are processed in batches
//! read on a separate thread and shared out over a rayon pool.

use std::{collections::BTreeMap, fs, io::Write, num::NonZeroUsize, time::Instant};

use anyhow::{ensure, Context, Result};
use log::{debug, info};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::{
    demux::DemuxContext,
    metrics::{report_writer, write_entries, write_summary, StatsDict},
    output::{OutputKey, OutputNaming, OutputRouter},
    record_io::{write_barcoded_record, HEADER_MARKER},
    registry::IndexType,
    thread_reader::{BatchReader, LineBatch},
    utils::s,
};

/// The number of records read per batch.
pub const BATCH_RECORDS: usize = 25_000;

/// The key of the reads of the `Default` pair in the `output_files` report.
const DEFAULT_TAG: &str = "Default";

/// The metrics collected over the batches of a single index run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SingleIndexMetrics {
    /// The number of accepted reads.
    pub reads: usize,
    /// The number of reads without a matching barcode.
    pub failed: usize,
    /// Accepted reads per resolved barcode, keyed by `success_{type}_repl1`.
    pub barcodes: BTreeMap<String, StatsDict>,
    /// Failed reads per observed barcode, keyed by `fail_{type}`.
    pub failed_barcodes: BTreeMap<String, StatsDict>,
    /// Accepted reads per routing tag.
    pub output_files: StatsDict,
}

impl SingleIndexMetrics {
    pub fn update_with(&mut self, other: Self) {
        self.reads += other.reads;
        self.failed += other.failed;
        for (mine, theirs) in
            [(&mut self.barcodes, other.barcodes), (&mut self.failed_barcodes, other.failed_barcodes)]
        {
            for (category, dict) in theirs {
                mine.entry(category).or_default().update_with(dict);
            }
        }
        self.output_files.update_with(other.output_files);
    }

    /// The labelled counts of the `stats` report. Labels with a zero count are left out.
    pub fn stats(&self) -> StatsDict {
        [("Number of reads", self.reads), ("Number of reads (FAIL)", self.failed)]
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    /// Write `report{tag}_{stats,barcodes,failed_barcodes,output_files}.log`.
    ///
    /// Failed barcodes aren't written when every read is accepted without a barcode check, nor
    /// the output files without routing.
    pub fn write_reports(
        self,
        naming: &OutputNaming,
        with_failed_barcodes: bool,
        with_output_files: bool,
        sort: bool,
    ) -> Result<()> {
        let start = Instant::now();
        info!("Writing reports to {}", naming.output_dir().display());
        let stats = self.stats();
        let SingleIndexMetrics { barcodes, failed_barcodes, output_files, .. } = self;

        write_categories(naming, "stats", vec![("stats".to_string(), stats)], sort)?;
        write_categories(naming, "barcodes", barcodes.into_iter().collect(), sort)?;
        if with_failed_barcodes {
            let categories = failed_barcodes.into_iter().collect();
            write_categories(naming, "failed_barcodes", categories, sort)?;
        }
        if with_output_files {
            let categories = vec![("output_files".to_string(), output_files)];
            write_categories(naming, "output_files", categories, sort)?;
        }
        info!("Writing reports finished in {:.2}s", start.elapsed().as_secs_f64());
        Ok(())
    }
}

/// Write `report{tag}_{name}.log` with a `#### {category}` section per category.
fn write_categories(
    naming: &OutputNaming,
    name: &str,
    categories: Vec<(String, StatsDict)>,
    sort: bool,
) -> Result<()> {
    let mut writer = report_writer(naming.report_path(&format!("{}.log", name)))?;
    for (category, dict) in categories {
        writeln!(writer, "#### {}", category)?;
        writeln!(writer, "#<key>\t<value>")?;
        write_entries(&mut writer, None, dict.into_entries(sort))?;
    }
    writer.flush()?;
    Ok(())
}

/// The formatted R1 and R2 records of a batch bound for one writer pair.
#[derive(Default)]
struct PairBuffer {
    r1: Vec<u8>,
    r2: Vec<u8>,
    records: usize,
}

/// Demultiplexes read pairs on the barcodes of I1.
pub struct SingleIndexDemultiplexer<'a> {
    ctx: &'a DemuxContext,
    batch_records: usize,
}

impl<'a> SingleIndexDemultiplexer<'a> {
    pub fn new(ctx: &'a DemuxContext) -> Self {
        Self { ctx, batch_records: BATCH_RECORDS }
    }

    /// Set the number of records per batch.
    pub fn with_batch_records(mut self, batch_records: usize) -> Self {
        self.batch_records = batch_records;
        self
    }

    /// Demultiplex, then write the run summary and, if requested, the reports.
    pub fn run(&self) -> Result<()> {
        let start = Instant::now();
        let metrics = self.demultiplex()?;
        info!("{} reads accepted, {} reads failed", metrics.reads, metrics.failed);
        write_summary(
            self.ctx.naming.report_path("summary.tsv"),
            &[("repl1".to_string(), metrics.reads), ("fail".to_string(), metrics.failed)],
        )?;
        if self.ctx.write_logs {
            metrics.write_reports(
                &self.ctx.naming,
                !self.ctx.registry().is_passthrough(),
                self.ctx.routes.is_some(),
                self.ctx.sort_logs,
            )?;
        }
        info!("Demultiplexing finished in {:.2}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Demultiplex every batch, returning the merged metrics.
    pub fn demultiplex(&self) -> Result<SingleIndexMetrics> {
        let ctx = self.ctx;
        let batch_records =
            NonZeroUsize::new(self.batch_records).context("The batch size must be positive")?;
        let router = match &ctx.routes {
            Some(routes) => OutputRouter::for_routes(&ctx.naming, routes)?,
            None => OutputRouter::for_replicates(&ctx.naming, "", 1)?,
        };
        let router = Mutex::new(router);

        info!("Reading batches of {} records with {} threads", batch_records, ctx.threads);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ctx.threads)
            .build()
            .context("Failed to build the thread pool")?;
        let reader = BatchReader::new(
            ctx.fastq_r1.clone(),
            ctx.fastq_r2.clone(),
            ctx.fastq_i1.clone(),
            batch_records,
            ctx.max_nb_reads,
        );

        let metrics: Result<SingleIndexMetrics> = pool.install(|| {
            reader
                .rx
                .iter()
                .par_bridge()
                .map(|batch| self.process_batch(&batch, &router))
                .fold(|| Ok(SingleIndexMetrics::default()), merge)
                .reduce(|| Ok(SingleIndexMetrics::default()), merge)
        });

        match reader.handle.join() {
            Ok(result) => result?,
            Err(e) => std::panic::resume_unwind(e),
        }
        let metrics = metrics?;

        for output in router.into_inner().finish()? {
            debug!("Wrote {} read pairs to {}", output.records, output.r1.display());
            if output.key == OutputKey::Default && output.records == 0 {
                info!("No read left for the default outputs, removing {}", output.r1.display());
                for path in [&output.r1, &output.r2] {
                    fs::remove_file(path)
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                }
            }
        }
        Ok(metrics)
    }

    /// Demultiplex the records of a batch into local buffers, then hand them to the router.
    fn process_batch(
        &self,
        batch: &LineBatch,
        router: &Mutex<OutputRouter>,
    ) -> Result<SingleIndexMetrics> {
        let ctx = self.ctx;
        let mut metrics = SingleIndexMetrics::default();
        let mut buffers: BTreeMap<OutputKey, PairBuffer> = BTreeMap::new();

        for (offset, (r1, r2, i1)) in batch.records().enumerate() {
            ensure!(
                [r1, r2, i1].iter().all(|lines| lines[0].first() == Some(&HEADER_MARKER)),
                "Reads R1 {} R2 {} I1 {} are not sync at record {}",
                s(&r1[0]),
                s(&r2[0]),
                s(&i1[0]),
                batch.first_record + offset
            );

            let (index_type, barcode) = match self.assign(&i1[1]) {
                Some(assigned) => assigned,
                None => {
                    metrics.failed += 1;
                    self.count_failed(&i1[1], &mut metrics);
                    continue;
                }
            };

            let (key, tag) = match (&ctx.routes, index_type) {
                (Some(routes), Some(index_type)) => match routes.tag(index_type, barcode) {
                    Some(tag) => (OutputKey::Routed(tag.to_string()), tag),
                    None => (OutputKey::Default, DEFAULT_TAG),
                },
                (Some(_), None) => (OutputKey::Default, DEFAULT_TAG),
                (None, _) => (OutputKey::Replicate(1), ""),
            };
            if ctx.routes.is_some() {
                metrics.output_files.increment(tag.as_bytes());
            }
            let category = match index_type {
                Some(index_type) => format!("success_{}_repl1", index_type),
                None => "success_repl1".to_string(),
            };
            metrics.barcodes.entry(category).or_default().increment(barcode);
            metrics.reads += 1;

            let buffer = buffers.entry(key).or_default();
            write_barcoded_record(&mut buffer.r1, barcode, &r1[0], &r1[1], &r1[2], &r1[3])?;
            write_barcoded_record(&mut buffer.r2, barcode, &r2[0], &r2[1], &r2[2], &r2[3])?;
            buffer.records += 1;
        }

        let mut router = router.lock();
        for (key, buffer) in buffers {
            router.write_formatted(&key, &buffer.r1, &buffer.r2, buffer.records)?;
        }
        Ok(metrics)
    }

    /// Find the barcode of an I1 sequence: the p7 barcode if it matches, the i7 barcode
    /// otherwise. Returns the index type that matched, `None` when the whole sequence is used.
    fn assign<'s>(&'s self, i1: &'s [u8]) -> Option<(Option<IndexType>, &'s [u8])> {
        let registry = self.ctx.registry();
        if registry.is_passthrough() {
            return Some((None, i1));
        }
        [IndexType::P7, IndexType::I7].into_iter().find_map(|index_type| {
            let observed = self.observed(i1, index_type)?;
            let slot = self.ctx.resolver.resolve_slot(observed, index_type);
            slot.success.then(|| (Some(index_type), slot.resolved))
        })
    }

    fn count_failed(&self, i1: &[u8], metrics: &mut SingleIndexMetrics) {
        for index_type in [IndexType::P7, IndexType::I7] {
            if let Some(observed) = self.observed(i1, index_type) {
                let category = format!("fail_{}", index_type);
                metrics.failed_barcodes.entry(category).or_default().increment(observed);
            }
        }
    }

    /// The p7 barcode at the head of I1, or the i7 barcode at its tail. `None` for a disabled slot
    /// or an I1 too short to hold the barcode.
    fn observed<'s>(&self, i1: &'s [u8], index_type: IndexType) -> Option<&'s [u8]> {
        let length = self.ctx.registry().lengths()[index_type];
        if length == 0 || i1.len() < length {
            return None;
        }
        match index_type {
            IndexType::P7 => Some(&i1[..length]),
            IndexType::I7 => Some(&i1[i1.len() - length..]),
            _ => None,
        }
    }
}

/// Merge two partial results, keeping the first error.
fn merge(
    all: Result<SingleIndexMetrics>,
    other: Result<SingleIndexMetrics>,
) -> Result<SingleIndexMetrics> {
    match (all, other) {
        (Ok(mut all), Ok(other)) => {
            all.update_with(other);
            Ok(all)
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(a), Err(_) | Ok(_)) => Err(a),
    }
}
