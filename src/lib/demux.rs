//! Functionality directly related to demultiplexing paired-end reads using both index reads.
//!
//! A [`DemultiplexWorker`] walks a range of records of the four input FASTQs in lockstep,
//! extracts the four index barcodes of each read pair, resolves them to a replicate and writes the
//! accepted pairs to the outputs of that replicate.

use std::{fs, path::PathBuf};

use anyhow::{anyhow, ensure, Context, Result};
use clap::{ArgEnum, PossibleValue};
use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    matcher::FuzzyMatcher,
    metrics::DemuxMetrics,
    opts::Opts,
    output::{OutputKey, OutputNaming, OutputRouter, OutputRoutes},
    record_io::{FastqRecord, RecordStream},
    registry::{BarcodeRegistry, IndexSources, IndexType, PerIndex},
    resolver::ReplicateResolver,
    utils::s,
};

/// What to do when a malformed record is found.
#[derive(ArgEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandling {
    /// Log the record and stop reading, keeping what was demultiplexed so far.
    Return,
    /// Fail the run.
    Raise,
}

impl ErrorHandling {
    pub fn possible_values<'a>() -> impl Iterator<Item = PossibleValue<'a>> {
        ErrorHandling::value_variants().iter().filter_map(ArgEnum::to_possible_value)
    }
}

impl std::str::FromStr for ErrorHandling {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for variant in Self::value_variants() {
            if variant.to_possible_value().map_or(false, |v| v.matches(s, false)) {
                return Ok(*variant);
            }
        }
        Err(anyhow!("Invalid error handling: {}", s))
    }
}

/// A record of the four inputs that can't be demultiplexed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error("Record {record} is missing a header line\n{}", join_lines(.lines))]
    MissingHeader { record: usize, lines: Vec<String> },

    #[error("Record {record} has an index read shorter than its barcodes\n{}", join_lines(.lines))]
    IndexTooShort { record: usize, lines: Vec<String> },

    #[error("Record {record} is truncated\n{}", join_lines(.lines))]
    Truncated { record: usize, lines: Vec<String> },
}

fn join_lines(lines: &[String]) -> String {
    lines.join("\n")
}

// Positions of the inputs in the arrays of streams and records, in reading order.
const I1: usize = 0;
const I2: usize = 1;
const R1: usize = 2;
const R2: usize = 3;
const INPUT_NAMES: [&str; 4] = ["I1", "I2", "R1", "R2"];

/// The four records of a read pair and its index reads, indexed by [`I1`], [`I2`], [`R1`] and [`R2`].
type ReadQuad = [FastqRecord; 4];

/// Describe the lines read so far for a record, for diagnostics.
fn describe(quad: &ReadQuad) -> Vec<String> {
    let ids = quad.iter().zip(INPUT_NAMES).map(|(r, name)| format!("ID {}: {}", name, s(&r.head)));
    let seqs =
        quad.iter().zip(INPUT_NAMES).map(|(r, name)| format!("read {}: {}", name, s(&r.seq)));
    ids.chain(seqs).collect()
}

/// Everything a run needs, built once from the command line options.
#[derive(Debug)]
pub struct DemuxContext {
    pub resolver: ReplicateResolver,
    pub fastq_r1: PathBuf,
    pub fastq_r2: PathBuf,
    pub fastq_i1: PathBuf,
    /// Without I2 the run uses the I1 barcodes only.
    pub fastq_i2: Option<PathBuf>,
    pub shift_p5: usize,
    pub error_handling: ErrorHandling,
    pub write_logs: bool,
    pub sort_logs: bool,
    pub threads: usize,
    pub max_nb_reads: usize,
    pub naming: OutputNaming,
    /// Per barcode outputs, only used without I2.
    pub routes: Option<OutputRoutes>,
}

impl DemuxContext {
    /// Validate `opts`, create the output directory and load the reference barcodes.
    pub fn from_opts(opts: &Opts) -> Result<Self> {
        ensure!(opts.threads >= 1, "--nbThreads must be at least 1, found {}", opts.threads);
        fs::create_dir_all(&opts.output_path).with_context(|| {
            format!("Failed to create output directory: {}", opts.output_path.display())
        })?;
        info!("Writing outputs to {}", opts.output_path.display());

        let sources = opts.index_sources()?;
        let routes = match (&opts.fastq_i2, &opts.output_files_index) {
            (None, Some(path)) => Some(OutputRoutes::from_path(path)?),
            (Some(_), Some(path)) => {
                ensure!(
                    sources == IndexSources::NoReplicate(vec![path.clone()]),
                    "--output_files_index only routes reads without --fastq_I2, with an I2 it can \
                     only be used as the sole index file"
                );
                info!("Using {} as index file, reads are not routed with an I2", path.display());
                None
            }
            (_, None) => None,
        };
        let registry = BarcodeRegistry::load(&sources, &opts.registry_config()?, &opts.output_path)?;
        let matcher = FuzzyMatcher::new(opts.max_mistakes(), *registry.accept_all());
        let naming = OutputNaming::new(
            &opts.output_path,
            &opts.fastq_r1,
            &opts.fastq_r2,
            &opts.output_tag(),
            &opts.output_type,
        );

        Ok(Self {
            resolver: ReplicateResolver::new(registry, matcher),
            fastq_r1: opts.fastq_r1.clone(),
            fastq_r2: opts.fastq_r2.clone(),
            fastq_i1: opts.fastq_i1.clone(),
            fastq_i2: opts.fastq_i2.clone(),
            shift_p5: opts.shift_p5,
            error_handling: opts.error_handling,
            write_logs: opts.write_logs,
            sort_logs: opts.sort_logs,
            threads: opts.threads,
            max_nb_reads: opts.max_nb_reads,
            naming,
            routes,
        })
    }

    pub fn registry(&self) -> &BarcodeRegistry {
        self.resolver.registry()
    }

    /// The number of bases the p5 barcode ends before the end of I2, 0 when p5 is disabled.
    fn p5_shift(&self) -> usize {
        if self.registry().lengths()[IndexType::P5] > 0 {
            self.shift_p5
        } else {
            0
        }
    }
}

/// Demultiplexes a range of records of the four inputs.
pub struct DemultiplexWorker<'a> {
    ctx: &'a DemuxContext,
    /// Prepended to the names of the output files.
    prefix: String,
    start_record: usize,
    /// The maximum number of records to evaluate, 0 for all remaining records.
    budget: usize,
}

impl<'a> DemultiplexWorker<'a> {
    pub fn new(ctx: &'a DemuxContext, prefix: String, start_record: usize, budget: usize) -> Self {
        Self { ctx, prefix, start_record, budget }
    }

    /// Demultiplex the records of this worker, returning the metrics collected along the way.
    ///
    /// Malformed records are handled as set by [`DemuxContext::error_handling`]: either the scan
    /// stops with the metrics collected so far, or the error is returned.
    pub fn run(self) -> Result<DemuxMetrics> {
        let ctx = self.ctx;
        let i2 = ctx.fastq_i2.as_ref().ok_or_else(|| anyhow!("Demultiplexing requires an I2"))?;
        let mut streams = [
            RecordStream::open(&ctx.fastq_i1, self.start_record)?,
            RecordStream::open(i2, self.start_record)?,
            RecordStream::open(&ctx.fastq_r1, self.start_record)?,
            RecordStream::open(&ctx.fastq_r2, self.start_record)?,
        ];
        let replicates = ctx.registry().num_replicates();
        let mut router = OutputRouter::for_replicates(&ctx.naming, &self.prefix, replicates)?;

        let mut quad = ReadQuad::default();
        let mut metrics = DemuxMetrics::default();
        let mut cell_barcode = Vec::with_capacity(64);
        let mut count = 0;

        loop {
            let record = self.start_record + count;
            match self.next_quad(&mut streams, &mut quad, record) {
                Ok(true) => (),
                Ok(false) => break,
                Err(err) => match err.downcast::<MalformedRecord>() {
                    Ok(malformed) => match ctx.error_handling {
                        ErrorHandling::Return => {
                            warn!("{}", malformed);
                            warn!("Stopping the worker starting at record {}", self.start_record);
                            break;
                        }
                        ErrorHandling::Raise => {
                            return Err(anyhow::Error::new(malformed)
                                .context(format!("Malformed input at record {}", record)));
                        }
                    },
                    Err(err) => return Err(err),
                },
            }

            let verdict = ctx.resolver.resolve(self.extract(&quad));
            verdict.write_cell_barcode(&mut cell_barcode);
            metrics.count(&verdict);
            if ctx.write_logs {
                metrics.record_cell(&verdict, &cell_barcode);
            }
            if let Some(replicate) = verdict.replicate {
                router.write_pair(
                    &OutputKey::Replicate(replicate),
                    &cell_barcode,
                    (&quad[I1].head, &quad[R1]),
                    (&quad[I2].head, &quad[R2]),
                )?;
            }

            count += 1;
            if self.budget != 0 && count >= self.budget {
                break;
            }
        }

        for output in router.finish()? {
            debug!("Wrote {} read pairs to {}", output.records, output.r1.display());
        }
        debug!("Worker starting at record {} evaluated {} records", self.start_record, count);
        Ok(metrics)
    }

    /// Read the next record of every input into `quad`, returning false once I1 is exhausted.
    ///
    /// Header lines that don't start with `@` are skipped on all four inputs together until they
    /// line up again.
    fn next_quad(
        &self,
        streams: &mut [RecordStream; 4],
        quad: &mut ReadQuad,
        record: usize,
    ) -> Result<bool> {
        for r in quad.iter_mut() {
            r.seq.clear();
        }
        loop {
            let mut present = [false; 4];
            for ((stream, r), present) in streams.iter_mut().zip(quad.iter_mut()).zip(&mut present) {
                *present = stream.read_line(&mut r.head)?;
            }
            if !present[I1] {
                ensure!(
                    !present.iter().any(|p| *p),
                    "Different read counts: I1 ends at record {} while {} still have lines",
                    record,
                    INPUT_NAMES
                        .iter()
                        .zip(present)
                        .filter_map(|(name, p)| p.then(|| *name))
                        .collect::<Vec<_>>()
                        .join(", "),
                );
                return Ok(false);
            }
            if present.iter().zip(quad.iter()).any(|(present, r)| !present || r.head.is_empty()) {
                return Err(MalformedRecord::MissingHeader { record, lines: describe(quad) }.into());
            }
            if quad.iter().all(FastqRecord::has_header) {
                break;
            }
            debug!("Skipping out of sync header lines before record {}", record);
        }

        let mut complete = true;
        for (stream, r) in streams.iter_mut().zip(quad.iter_mut()) {
            for line in [&mut r.seq, &mut r.strand, &mut r.qual] {
                complete &= stream.read_line(line)?;
            }
        }
        if !complete {
            return Err(MalformedRecord::Truncated { record, lines: describe(quad) }.into());
        }

        let lengths = self.ctx.registry().lengths();
        let i1_needed = lengths[IndexType::P7].max(lengths[IndexType::I7]);
        let i2_needed = lengths[IndexType::I5].max(lengths[IndexType::P5] + self.ctx.p5_shift());
        if quad[I1].seq.len() < i1_needed || quad[I2].seq.len() < i2_needed {
            return Err(MalformedRecord::IndexTooShort { record, lines: describe(quad) }.into());
        }
        Ok(true)
    }

    /// Extract the barcodes of each slot from the index reads. Disabled slots are empty.
    fn extract<'q>(&self, quad: &'q ReadQuad) -> PerIndex<&'q [u8]> {
        let lengths = self.ctx.registry().lengths();
        let shift = self.ctx.p5_shift();
        let (i1, i2) = (quad[I1].seq.as_slice(), quad[I2].seq.as_slice());
        PerIndex::from_fn(|index_type| match index_type {
            IndexType::P7 => &i1[..lengths[IndexType::P7]],
            IndexType::I7 => &i1[i1.len() - lengths[IndexType::I7]..],
            IndexType::I5 => &i2[..lengths[IndexType::I5]],
            IndexType::P5 => &i2[i2.len() - lengths[IndexType::P5] - shift..i2.len() - shift],
        })
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use fgoxide::io::Io;
    use matches::assert_matches;
    use rstest::rstest;
    use tempfile::tempdir;

    use super::*;
    use crate::utils::test_commons::{
        as_run, good_read, run_opts, slurp_fastq, slurp_heads, write_default_index, write_run, I5,
        I7, P5, P7,
    };

    fn context(dir: &Path, reads: &[[String; 5]], configure: impl FnOnce(&mut Opts)) -> DemuxContext {
        let mut opts = run_opts(dir, write_run(dir, &as_run(reads)));
        opts.index_no_replicate = vec![write_default_index(dir)];
        configure(&mut opts);
        DemuxContext::from_opts(&opts).unwrap()
    }

    fn output(dir: &Path, read: usize) -> PathBuf {
        dir.join("out").join(format!("run_R{}.demultiplexed.R{}.repl1.fastq.gz", read, read))
    }

    fn good_reads(n: usize) -> Vec<[String; 5]> {
        (0..n).map(|i| good_read(&format!("read{}", i))).collect()
    }

    #[test]
    fn test_error_handling_from_str() {
        assert_eq!("return".parse::<ErrorHandling>().unwrap(), ErrorHandling::Return);
        assert_eq!("raise".parse::<ErrorHandling>().unwrap(), ErrorHandling::Raise);
        assert!("ignore".parse::<ErrorHandling>().is_err());
    }

    #[test]
    fn test_demultiplex_good_reads() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &good_reads(3), |_| ());
        let metrics = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap();
        assert_eq!(metrics.accepted, [3, 0]);
        assert_eq!(metrics.rejected, 0);

        let barcode = format!("{}{}{}{}", P7, I7, I5, P5);
        let r1 = slurp_fastq(output(dir.path(), 1));
        assert_eq!(r1.len(), 3);
        assert_eq!(r1[0].head, format!("{}:read0", barcode).into_bytes());
        assert_eq!(r1[0].seq, b"ACGTACGTAC");
        let r2 = slurp_fastq(output(dir.path(), 2));
        assert_eq!(r2[2].head, format!("{}:read2", barcode).into_bytes());
        assert_eq!(r2[2].seq, b"TTGGCCAATT");
    }

    #[test]
    fn test_fuzzy_match_writes_resolved_barcode() {
        let dir = tempdir().unwrap();
        let mut read = good_read("fuzzy");
        read[3] = format!("AAAAAAAT{}", I7);
        let ctx = context(dir.path(), &[read], |_| ());
        let metrics = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap();
        assert_eq!(metrics.accepted, [1, 0]);
        assert_eq!(
            slurp_heads(output(dir.path(), 1)),
            vec![format!("{}{}{}{}:fuzzy", P7, I7, I5, P5)]
        );
    }

    #[test]
    fn test_rejected_reads_are_counted_not_written() {
        let dir = tempdir().unwrap();
        let mut reads = good_reads(2);
        reads[1][4] = format!("{}{}", I5, "ACACACAC");
        let ctx = context(dir.path(), &reads, |o| o.write_logs = true);
        let metrics = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap();
        assert_eq!(metrics.accepted, [1, 0]);
        assert_eq!(metrics.rejected, 1);
        let observed = format!("{}{}{}{}", P7, I7, I5, "ACACACAC");
        assert_eq!(metrics.fail.get(observed.as_bytes()), 1);
        assert_eq!(slurp_heads(output(dir.path(), 1)).len(), 1);
    }

    #[rstest]
    #[case(0, 0, 10)]
    #[case(3, 0, 7)]
    #[case(3, 4, 4)]
    #[case(8, 4, 2)]
    #[case(12, 0, 0)]
    fn test_worker_range(
        #[case] start_record: usize,
        #[case] budget: usize,
        #[case] expected: usize,
    ) {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &good_reads(10), |_| ());
        let metrics = DemultiplexWorker::new(&ctx, String::new(), start_record, budget).run().unwrap();
        assert_eq!(metrics.total(), expected);
        let heads = slurp_heads(output(dir.path(), 1));
        assert_eq!(heads.len(), expected);
        if expected > 0 {
            assert!(heads[0].ends_with(&format!(":read{}", start_record)));
        }
    }

    #[test]
    fn test_prefixed_outputs() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &good_reads(1), |_| ());
        DemultiplexWorker::new(&ctx, "index_3.".to_string(), 0, 0).run().unwrap();
        let expected = dir.path().join("out").join("index_3.run_R1.demultiplexed.R1.repl1.fastq.gz");
        assert_eq!(slurp_heads(expected).len(), 1);
    }

    fn malformed_then_good() -> Vec<[String; 5]> {
        let mut reads: Vec<[String; 5]> = (0..4)
            .map(|i| {
                let mut read = good_read(&format!("short{}", i));
                read[3] = "AAAA".to_string();
                read
            })
            .collect();
        reads.extend(good_reads(10));
        reads
    }

    #[test]
    fn test_malformed_records_with_return() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &malformed_then_good(), |o| {
            o.error_handling = ErrorHandling::Return;
        });
        let metrics = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap();
        assert_eq!(metrics, DemuxMetrics::default());
        assert!(slurp_heads(output(dir.path(), 1)).is_empty());
    }

    #[test]
    fn test_malformed_records_with_raise() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &malformed_then_good(), |o| {
            o.error_handling = ErrorHandling::Raise;
        });
        let err = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap_err();
        let malformed = err.downcast_ref::<MalformedRecord>().unwrap();
        assert_matches!(malformed, MalformedRecord::IndexTooShort { record: 0, .. });
        assert!(malformed.to_string().contains("read I1: AAAA"));
    }

    #[test]
    fn test_p5_shift() {
        let dir = tempdir().unwrap();
        let mut read = good_read("shifted");
        read[4] = format!("{}{}GA", I5, P5);
        let ctx = context(dir.path(), &[read.clone()], |o| o.shift_p5 = 2);
        let metrics = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap();
        assert_eq!(metrics.accepted, [1, 0]);

        // Without the shift the last bases of I2 don't match p5
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &[read], |o| o.max_nb_mistake = 1);
        let metrics = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap();
        assert_eq!(metrics.rejected, 1);
    }

    #[test]
    fn test_shift_counts_towards_index_length() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &good_reads(1), |o| {
            o.shift_p5 = 9;
            o.error_handling = ErrorHandling::Raise;
        });
        let err = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap_err();
        assert_matches!(
            err.downcast_ref::<MalformedRecord>(),
            Some(MalformedRecord::IndexTooShort { .. })
        );
    }

    /// Write `lines` to each of the four inputs, overwriting the run written by [`context`].
    fn overwrite_inputs(ctx: &DemuxContext, lines: [&[String]; 4]) {
        let paths = [&ctx.fastq_i1, ctx.fastq_i2.as_ref().unwrap(), &ctx.fastq_r1, &ctx.fastq_r2];
        for (path, lines) in paths.into_iter().zip(lines) {
            Io::default().write_lines(path, lines).unwrap();
        }
    }

    #[test]
    fn test_resync_on_header_lines() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &good_reads(1), |_| ());
        let record = |name: &str, seq: String| {
            vec![format!("@{}", name), seq.clone(), "+".to_string(), "I".repeat(seq.len())]
        };
        let with_junk = |seq: String| {
            let mut lines = vec!["junk".to_string()];
            lines.extend(record("read0", seq));
            lines
        };
        let i1 = with_junk(format!("{}{}", P7, I7));
        let i2 = with_junk(format!("{}{}", I5, P5));
        let r1 = with_junk("ACGT".to_string());
        let r2 = with_junk("TTTT".to_string());
        overwrite_inputs(&ctx, [&i1, &i2, &r1, &r2]);

        let metrics = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap();
        assert_eq!(metrics.accepted, [1, 0]);
    }

    #[rstest]
    #[case::empty_header(vec!["", "ACGT", "+", "IIII"])]
    #[case::truncated(vec!["@read0", "ACGT"])]
    fn test_missing_lines_are_malformed(#[case] r2: Vec<&str>) {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &good_reads(1), |o| o.error_handling = ErrorHandling::Raise);
        let lines = |seq: String| vec!["@read0".to_string(), seq, "+".to_string(), "IIII".to_string()];
        let i1 = lines(format!("{}{}", P7, I7));
        let i2 = lines(format!("{}{}", I5, P5));
        let r1 = lines("ACGT".to_string());
        let r2: Vec<String> = r2.into_iter().map(String::from).collect();
        overwrite_inputs(&ctx, [&i1, &i2, &r1, &r2]);

        let err = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap_err();
        assert!(err.downcast_ref::<MalformedRecord>().is_some());
    }

    #[rstest]
    fn test_trailing_records_after_i1_are_a_desync(
        #[values(ErrorHandling::Return, ErrorHandling::Raise)] error_handling: ErrorHandling,
    ) {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &good_reads(5), |o| o.error_handling = error_handling);
        let i1: Vec<String> = (0..2)
            .flat_map(|i| {
                let seq = format!("{}{}", P7, I7);
                [format!("@read{}", i), seq, "+".to_string(), "I".repeat(16)]
            })
            .collect();
        Io::default().write_lines(&ctx.fastq_i1, &i1).unwrap();

        let err = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap_err();
        assert!(err.to_string().contains("Different read counts"), "unexpected error: {}", err);
        assert!(err.to_string().contains("I2, R1, R2"));
    }

    fn write_routes(dir: &Path) -> PathBuf {
        let path = dir.join("output_files.tsv");
        Io::default().write_lines(&path, [format!("p7\t{}\tsampleA", P7)]).unwrap();
        path
    }

    #[test]
    fn test_routes_with_another_index_and_i2_is_an_error() {
        let dir = tempdir().unwrap();
        let mut opts = run_opts(dir.path(), write_run(dir.path(), &as_run(&good_reads(1))));
        opts.index_no_replicate = vec![write_default_index(dir.path())];
        opts.output_files_index = Some(write_routes(dir.path()));
        let err = DemuxContext::from_opts(&opts).unwrap_err();
        assert!(err.to_string().contains("--output_files_index"));
    }

    #[test]
    fn test_routes_as_sole_index_with_i2() {
        let dir = tempdir().unwrap();
        let mut opts = run_opts(dir.path(), write_run(dir.path(), &as_run(&good_reads(2))));
        opts.output_files_index = Some(write_routes(dir.path()));
        let ctx = DemuxContext::from_opts(&opts).unwrap();
        assert!(ctx.routes.is_none());
        let metrics = DemultiplexWorker::new(&ctx, String::new(), 0, 0).run().unwrap();
        assert_eq!(metrics.accepted, [2, 0]);
        assert_eq!(
            slurp_heads(output(dir.path(), 1)),
            vec![format!("{}:read0", P7), format!("{}:read1", P7)]
        );
    }

    #[test]
    fn test_missing_threads_is_an_error() {
        let dir = tempdir().unwrap();
        let mut opts = run_opts(dir.path(), write_run(dir.path(), &as_run(&good_reads(1))));
        opts.threads = 0;
        assert!(DemuxContext::from_opts(&opts).is_err());
    }
}
