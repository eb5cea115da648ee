#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use env_logger::Env;

use crate::{
    demux::ErrorHandling,
    registry::{IndexSources, IndexType, PerIndex, RangeFilter, RegistryConfig},
    utils::built_info,
};

pub static TOOL_NAME: &str = "atacdemux";

static SHORT_USAGE: &str = "Demultiplexes paired-end FASTQs using the barcodes of their index reads.";

static LONG_USAGE: &str = "
Demultiplexes paired-end FASTQs using the barcodes of their index reads.

The I1 index read holds the p7 (head) and i7 (tail) barcodes, and the optional I2 index read holds
the i5 (head) and p5 (tail) barcodes. Each barcode is matched against the reference barcodes of its
type, allowing for a number of mismatches, and reads are written to the outputs of the replicate
their barcodes resolve to. The barcodes of a read are prepended to its read name.

Reference barcodes are given as tab delimited files of `<type>\\t<barcode>[\\t<tag number>]` lines,
either as a single set (--index_no_replicate) or as one set per replicate (--index_replicate_r1
and --index_replicate_r2).

When no I2 is given, the I1 barcodes alone are used and reads can be routed to per barcode outputs
with --output_files_index.

Example invocation:

atacdemux \\
  --fastq_R1 R1.fastq.gz --fastq_R2 R2.fastq.gz \\
  --fastq_I1 I1.fastq.gz --fastq_I2 I2.fastq.gz \\
  --index_no_replicate barcodes.tsv \\
  --nbThreads 8 --output_path demuxed/ --write_logs
";

#[derive(Parser, Debug, Clone)]
#[clap(name = TOOL_NAME, version = built_info::VERSION.as_str(), about=SHORT_USAGE, long_about=LONG_USAGE, term_width=0)]
pub struct Opts {
    /// Path to the R1 FASTQ.
    #[clap(long = "fastq_R1", display_order = 1)]
    pub fastq_r1: PathBuf,

    /// Path to the R2 FASTQ.
    #[clap(long = "fastq_R2", display_order = 1)]
    pub fastq_r2: PathBuf,

    /// Path to the I1 index FASTQ.
    #[clap(long = "fastq_I1", display_order = 1)]
    pub fastq_i1: PathBuf,

    /// Path to the I2 index FASTQ.
    ///
    /// Without I2, only the p7 and i7 barcodes of I1 are used.
    #[clap(long = "fastq_I2", display_order = 1)]
    pub fastq_i2: Option<PathBuf>,

    /// Index file(s) of reference barcodes without replicates.
    #[clap(long = "index_no_replicate", display_order = 2)]
    pub index_no_replicate: Vec<PathBuf>,

    /// Index file of the reference barcodes of the first replicate.
    #[clap(long = "index_replicate_r1", display_order = 2)]
    pub index_replicate_r1: Option<PathBuf>,

    /// Index file of the reference barcodes of the second replicate.
    #[clap(long = "index_replicate_r2", display_order = 2)]
    pub index_replicate_r2: Option<PathBuf>,

    /// Index types for which any barcode without an N is accepted.
    #[clap(long = "all_barcodes", display_order = 2)]
    pub all_barcodes: Vec<IndexType>,

    /// Accept every read without checking its barcodes.
    #[clap(long = "use_no_index", display_order = 2)]
    pub use_no_index: bool,

    /// File of `<type>\t<barcode>\t<output tag>` lines routing reads to per tag outputs.
    ///
    /// Routing only applies without I2. Without any other index file, this file also provides the
    /// reference barcodes.
    #[clap(long = "output_files_index", display_order = 2)]
    pub output_files_index: Option<PathBuf>,

    /// Maximum number of mismatches allowed between an observed and a reference barcode.
    #[clap(long = "max_nb_mistake", default_value = "2", display_order = 11)]
    pub max_nb_mistake: usize,

    /// Maximum number of mismatches allowed for p5 barcodes, `max_nb_mistake` if not given.
    #[clap(long = "max_nb_mistake_p5", display_order = 11)]
    pub max_nb_mistake_p5: Option<usize>,

    /// Barcode length used when no index file is given, and for `all_barcodes` types.
    #[clap(long = "taglength", default_value = "8", display_order = 11)]
    pub taglength: usize,

    /// Barcode length of an `all_barcodes` i5, `taglength` if 0.
    #[clap(long = "taglength_i5", default_value = "0", display_order = 11)]
    pub taglength_i5: usize,

    /// Number of bases between the end of I2 and the end of the p5 barcode.
    #[clap(long = "shift_p5", default_value = "0", display_order = 11)]
    pub shift_p5: usize,

    /// Restrict i5 barcodes to these plates (e.g. `1,3-4`), by position in the index file.
    #[clap(long = "i5_plates", display_order = 12)]
    pub i5_plates: Option<String>,

    /// Restrict p7 barcodes to these plates (e.g. `1,3-4`), by position in the index file.
    #[clap(long = "p7_plates", display_order = 12)]
    pub p7_plates: Option<String>,

    /// Restrict i5 barcodes to these positions in the index file (e.g. `1-12,20`).
    #[clap(long = "i5_ranges", display_order = 12)]
    pub i5_ranges: Option<String>,

    /// Restrict p7 barcodes to these positions in the index file (e.g. `1-12,20`).
    #[clap(long = "p7_ranges", display_order = 12)]
    pub p7_ranges: Option<String>,

    /// Number of barcodes per plate.
    #[clap(long = "plate_size", default_value = "96", display_order = 12)]
    pub plate_size: usize,

    /// Number of threads.
    #[clap(long = "nbThreads", short = 't', default_value = "1", display_order = 21)]
    pub threads: usize,

    /// Maximum number of reads to process, 0 for all.
    #[clap(long = "max_nb_reads", default_value = "0", display_order = 21)]
    pub max_nb_reads: usize,

    /// What to do with a malformed record: `return` stops reading, `raise` fails the run.
    #[clap(long = "error_handling", default_value = "return", possible_values = ErrorHandling::possible_values(), display_order = 21)]
    pub error_handling: ErrorHandling,

    /// The directory to write outputs to, created if missing.
    #[clap(long = "output_path", default_value = "./", display_order = 31)]
    pub output_path: PathBuf,

    /// Tag added to the names of all output files.
    #[clap(long = "output_tag_name", display_order = 31)]
    pub output_tag_name: Option<String>,

    /// The type of the output files, used in their extension.
    #[clap(long = "output_type", default_value = "fastq", display_order = 31)]
    pub output_type: String,

    /// Write the barcode count reports.
    #[clap(long = "write_logs", display_order = 32)]
    pub write_logs: bool,

    /// Sort the barcode count reports by decreasing count.
    #[clap(long = "sort_logs", display_order = 32)]
    pub sort_logs: bool,
}

impl Opts {
    /// Work out where the reference barcodes come from.
    pub fn index_sources(&self) -> Result<IndexSources> {
        match (&self.index_replicate_r1, &self.index_replicate_r2) {
            (Some(_), _) | (_, Some(_)) if !self.index_no_replicate.is_empty() => {
                bail!("--index_no_replicate cannot be used with --index_replicate_r1/r2")
            }
            (Some(repl1), Some(repl2)) => {
                Ok(IndexSources::Replicates { repl1: repl1.clone(), repl2: repl2.clone() })
            }
            (Some(_), None) | (None, Some(_)) => {
                bail!("--index_replicate_r1 and --index_replicate_r2 must be given together")
            }
            (None, None) if !self.index_no_replicate.is_empty() => {
                Ok(IndexSources::NoReplicate(self.index_no_replicate.clone()))
            }
            (None, None) => match &self.output_files_index {
                Some(path) if self.all_barcodes.is_empty() => {
                    Ok(IndexSources::NoReplicate(vec![path.clone()]))
                }
                _ => Ok(IndexSources::None),
            },
        }
    }

    /// The maximum number of mismatches allowed for each index type.
    pub fn max_mistakes(&self) -> PerIndex<usize> {
        let mut max_mistakes = PerIndex::from_fn(|_| self.max_nb_mistake);
        if let Some(p5) = self.max_nb_mistake_p5 {
            max_mistakes[IndexType::P5] = p5;
        }
        max_mistakes
    }

    pub fn registry_config(&self) -> Result<RegistryConfig> {
        let range_filter = RangeFilter::from_definitions(
            self.i5_plates.as_deref(),
            self.i5_ranges.as_deref(),
            self.p7_plates.as_deref(),
            self.p7_ranges.as_deref(),
            self.plate_size,
        )?;
        Ok(RegistryConfig {
            taglength: self.taglength,
            taglength_i5: self.taglength_i5,
            accept_all: self.all_barcodes.clone(),
            use_no_index: self.use_no_index,
            max_mistakes: self.max_mistakes(),
            range_filter,
        })
    }

    /// The tag inserted in output file names, with its `_` separator.
    pub fn output_tag(&self) -> String {
        self.output_tag_name.as_ref().map(|t| format!("_{}", t)).unwrap_or_default()
    }
}

/// Implement defaults that match the CLI options to allow for easier testing.
///
/// Note that these defaults exist only within test code.
#[cfg(test)]
impl Default for Opts {
    fn default() -> Self {
        Self {
            fastq_r1: PathBuf::default(),
            fastq_r2: PathBuf::default(),
            fastq_i1: PathBuf::default(),
            fastq_i2: None,
            index_no_replicate: vec![],
            index_replicate_r1: None,
            index_replicate_r2: None,
            all_barcodes: vec![],
            use_no_index: false,
            output_files_index: None,
            max_nb_mistake: 2,
            max_nb_mistake_p5: None,
            taglength: 8,
            taglength_i5: 0,
            shift_p5: 0,
            i5_plates: None,
            p7_plates: None,
            i5_ranges: None,
            p7_ranges: None,
            plate_size: 96,
            threads: 1,
            max_nb_reads: 0,
            error_handling: ErrorHandling::Return,
            output_path: PathBuf::from("./"),
            output_tag_name: None,
            output_type: String::from("fastq"),
            write_logs: false,
            sort_logs: false,
        }
    }
}

/// Parse args and set up logging / tracing
pub fn setup() -> Opts {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    Opts::parse()
}
