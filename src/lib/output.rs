//! Output file naming and the writers demultiplexed reads are routed to.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use ahash::AHashMap;
use anyhow::{anyhow, Context, Result};
use fgoxide::io::Io;
use log::warn;

use crate::{
    record_io::{open_writer, write_barcoded_record, FastqRecord, FastqWriter},
    registry::{IndexType, PerIndex, RegistryError},
};

/// The destination of a demultiplexed read pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutputKey {
    /// The outputs of a replicate, numbered from 1.
    Replicate(usize),
    /// The outputs of a routing tag.
    Routed(String),
    /// The outputs of reads with no routing tag.
    Default,
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKey::Replicate(replicate) => write!(f, "repl{}", replicate),
            OutputKey::Routed(tag) => write!(f, "{}", tag),
            OutputKey::Default => write!(f, "Default"),
        }
    }
}

/// Builds output file names from the input R1/R2 names.
///
/// Names have the form
/// `{output_dir}/{prefix}{stem}{tag}[_{route}].demultiplexed.R{1,2}.repl{N}.{type}{ext}` where
/// `stem` is the input file name without `.{type}{ext}` and `ext` is the compression extension of
/// the R1 input (e.g. `.gz`), if any.
#[derive(Debug, Clone)]
pub struct OutputNaming {
    output_dir: PathBuf,
    stems: [String; 2],
    tag: String,
    output_type: String,
    extension: String,
}

impl OutputNaming {
    /// `tag` is appended to the stem as is, so should already carry its `_` separator.
    pub fn new<P: AsRef<Path>>(
        output_dir: P,
        fastq_r1: &Path,
        fastq_r2: &Path,
        tag: &str,
        output_type: &str,
    ) -> Self {
        let mut extension = fastq_r1
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        if extension == format!(".{}", output_type) {
            extension.clear();
        }
        let suffix = format!(".{}{}", output_type, extension);
        let stem = |path: &Path| {
            let name =
                path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            name.strip_suffix(&suffix).map(str::to_string).unwrap_or(name)
        };
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            stems: [stem(fastq_r1), stem(fastq_r2)],
            tag: tag.to_string(),
            output_type: output_type.to_string(),
            extension,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// The R1 and R2 paths for `replicate`, optionally for a routing tag.
    pub fn paths(&self, prefix: &str, replicate: usize, route: Option<&str>) -> (PathBuf, PathBuf) {
        let path = |read: usize| {
            let route = route.map(|r| format!("_{}", r)).unwrap_or_default();
            self.output_dir.join(format!(
                "{}{}{}{}.demultiplexed.R{}.repl{}.{}{}",
                prefix,
                self.stems[read - 1],
                self.tag,
                route,
                read,
                replicate,
                self.output_type,
                self.extension
            ))
        };
        (path(1), path(2))
    }

    /// The path of a report file: `{output_dir}/report{tag}_{name}`.
    pub fn report_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("report{}_{}", self.tag, name))
    }
}

/// An open R1/R2 writer pair.
struct WriterPair {
    r1: FastqWriter,
    r2: FastqWriter,
    paths: (PathBuf, PathBuf),
    records: usize,
}

/// The outcome of a finished writer pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedOutput {
    pub key: OutputKey,
    pub records: usize,
    pub r1: PathBuf,
    pub r2: PathBuf,
}

/// Routes read pairs to R1/R2 writer pairs.
#[derive(Default)]
pub struct OutputRouter {
    pairs: BTreeMap<OutputKey, WriterPair>,
}

impl OutputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A router with one writer pair per replicate, for files prefixed with `prefix`.
    pub fn for_replicates(naming: &OutputNaming, prefix: &str, replicates: usize) -> Result<Self> {
        let mut router = Self::new();
        for replicate in 1..=replicates {
            let (r1, r2) = naming.paths(prefix, replicate, None);
            router.add(OutputKey::Replicate(replicate), r1, r2)?;
        }
        Ok(router)
    }

    /// A router with a default writer pair, and one writer pair per tag of `routes`.
    pub fn for_routes(naming: &OutputNaming, routes: &OutputRoutes) -> Result<Self> {
        let mut router = Self::new();
        let (r1, r2) = naming.paths("", 1, None);
        router.add(OutputKey::Default, r1, r2)?;
        for tag in routes.tags() {
            let (r1, r2) = naming.paths("", 1, Some(tag));
            router.add(OutputKey::Routed(tag.to_string()), r1, r2)?;
        }
        Ok(router)
    }

    /// Open a writer pair for `key`.
    pub fn add(&mut self, key: OutputKey, r1: PathBuf, r2: PathBuf) -> Result<()> {
        let pair =
            WriterPair { r1: open_writer(&r1)?, r2: open_writer(&r2)?, paths: (r1, r2), records: 0 };
        self.pairs.insert(key, pair);
        Ok(())
    }

    fn pair(&mut self, key: &OutputKey) -> Result<&mut WriterPair> {
        self.pairs.get_mut(key).ok_or_else(|| anyhow!("No output configured for {}", key))
    }

    /// Write a read pair with headers rebuilt from `barcode` and the given id lines.
    pub fn write_pair(
        &mut self,
        key: &OutputKey,
        barcode: &[u8],
        (r1_id, r1): (&[u8], &FastqRecord),
        (r2_id, r2): (&[u8], &FastqRecord),
    ) -> Result<()> {
        let pair = self.pair(key)?;
        write_barcoded_record(&mut pair.r1, barcode, r1_id, &r1.seq, &r1.strand, &r1.qual)
            .with_context(|| format!("Failed writing to {}", pair.paths.0.display()))?;
        write_barcoded_record(&mut pair.r2, barcode, r2_id, &r2.seq, &r2.strand, &r2.qual)
            .with_context(|| format!("Failed writing to {}", pair.paths.1.display()))?;
        pair.records += 1;
        Ok(())
    }

    /// Write already formatted R1 and R2 bytes holding `records` read pairs.
    pub fn write_formatted(
        &mut self,
        key: &OutputKey,
        r1: &[u8],
        r2: &[u8],
        records: usize,
    ) -> Result<()> {
        let pair = self.pair(key)?;
        pair.r1
            .write_all(r1)
            .with_context(|| format!("Failed writing to {}", pair.paths.0.display()))?;
        pair.r2
            .write_all(r2)
            .with_context(|| format!("Failed writing to {}", pair.paths.1.display()))?;
        pair.records += records;
        Ok(())
    }

    /// Flush and close every writer.
    pub fn finish(self) -> Result<Vec<FinishedOutput>> {
        let mut finished = Vec::with_capacity(self.pairs.len());
        for (key, pair) in self.pairs {
            let WriterPair { r1, r2, paths, records } = pair;
            for (writer, path) in [(r1, &paths.0), (r2, &paths.1)] {
                writer.finish().with_context(|| format!("Failed to close {}", path.display()))?;
            }
            let (r1, r2) = paths;
            finished.push(FinishedOutput { key, records, r1, r2 });
        }
        Ok(finished)
    }
}

/// Maps index barcodes to the routing tag of their outputs.
#[derive(Debug, Clone, Default)]
pub struct OutputRoutes {
    routes: PerIndex<AHashMap<Vec<u8>, String>>,
}

impl OutputRoutes {
    /// Load routes from a file of `type\tbarcode\ttag` lines.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lines = Io::default()
            .read_lines(&path)
            .with_context(|| format!("Failed to read output files index {}", path.display()))?;
        let mut routes = Self::default();
        for (line_number, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
            if fields.len() != 3 {
                return Err(RegistryError::MalformedLine {
                    path: path.display().to_string(),
                    line_number: line_number + 1,
                    line: line.clone(),
                }
                .into());
            }
            match IndexType::from_str(fields[0]) {
                Ok(index_type) => routes.insert(index_type, fields[1].as_bytes(), fields[2]),
                Err(_) => warn!("Index type not recognised in line {:?}, skipping", line),
            }
        }
        Ok(routes)
    }

    pub fn insert(&mut self, index_type: IndexType, barcode: &[u8], tag: &str) {
        self.routes[index_type].insert(barcode.to_vec(), tag.to_string());
    }

    /// The routing tag of `barcode`, if any.
    pub fn tag(&self, index_type: IndexType, barcode: &[u8]) -> Option<&str> {
        self.routes[index_type].get(barcode).map(String::as_str)
    }

    /// The distinct routing tags.
    pub fn tags(&self) -> BTreeSet<&str> {
        self.routes.iter().flat_map(|(_, r)| r.values().map(String::as_str)).collect()
    }
}
