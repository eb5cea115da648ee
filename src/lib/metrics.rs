//! Functionality pertaining to the collection of metrics during demultiplexing.
//!
//! Each worker fills in its own [`DemuxMetrics`] and returns it when done. The per worker metrics
//! are then merged with [`DemuxMetrics::update_with`] (see [`aggregate`]) before being written.
//!
//! A [`DemuxMetrics`] holds the number of accepted reads per replicate and of rejected reads, and
//! when requested, the number of reads seen for every cell barcode (the concatenation of the four
//! index barcodes of a read). The per index type counts of the `index_cell` and `index_read`
//! reports are derived from the per cell counts when the reports are written.

use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Instant,
};

use ahash::AHashMap;
use anyhow::{Context, Result};
use fgoxide::io::{DelimFile, Io};
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    output::OutputNaming,
    registry::{IndexType, PerIndex},
    resolver::ReadVerdict,
};

/// The header line of the single category reports.
const LOG_HEADER: &str = "#<key>\t<value>";

/// Counts keyed by a barcode or label.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsDict {
    counts: AHashMap<Vec<u8>, usize>,
}

impl StatsDict {
    /// Add one to the count of `key`, returning true if the key had not been seen before.
    pub fn increment(&mut self, key: &[u8]) -> bool {
        self.add(key, 1)
    }

    /// Add `count` to the count of `key`, returning true if the key had not been seen before.
    pub fn add(&mut self, key: &[u8], count: usize) -> bool {
        if let Some(current) = self.counts.get_mut(key) {
            *current += count;
            false
        } else {
            self.counts.insert(key.to_vec(), count);
            true
        }
    }

    pub fn get(&self, key: &[u8]) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], usize)> {
        self.counts.iter().map(|(k, v)| (k.as_slice(), *v))
    }

    pub fn update_with(&mut self, other: Self) {
        if self.counts.is_empty() {
            self.counts = other.counts;
            return;
        }
        for (key, count) in other.counts {
            *self.counts.entry(key).or_insert(0) += count;
        }
    }

    /// Consume the dictionary into entries ranked by decreasing count, ties ordered by key.
    pub fn into_ranked(self) -> Vec<(Vec<u8>, usize)> {
        self.counts
            .into_iter()
            .sorted_unstable_by(|(k1, c1), (k2, c2)| c2.cmp(c1).then_with(|| k1.cmp(k2)))
            .collect()
    }

    /// Consume the dictionary into entries, ranked if `sort` is true.
    pub fn into_entries(self, sort: bool) -> Vec<(Vec<u8>, usize)> {
        if sort {
            self.into_ranked()
        } else {
            self.counts.into_iter().collect()
        }
    }
}

impl<K: AsRef<[u8]>> FromIterator<(K, usize)> for StatsDict {
    fn from_iter<T: IntoIterator<Item = (K, usize)>>(iter: T) -> Self {
        let mut dict = Self::default();
        for (key, count) in iter {
            dict.add(key.as_ref(), count);
        }
        dict
    }
}

/// Per index type counts derived from per cell counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexStats {
    /// The number of distinct cells seen for each index barcode.
    pub cells: PerIndex<StatsDict>,
    /// The number of reads seen for each index barcode.
    pub reads: PerIndex<StatsDict>,
}

impl IndexStats {
    /// Split every cell barcode of `cells` into its index barcodes using the slot `lengths`.
    /// Disabled slots are left out.
    pub fn from_cells(cells: &StatsDict, lengths: &PerIndex<usize>) -> Self {
        let mut stats = Self::default();
        for (barcode, count) in cells.iter() {
            let mut start = 0;
            for index_type in IndexType::ALL {
                let end = (start + lengths[index_type]).min(barcode.len());
                if lengths[index_type] > 0 {
                    let index_barcode = &barcode[start..end];
                    stats.cells[index_type].increment(index_barcode);
                    stats.reads[index_type].add(index_barcode, count);
                }
                start = end;
            }
        }
        stats
    }
}

/// One row of the run summary.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct OutcomeMetric {
    /// `repl1`, `repl2` or `fail`.
    pub outcome: String,
    /// The number of reads with this outcome.
    pub reads: usize,
    /// The fraction of all reads with this outcome.
    pub frac_reads: f64,
}

/// Write the run summary TSV for the given `(outcome, reads)` counts.
pub fn write_summary<P: AsRef<Path>>(path: P, outcomes: &[(String, usize)]) -> Result<()> {
    let total: usize = outcomes.iter().map(|(_, reads)| reads).sum();
    let rows = outcomes.iter().map(|(outcome, reads)| OutcomeMetric {
        outcome: outcome.clone(),
        reads: *reads,
        frac_reads: if total == 0 { 0.0 } else { *reads as f64 / total as f64 },
    });
    let path = path.as_ref().to_path_buf();
    DelimFile::default()
        .write_tsv(&path, rows)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write `entries` as `[category\t]key\tvalue` lines.
pub fn write_entries<W: Write>(
    writer: &mut W,
    category: Option<&str>,
    entries: Vec<(Vec<u8>, usize)>,
) -> Result<()> {
    for (key, count) in entries {
        if let Some(category) = category {
            write!(writer, "{}\t", category)?;
        }
        writer.write_all(&key)?;
        writeln!(writer, "\t{}", count)?;
    }
    Ok(())
}

/// The metrics collected by a worker, or merged over workers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DemuxMetrics {
    /// The number of accepted reads of each replicate, replicate 1 first.
    pub accepted: [usize; 2],
    /// The number of rejected reads.
    pub rejected: usize,
    /// The number of accepted reads per cell barcode, replicate 1 first.
    pub success: [StatsDict; 2],
    /// The number of rejected reads per cell barcode.
    pub fail: StatsDict,
}

impl DemuxMetrics {
    /// The number of reads evaluated.
    pub fn total(&self) -> usize {
        self.accepted.iter().sum::<usize>() + self.rejected
    }

    /// Count the outcome of a read.
    pub fn count(&mut self, verdict: &ReadVerdict) {
        match verdict.replicate {
            Some(replicate) => self.accepted[replicate - 1] += 1,
            None => self.rejected += 1,
        }
    }

    /// Track the cell barcode of a read, as returned by [`ReadVerdict::write_cell_barcode`].
    pub fn record_cell(&mut self, verdict: &ReadVerdict, cell_barcode: &[u8]) {
        match verdict.replicate {
            Some(replicate) => self.success[replicate - 1].increment(cell_barcode),
            None => self.fail.increment(cell_barcode),
        };
    }

    pub fn update_with(&mut self, other: Self) {
        let DemuxMetrics { accepted, rejected, success, fail } = other;
        for (mine, theirs) in self.accepted.iter_mut().zip(accepted) {
            *mine += theirs;
        }
        self.rejected += rejected;
        for (mine, theirs) in self.success.iter_mut().zip(success) {
            mine.update_with(theirs);
        }
        self.fail.update_with(fail);
    }

    /// The `(outcome, reads)` counts of the run summary.
    pub fn outcomes(&self, replicates: usize) -> Vec<(String, usize)> {
        (1..=replicates)
            .map(|r| (format!("repl{}", r), self.accepted[r - 1]))
            .chain(std::iter::once(("fail".to_string(), self.rejected)))
            .collect()
    }

    /// The labelled counts of the `stats` report. Labels with a zero count are left out.
    pub fn stats(&self, replicates: usize) -> StatsDict {
        let mut stats = StatsDict::default();
        for replicate in 1..=replicates {
            let index = replicate - 1;
            let cells = self.success[index].len();
            let reads = self.accepted[index];
            stats.add(format!("Number of cells repl. {}", replicate).as_bytes(), cells);
            stats.add(format!("Number of reads repl. {}", replicate).as_bytes(), reads);
        }
        stats.add(b"number of cells (FAIL)", self.fail.len());
        stats.add(b"number of reads (FAIL)", self.rejected);
        stats.counts.retain(|_, count| *count > 0);
        stats
    }

    /// Write the log reports:
    /// - `report{tag}_{stats,fail,success_repl{N}}.log` for the single category reports
    /// - `report{tag}_index_{cell,read}.log` for the per index type success counts
    /// - `report{tag}_index_{cell,read}_fail.log` for the per index type failure counts
    pub fn write_reports(
        self,
        naming: &OutputNaming,
        replicates: usize,
        lengths: &PerIndex<usize>,
        sort: bool,
    ) -> Result<()> {
        let start = Instant::now();
        info!("Writing reports to {}", naming.output_dir().display());

        let (success_cells, success_reads): (Vec<_>, Vec<_>) = self.success[..replicates]
            .iter()
            .map(|cells| {
                let stats = IndexStats::from_cells(cells, lengths);
                (stats.cells, stats.reads)
            })
            .unzip();
        let fail_stats = IndexStats::from_cells(&self.fail, lengths);
        write_index_report(naming, "index_cell", success_cells, fail_stats.cells, sort)?;
        write_index_report(naming, "index_read", success_reads, fail_stats.reads, sort)?;

        let stats = self.stats(replicates);
        let DemuxMetrics { success, fail, .. } = self;
        let logs = std::iter::once(("stats".to_string(), stats))
            .chain(std::iter::once(("fail".to_string(), fail)))
            .chain(
                success
                    .into_iter()
                    .take(replicates)
                    .enumerate()
                    .map(|(i, dict)| (format!("success_repl{}", i + 1), dict)),
            );
        for (category, dict) in logs {
            let mut writer = report_writer(naming.report_path(&format!("{}.log", category)))?;
            writeln!(writer, "{}", LOG_HEADER)?;
            write_entries(&mut writer, None, dict.into_entries(sort))?;
            writer.flush()?;
        }

        info!("Writing reports finished in {:.2}s", start.elapsed().as_secs_f64());
        Ok(())
    }
}

/// Merge the metrics returned by each worker.
pub fn aggregate<I: IntoIterator<Item = DemuxMetrics>>(per_worker: I) -> DemuxMetrics {
    per_worker.into_iter().fold(DemuxMetrics::default(), |mut merged, metrics| {
        merged.update_with(metrics);
        merged
    })
}

/// Open a report file for writing.
pub fn report_writer(path: PathBuf) -> Result<impl Write> {
    Io::default().new_writer(&path).with_context(|| format!("Unable to create {}", path.display()))
}

/// Write the per index type counts of every replicate to `report{tag}_{name}.log`, and the
/// failure counts to `report{tag}_{name}_fail.log`.
fn write_index_report(
    naming: &OutputNaming,
    name: &str,
    success: Vec<PerIndex<StatsDict>>,
    fail: PerIndex<StatsDict>,
    sort: bool,
) -> Result<()> {
    let mut writer = report_writer(naming.report_path(&format!("{}.log", name)))?;
    for (replicate, per_index) in success.into_iter().enumerate() {
        for (index_type, dict) in per_index {
            let category = format!("success_{}_repl{}", index_type, replicate + 1);
            writeln!(writer, "#### {}", category)?;
            write_entries(&mut writer, Some(&category), dict.into_entries(sort))?;
        }
    }
    writer.flush()?;

    let mut writer = report_writer(naming.report_path(&format!("{}_fail.log", name)))?;
    for (index_type, dict) in fail {
        let category = format!("fail_{}", index_type);
        if sort {
            writeln!(writer, "#### {}", category)?;
        }
        write_entries(&mut writer, Some(&category), dict.into_entries(sort))?;
    }
    writer.flush()?;
    Ok(())
}
