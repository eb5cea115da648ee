//! Reference barcode dictionaries.
//!
//! A [`BarcodeRegistry`] holds, for each of the four [`IndexType`]s, the set of reference barcodes
//! reads are matched against. References are loaded from tab-delimited index files with one entry
//! per line:
//!
//! ```text
//! <index type>\t<barcode>[\t<tag number>]
//! ```
//!
//! Index files are given either as a single "no replicate" source, or as a pair of sources, one per
//! replicate. A [`RangeFilter`] may restrict which entries of an index type are retained, based on
//! the ordinal position of the entry in its source (or on its explicit tag number).

use std::{
    io::Write,
    ops::{Index, IndexMut},
    path::{Path, PathBuf},
    str::FromStr,
};

use ahash::AHashSet;
use anyhow::{Context, Result};
use fgoxide::io::Io;
use log::{info, warn};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

/// The four barcode slots of a read pair, in the order they are concatenated into a cell barcode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum IndexType {
    /// Head of the I1 read.
    P7,
    /// Tail of the I1 read.
    I7,
    /// Head of the I2 read.
    I5,
    /// Tail of the I2 read.
    P5,
}

impl IndexType {
    /// All index types in slot order.
    pub const ALL: [IndexType; 4] = [IndexType::P7, IndexType::I7, IndexType::I5, IndexType::P5];
}

/// A value for each of the four [`IndexType`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerIndex<T> {
    values: [T; 4],
}

impl<T> PerIndex<T> {
    /// Build a [`PerIndex`] by calling `f` once for each [`IndexType`].
    pub fn from_fn(mut f: impl FnMut(IndexType) -> T) -> Self {
        Self { values: std::array::from_fn(|i| f(IndexType::ALL[i])) }
    }

    /// Iterate over `(index type, value)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (IndexType, &T)> {
        IndexType::iter().zip(self.values.iter())
    }
}

impl<T> IntoIterator for PerIndex<T> {
    type Item = (IndexType, T);
    type IntoIter = std::iter::Zip<std::array::IntoIter<IndexType, 4>, std::array::IntoIter<T, 4>>;

    fn into_iter(self) -> Self::IntoIter {
        IndexType::ALL.into_iter().zip(self.values)
    }
}

impl<T> Index<IndexType> for PerIndex<T> {
    type Output = T;

    fn index(&self, index: IndexType) -> &Self::Output {
        &self.values[index as usize]
    }
}

impl<T> IndexMut<IndexType> for PerIndex<T> {
    fn index_mut(&mut self, index: IndexType) -> &mut Self::Output {
        &mut self.values[index as usize]
    }
}

/// Errors raised while building a registry. All of them are fatal configuration errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Line {line_number} in index {path} is not conform: {line:?}")]
    MalformedLine { path: String, line_number: usize, line: String },

    #[error("Tag string {barcode} for {index_type} is not conform: it must be longer than the {max_mistakes} mistakes allowed")]
    BarcodeTooShort { index_type: IndexType, barcode: String, max_mistakes: usize },

    #[error("Tag string {barcode} for tag id {index_type} has length {found} while previous {index_type} tags have length {expected}")]
    InconsistentLength { index_type: IndexType, barcode: String, expected: usize, found: usize },

    #[error("Invalid item {item:?} in the {index_type} plates/ranges definition")]
    InvalidRange { index_type: IndexType, item: String },

    #[error("Both plates and ranges were defined for {0}")]
    PlatesAndRanges(IndexType),

    #[error("Plates and ranges can only restrict i5 and p7 indexes, not {0}")]
    UnsupportedRangeType(IndexType),
}

/// The set of accepted 1-based tag numbers for each index type.
///
/// An index type without a set (or with an empty one) is unrestricted.
#[derive(Debug, Clone, Default)]
pub struct RangeFilter {
    accepted: PerIndex<Option<AHashSet<usize>>>,
}

impl RangeFilter {
    /// Build the filter from the optional plate and range definitions of the i5 and p7 indexes.
    pub fn from_definitions(
        i5_plates: Option<&str>,
        i5_ranges: Option<&str>,
        p7_plates: Option<&str>,
        p7_ranges: Option<&str>,
        plate_size: usize,
    ) -> Result<Self, RegistryError> {
        let mut filter = Self::default();
        for (index_type, plates, ranges) in
            [(IndexType::I5, i5_plates, i5_ranges), (IndexType::P7, p7_plates, p7_ranges)]
        {
            match (plates, ranges) {
                (Some(_), Some(_)) => return Err(RegistryError::PlatesAndRanges(index_type)),
                (Some(plates), None) => filter.restrict(index_type, plates, plate_size)?,
                (None, Some(ranges)) => filter.restrict(index_type, ranges, 1)?,
                (None, None) => (),
            }
        }
        Ok(filter)
    }

    /// Restrict `index_type` to the blocks listed in `definition`.
    ///
    /// The definition is a comma separated list of block numbers (`3`) or inclusive block ranges
    /// (`1-4`). Block `b` covers the tag numbers `(b - 1) * block_size + 1 ..= b * block_size`.
    pub fn restrict(
        &mut self,
        index_type: IndexType,
        definition: &str,
        block_size: usize,
    ) -> Result<(), RegistryError> {
        if !matches!(index_type, IndexType::I5 | IndexType::P7) {
            return Err(RegistryError::UnsupportedRangeType(index_type));
        }
        let invalid = |item: &str| RegistryError::InvalidRange {
            index_type,
            item: item.to_string(),
        };
        let parse_block = |value: &str, item: &str| -> Result<usize, RegistryError> {
            match value.trim().parse::<usize>() {
                Ok(block) if block > 0 => Ok(block),
                _ => Err(invalid(item)),
            }
        };

        let accepted = self.accepted[index_type].get_or_insert_with(AHashSet::new);
        for item in definition.split(',') {
            let (first, last) = match item.split_once('-') {
                Some((begin, end)) => (parse_block(begin, item)?, parse_block(end, item)?),
                None => {
                    let block = parse_block(item, item)?;
                    (block, block)
                }
            };
            for block in first..=last {
                accepted.extend((block - 1) * block_size + 1..=block * block_size);
            }
        }
        Ok(())
    }

    /// True if entry number `tag_number` of `index_type` should be retained.
    pub fn accepts(&self, index_type: IndexType, tag_number: usize) -> bool {
        match &self.accepted[index_type] {
            Some(accepted) if !accepted.is_empty() => accepted.contains(&tag_number),
            _ => true,
        }
    }
}

/// The reference barcodes of a single source, bucketed by index type.
#[derive(Debug, Clone, Default)]
pub struct BarcodeDict {
    buckets: PerIndex<AHashSet<Vec<u8>>>,
}

impl BarcodeDict {
    /// The references for `index_type`.
    pub fn bucket(&self, index_type: IndexType) -> &AHashSet<Vec<u8>> {
        &self.buckets[index_type]
    }

    pub fn insert(&mut self, index_type: IndexType, barcode: &[u8]) {
        self.buckets[index_type].insert(barcode.to_vec());
    }

    /// The total number of references over all index types.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|(_, b)| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load references from `paths`.
    ///
    /// `lengths` holds the canonical barcode length of each index type (0 if not yet known) and is
    /// updated with the length of the first entry seen for a type. Every retained entry is written
    /// to `used_barcodes` as `<type>\t<barcode>\t<tag number>`.
    pub fn load<P: AsRef<Path>>(
        paths: &[P],
        lengths: &mut PerIndex<usize>,
        max_mistakes: &PerIndex<usize>,
        range_filter: &RangeFilter,
        used_barcodes: &mut impl Write,
    ) -> Result<Self> {
        let io = Io::default();
        let mut dict = Self::default();
        let mut counters = PerIndex::<usize>::default();

        for path in paths {
            let path = path.as_ref().to_path_buf();
            let lines = io
                .read_lines(&path)
                .with_context(|| format!("Failed to read index file {}", path.display()))?;

            for (line_number, line) in lines.iter().enumerate() {
                let line = line.trim_end_matches(['\r', '\n']);
                if line.trim().is_empty() {
                    continue;
                }
                let malformed = || RegistryError::MalformedLine {
                    path: path.display().to_string(),
                    line_number: line_number + 1,
                    line: line.to_string(),
                };
                let fields: Vec<&str> = line.split('\t').collect();
                if fields.len() < 2 || fields.len() > 3 {
                    return Err(malformed().into());
                }

                let index_type = match IndexType::from_str(fields[0]) {
                    Ok(index_type) => index_type,
                    Err(_) => {
                        warn!("Index type not recognised in line {:?}, skipping", line);
                        continue;
                    }
                };
                let barcode = fields[1];
                dict.check_barcode(index_type, barcode, lengths, max_mistakes)?;

                counters[index_type] += 1;
                let tag_number = fields
                    .get(2)
                    .and_then(|field| field.trim().parse::<usize>().ok())
                    .unwrap_or(counters[index_type]);

                if range_filter.accepts(index_type, tag_number) {
                    dict.insert(index_type, barcode.as_bytes());
                    writeln!(used_barcodes, "{}\t{}\t{}", index_type, barcode, tag_number)?;
                }
            }
        }
        Ok(dict)
    }

    fn check_barcode(
        &self,
        index_type: IndexType,
        barcode: &str,
        lengths: &mut PerIndex<usize>,
        max_mistakes: &PerIndex<usize>,
    ) -> Result<(), RegistryError> {
        if barcode.len() <= max_mistakes[index_type] {
            return Err(RegistryError::BarcodeTooShort {
                index_type,
                barcode: barcode.to_string(),
                max_mistakes: max_mistakes[index_type],
            });
        }
        match lengths[index_type] {
            0 => lengths[index_type] = barcode.len(),
            expected if expected != barcode.len() => {
                return Err(RegistryError::InconsistentLength {
                    index_type,
                    barcode: barcode.to_string(),
                    expected,
                    found: barcode.len(),
                })
            }
            _ => (),
        }
        Ok(())
    }
}

/// Where the reference barcodes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSources {
    /// No index file at all.
    None,
    /// One or more files forming a single dictionary.
    NoReplicate(Vec<PathBuf>),
    /// One file per replicate.
    Replicates { repl1: PathBuf, repl2: PathBuf },
}

/// The dictionaries held by a [`BarcodeRegistry`].
#[derive(Debug, Clone)]
pub enum Dictionaries {
    Empty,
    NoReplicate(BarcodeDict),
    Replicates(BarcodeDict, BarcodeDict),
}

/// Settings that shape a [`BarcodeRegistry`] beyond its sources.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Slot length used when there is no index file, and for accept-all index types.
    pub taglength: usize,
    /// Slot length of an accept-all i5 index, `taglength` if 0.
    pub taglength_i5: usize,
    /// Index types for which any barcode without an `N` is accepted.
    pub accept_all: Vec<IndexType>,
    /// Accept every read without any barcode check.
    pub use_no_index: bool,
    /// Maximum number of mismatches allowed per index type.
    pub max_mistakes: PerIndex<usize>,
    pub range_filter: RangeFilter,
}

/// The reference barcodes of a run along with the slot geometry they imply.
#[derive(Debug, Clone)]
pub struct BarcodeRegistry {
    dictionaries: Dictionaries,
    lengths: PerIndex<usize>,
    accept_all: PerIndex<bool>,
    passthrough: bool,
}

impl BarcodeRegistry {
    /// Load a registry from `sources`.
    ///
    /// When index files are given, an audit file `used_barcodes{name}.txt` (with `name` empty,
    /// `repl1` or `repl2`) is written to `output_dir` listing every retained reference.
    pub fn load<P: AsRef<Path>>(
        sources: &IndexSources,
        config: &RegistryConfig,
        output_dir: P,
    ) -> Result<Self> {
        let mut lengths = PerIndex::<usize>::default();
        let mut accept_all = PerIndex::<bool>::default();
        for &index_type in &config.accept_all {
            lengths[index_type] = if index_type == IndexType::I5 && config.taglength_i5 > 0 {
                config.taglength_i5
            } else {
                config.taglength
            };
            accept_all[index_type] = true;
        }

        let load_dict = |paths: &[PathBuf], name: &str, lengths: &mut PerIndex<usize>| {
            let used_path = output_dir.as_ref().join(format!("used_barcodes{}.txt", name));
            let mut used_barcodes = Io::default().new_writer(&used_path).with_context(|| {
                format!("Unable to create file: {}", used_path.display())
            })?;
            let dict = BarcodeDict::load(
                paths,
                lengths,
                &config.max_mistakes,
                &config.range_filter,
                &mut used_barcodes,
            )?;
            used_barcodes.flush()?;
            if dict.is_empty() {
                warn!("No reference barcode retained from {:?}", paths);
            } else {
                info!("Loaded {} reference barcodes from {:?}", dict.len(), paths);
            }
            Ok::<_, anyhow::Error>(dict)
        };

        let (dictionaries, passthrough) = match sources {
            IndexSources::NoReplicate(paths) => {
                (Dictionaries::NoReplicate(load_dict(paths, "", &mut lengths)?), config.use_no_index)
            }
            IndexSources::Replicates { repl1, repl2 } => {
                let repl1 = load_dict(std::slice::from_ref(repl1), "repl1", &mut lengths)?;
                let repl2 = load_dict(std::slice::from_ref(repl2), "repl2", &mut lengths)?;
                (Dictionaries::Replicates(repl1, repl2), config.use_no_index)
            }
            IndexSources::None if !config.accept_all.is_empty() => {
                info!(
                    "No index file given, barcodes will be accepted for: {}",
                    config.accept_all.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
                );
                (Dictionaries::Empty, config.use_no_index)
            }
            IndexSources::None => {
                info!("No index file given, setting all tag lengths to {}", config.taglength);
                lengths = PerIndex::from_fn(|_| config.taglength);
                (Dictionaries::Empty, true)
            }
        };

        Ok(Self { dictionaries, lengths, accept_all, passthrough })
    }

    /// Build a registry directly from dictionaries, used where the lengths are already known.
    pub fn new(
        dictionaries: Dictionaries,
        lengths: PerIndex<usize>,
        accept_all: PerIndex<bool>,
        passthrough: bool,
    ) -> Self {
        Self { dictionaries, lengths, accept_all, passthrough }
    }

    pub fn dictionaries(&self) -> &Dictionaries {
        &self.dictionaries
    }

    /// The slot length of each index type, 0 for a disabled slot.
    pub fn lengths(&self) -> &PerIndex<usize> {
        &self.lengths
    }

    pub fn accept_all(&self) -> &PerIndex<bool> {
        &self.accept_all
    }

    /// True if every read is accepted without looking at its barcodes.
    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// The number of replicates reads can be assigned to.
    pub fn num_replicates(&self) -> usize {
        match self.dictionaries {
            Dictionaries::Replicates(..) => 2,
            _ => 1,
        }
    }
}
