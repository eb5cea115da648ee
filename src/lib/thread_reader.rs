//! A [`BatchReader`] allows for pushing the reading of the R1, R2 and I1 FASTQ files onto a
//! separate thread.
//!
//! The three files are read in lockstep into batches of raw lines, and each batch is checked to hold
//! the same whole number of records for every file before it is sent.

use std::{num::NonZeroUsize, path::PathBuf, thread::JoinHandle};

use anyhow::{ensure, Context, Result};
use flume::{bounded, Receiver};
use log::debug;

use crate::record_io::RecordStream;

/// The number of batches to allow in the reader channel at one time.
const READER_CHANNEL_SIZE: usize = 8;

/// The raw lines of consecutive records of the R1, R2 and I1 files.
#[derive(Debug, Clone, Default)]
pub struct LineBatch {
    /// The 0-based number of the first record of the batch.
    pub first_record: usize,
    pub r1: Vec<Vec<u8>>,
    pub r2: Vec<Vec<u8>>,
    pub i1: Vec<Vec<u8>>,
}

impl LineBatch {
    pub fn num_records(&self) -> usize {
        self.i1.len() / 4
    }

    /// Iterate over the records of the batch as `(R1 lines, R2 lines, I1 lines)`.
    pub fn records(&self) -> impl Iterator<Item = (&[Vec<u8>], &[Vec<u8>], &[Vec<u8>])> {
        self.r1
            .chunks_exact(4)
            .zip(self.r2.chunks_exact(4))
            .zip(self.i1.chunks_exact(4))
            .map(|((r1, r2), i1)| (r1, r2, i1))
    }
}

/// A struct to hold onto the handle for a thread that is reading batches of lines.
pub struct BatchReader {
    /// The [`JoinHandle`] for the thread that is reading.
    pub handle: JoinHandle<Result<()>>,
    /// The channel that will be receiving [`LineBatch`]es.
    pub rx: Receiver<LineBatch>,
}

impl BatchReader {
    /// Create a new [`BatchReader`] that will read `batch_records` records at a time.
    ///
    /// Reading stops at the end of the files, or once more than `max_records` records have been
    /// read when `max_records` is not 0.
    ///
    /// The reader thread fails if the files can't be opened, if they run out of sync, or if it is
    /// unable to send over the channel.
    pub fn new(
        r1: PathBuf,
        r2: PathBuf,
        i1: PathBuf,
        batch_records: NonZeroUsize,
        max_records: usize,
    ) -> Self {
        let (tx, rx) = bounded(READER_CHANNEL_SIZE);
        let handle = std::thread::spawn(move || {
            let paths = [r1, r2, i1];
            let mut streams = [
                RecordStream::open(&paths[0], 0)?,
                RecordStream::open(&paths[1], 0)?,
                RecordStream::open(&paths[2], 0)?,
            ];
            let batch_lines = usize::from(batch_records) * 4;
            let mut first_record = 0;

            loop {
                let mut lines: [Vec<Vec<u8>>; 3] = Default::default();
                for (stream, lines) in streams.iter_mut().zip(lines.iter_mut()) {
                    lines.reserve(batch_lines);
                    let mut line = Vec::new();
                    while lines.len() < batch_lines && stream.read_line(&mut line)? {
                        lines.push(std::mem::take(&mut line));
                    }
                }

                let counts = [lines[0].len(), lines[1].len(), lines[2].len()];
                ensure!(
                    counts.iter().all(|c| *c == counts[0]),
                    "Different read counts: {:?} lines found after record {} for the input fastq files {:?}",
                    counts,
                    first_record,
                    paths,
                );
                if counts[0] == 0 {
                    break;
                }
                ensure!(
                    counts[0] % 4 == 0,
                    "Number of lines is not a multiple of 4 after record {} for the input fastq files {:?}",
                    first_record,
                    paths,
                );

                let [r1, r2, i1] = lines;
                let batch = LineBatch { first_record, r1, r2, i1 };
                first_record += batch.num_records();
                tx.send(batch).context("Failed to send batch from reader")?;
                if max_records != 0 && first_record > max_records {
                    debug!("Stopping after {} records", first_record);
                    break;
                }
            }
            Ok(())
        });

        Self { handle, rx }
    }
}
