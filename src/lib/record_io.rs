//! Line oriented access to plain or gzipped FASTQ files.
//!
//! Demultiplexing needs to look at the raw lines of the four input files in lockstep, and to
//! recover from lines that are out of step, so [`RecordStream`] exposes both single lines and
//! whole four line records.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use flate2::{bufread::MultiGzDecoder, write::GzEncoder, Compression};

/// The first byte of a FASTQ record header.
pub const HEADER_MARKER: u8 = b'@';

/// The magic bytes starting every gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

const BUFFER_SIZE: usize = 1 << 16;

/// A plain or gzip compressed output file.
pub enum FastqWriter {
    Plain(BufWriter<File>),
    Gzip(BufWriter<GzEncoder<File>>),
}

impl FastqWriter {
    /// Flush the writer and, for gzip, write the trailer of the member.
    pub fn finish(self) -> io::Result<()> {
        match self {
            FastqWriter::Plain(mut writer) => writer.flush(),
            FastqWriter::Gzip(writer) => {
                let encoder = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
                encoder.finish()?;
                Ok(())
            }
        }
    }
}

impl Write for FastqWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FastqWriter::Plain(writer) => writer.write(buf),
            FastqWriter::Gzip(writer) => writer.write(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            FastqWriter::Plain(writer) => writer.write_all(buf),
            FastqWriter::Gzip(writer) => writer.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FastqWriter::Plain(writer) => writer.flush(),
            FastqWriter::Gzip(writer) => writer.flush(),
        }
    }
}

/// The four lines of a FASTQ record, without line terminators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FastqRecord {
    pub head: Vec<u8>,
    pub seq: Vec<u8>,
    pub strand: Vec<u8>,
    pub qual: Vec<u8>,
}

impl FastqRecord {
    /// True if the header line starts with [`HEADER_MARKER`].
    pub fn has_header(&self) -> bool {
        self.head.first() == Some(&HEADER_MARKER)
    }
}

/// Write a record whose header is rebuilt as `@{barcode}:{id}` where `id` is `id_line` without its
/// leading [`HEADER_MARKER`].
pub fn write_barcoded_record<W: Write>(
    writer: &mut W,
    barcode: &[u8],
    id_line: &[u8],
    seq: &[u8],
    strand: &[u8],
    qual: &[u8],
) -> std::io::Result<()> {
    let id = id_line.strip_prefix(&[HEADER_MARKER]).unwrap_or(id_line);
    writer.write_all(&[HEADER_MARKER])?;
    writer.write_all(barcode)?;
    writer.write_all(b":")?;
    writer.write_all(id)?;
    writer.write_all(b"\n")?;
    for line in [seq, strand, qual] {
        writer.write_all(line)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

/// Open a writer on `path`, gzip compressed when the path ends in `.gz`.
pub fn open_writer<P: AsRef<Path>>(path: P) -> Result<FastqWriter> {
    let path = path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("Unable to create file: {}", path.display()))?;
    let gzipped = path.extension().map_or(false, |ext| ext == "gz" || ext == "bgz");
    Ok(if gzipped {
        let encoder = GzEncoder::new(file, Compression::default());
        FastqWriter::Gzip(BufWriter::with_capacity(BUFFER_SIZE, encoder))
    } else {
        FastqWriter::Plain(BufWriter::with_capacity(BUFFER_SIZE, file))
    })
}

/// Open a plain or gzipped file for reading. Compression is detected from the leading bytes and
/// every member of a multi-member gzip file (e.g. BGZF) is read.
pub fn open_reader<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead + Send>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut raw = BufReader::with_capacity(BUFFER_SIZE, file);
    let head = raw.fill_buf().with_context(|| format!("Failed reading {}", path.display()))?;
    if head.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(BufReader::with_capacity(BUFFER_SIZE, MultiGzDecoder::new(raw))))
    } else {
        Ok(Box::new(raw))
    }
}

/// A FASTQ file read line by line.
pub struct RecordStream {
    reader: Box<dyn BufRead + Send>,
    path: PathBuf,
    lines_read: usize,
}

impl RecordStream {
    /// Open `path` and position the stream at the start of record number `start_record`.
    pub fn open<P: AsRef<Path>>(path: P, start_record: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = open_reader(&path)?;
        let mut stream = Self { reader, path, lines_read: 0 };
        stream.skip_lines(start_record * 4)?;
        Ok(stream)
    }

    /// The number of lines consumed so far, skipped lines included.
    pub fn lines_read(&self) -> usize {
        self.lines_read
    }

    /// Read the next line into `line`, without its terminator. Returns false at end of stream.
    pub fn read_line(&mut self, line: &mut Vec<u8>) -> Result<bool> {
        line.clear();
        let bytes = self
            .reader
            .read_until(b'\n', line)
            .with_context(|| format!("Failed reading from {}", self.path.display()))?;
        if bytes == 0 {
            return Ok(false);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        self.lines_read += 1;
        Ok(true)
    }

    /// Read the next four lines into `record`. Returns false at end of stream.
    pub fn next_record(&mut self, record: &mut FastqRecord) -> Result<bool> {
        if !self.read_line(&mut record.head)? {
            return Ok(false);
        }
        for line in [&mut record.seq, &mut record.strand, &mut record.qual] {
            if !self.read_line(line)? {
                bail!(
                    "Truncated record ending at line {} of {}",
                    self.lines_read,
                    self.path.display()
                );
            }
        }
        Ok(true)
    }

    /// Skip up to `lines` lines, returning how many were actually skipped.
    pub fn skip_lines(&mut self, lines: usize) -> Result<usize> {
        let mut buffer = Vec::with_capacity(256);
        for skipped in 0..lines {
            if !self.read_line(&mut buffer)? {
                return Ok(skipped);
            }
        }
        Ok(lines)
    }
}

/// Count the lines of a plain or gzipped file. A final line without terminator is counted.
pub fn count_lines<P: AsRef<Path>>(path: P) -> Result<usize> {
    let path = path.as_ref();
    let mut reader = open_reader(path)?;
    let mut lines = 0;
    let mut last = b'\n';
    loop {
        let buffer =
            reader.fill_buf().with_context(|| format!("Failed reading {}", path.display()))?;
        if buffer.is_empty() {
            break;
        }
        lines += bytecount::count(buffer, b'\n');
        last = buffer[buffer.len() - 1];
        let consumed = buffer.len();
        reader.consume(consumed);
    }
    if last != b'\n' {
        lines += 1;
    }
    Ok(lines)
}

#[cfg(test)]
mod test {
    use fgoxide::io::Io;
    use rstest::rstest;
    use tempfile::tempdir;

    use super::*;
    use crate::utils::test_commons::{fastq_lines, Fq};

    fn records(n: usize) -> Vec<Fq> {
        (0..n).map(|i| Fq::new(&format!("r{}", i), "ACGT")).collect()
    }

    #[rstest]
    fn test_open_at_start_record(#[values("reads.fastq", "reads.fastq.gz")] name: &str) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        Io::default().write_lines(&path, fastq_lines(&records(5))).unwrap();

        let mut stream = RecordStream::open(&path, 3).unwrap();
        let mut record = FastqRecord::default();
        assert!(stream.next_record(&mut record).unwrap());
        assert_eq!(record.head, b"@r3");
        assert!(record.has_header());
        assert!(stream.next_record(&mut record).unwrap());
        assert_eq!(record.head, b"@r4");
        assert!(!stream.next_record(&mut record).unwrap());
        assert_eq!(stream.lines_read(), 20);
    }

    #[test]
    fn test_open_past_the_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reads.fastq");
        Io::default().write_lines(&path, fastq_lines(&records(2))).unwrap();
        let mut stream = RecordStream::open(&path, 10).unwrap();
        let mut line = vec![];
        assert!(!stream.read_line(&mut line).unwrap());
    }

    #[test]
    fn test_truncated_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reads.fastq");
        Io::default().write_lines(&path, ["@r1", "ACGT", "+"]).unwrap();
        let mut stream = RecordStream::open(&path, 0).unwrap();
        let err = stream.next_record(&mut FastqRecord::default()).unwrap_err();
        assert!(err.to_string().contains("Truncated record"));
    }

    #[test]
    fn test_read_line_strips_carriage_returns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reads.fastq");
        std::fs::write(&path, b"@r1\r\nACGT\n").unwrap();
        let mut stream = RecordStream::open(&path, 0).unwrap();
        let mut line = vec![];
        assert!(stream.read_line(&mut line).unwrap());
        assert_eq!(line, b"@r1");
        assert!(stream.read_line(&mut line).unwrap());
        assert_eq!(line, b"ACGT");
    }

    #[rstest]
    #[case(b"", 0)]
    #[case(b"a\nb\n", 2)]
    #[case(b"a\nb", 2)]
    #[case(b"\n\n\n", 3)]
    fn test_count_lines(#[case] contents: &[u8], #[case] expected: usize) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lines.txt");
        std::fs::write(&path, contents).unwrap();
        assert_eq!(count_lines(&path).unwrap(), expected);
    }

    #[test]
    fn test_count_lines_gzipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reads.fastq.gz");
        Io::default().write_lines(&path, fastq_lines(&records(7))).unwrap();
        assert_eq!(count_lines(&path).unwrap(), 28);
    }

    /// Write `reads` as a gzip file of one member per read.
    fn write_multi_member(path: &Path, reads: &[Fq]) {
        let mut bytes = vec![];
        for (i, read) in reads.iter().enumerate() {
            let member = path.with_extension(format!("{}.gz", i));
            let mut writer = open_writer(&member).unwrap();
            for line in read.lines() {
                writeln!(writer, "{}", line).unwrap();
            }
            writer.finish().unwrap();
            bytes.extend(std::fs::read(&member).unwrap());
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_multi_member_gzip_is_read_to_the_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("members.fastq.gz");
        write_multi_member(&path, &records(3));

        assert_eq!(count_lines(&path).unwrap(), 12);
        let mut stream = RecordStream::open(&path, 1).unwrap();
        let mut record = FastqRecord::default();
        let mut heads = vec![];
        while stream.next_record(&mut record).unwrap() {
            heads.push(record.head.clone());
        }
        assert_eq!(heads, vec![b"@r1".to_vec(), b"@r2".to_vec()]);
    }

    #[rstest]
    fn test_writer_round_trip(#[values("out.fastq", "out.fastq.gz")] name: &str) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        let mut writer = open_writer(&path).unwrap();
        write_barcoded_record(&mut writer, b"GG", b"@r0", b"ACGT", b"+", b"IIII").unwrap();
        writer.finish().unwrap();
        assert_eq!(
            Io::default().read_lines(&path).unwrap(),
            vec!["@GG:r0", "ACGT", "+", "IIII"]
        );
    }

    #[test]
    fn test_write_barcoded_record() {
        let mut out = vec![];
        write_barcoded_record(&mut out, b"AAAACCCC", b"@read1 1:N", b"ACGT", b"+", b"IIII")
            .unwrap();
        assert_eq!(out, b"@AAAACCCC:read1 1:N\nACGT\n+\nIIII\n");
    }
}
