//! A library of functionality for demultiplexing paired-end FASTQ files on their index reads.
//!
//! # Overview
//!
//! The flow of data is as follows:
//!
//! - The [`registry::BarcodeRegistry`] loads the reference barcodes of each index type, in one
//!   dictionary or one per replicate.
//! - The [`demux::DemultiplexWorker`]s each read a range of records of the four inputs with
//!   [`record_io::RecordStream`]s, resolve their barcodes with the [`resolver::ReplicateResolver`]
//!   (which relies on the [`matcher::FuzzyMatcher`]) and write accepted reads through an
//!   [`output::OutputRouter`].
//! - The [`run::ParallelScheduler`] splits the records between workers, concatenates their output
//!   shards and merges their [`metrics`].
//! - Without an I2, the [`single_index::SingleIndexDemultiplexer`] processes batches sent by a
//!   [`thread_reader::BatchReader`] on a rayon pool instead.
#![deny(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]
pub mod demux;
pub mod matcher;
pub mod metrics;
pub mod opts;
pub mod output;
pub mod record_io;
pub mod registry;
pub mod resolver;
pub mod run;
pub mod single_index;
pub mod thread_reader;
pub mod utils;
