//! ZIP archive reading and writing.
//!
//! ## Architecture
//!
//! - [`structures`]: Data structures representing ZIP format elements (EOCD, members, etc.)
//! - [`parser`]: Low-level parsing of ZIP structures from raw bytes
//! - [`reader`]: Lazy, one-member-at-a-time enumeration of an input archive
//! - [`writer`]: Sequential assembly of an output archive
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! The reader starts from the EOCD and the Central Directory, so members
//! can be listed without touching their data. The writer emits members in
//! the order they are added and writes the Central Directory last.
//!
//! ## Supported Features
//!
//! - Reading standard ZIP and ZIP64 archives
//! - STORED and DEFLATE members (other methods can only be copied verbatim)
//! - Writing standard (non-ZIP64) archives
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - No ZIP64 output

pub mod parser;
pub mod reader;
pub mod structures;
pub mod writer;

pub use parser::ZipParser;
pub use reader::ArchiveReader;
pub use structures::*;
pub use writer::ArchiveWriter;
