//! # epubconv
//!
//! Converts Simplified Chinese EPUB books to Traditional Chinese by
//! rewriting the archive: XHTML, HTML, NCX and OPF members have their text
//! converted, everything else is copied as stored, and member order and
//! compression are kept.
//!
//! The archive is read lazily from any [`ReadAt`] source (an in-memory
//! buffer, a local file, or an HTTP server supporting Range requests), so
//! memory use follows the largest member rather than the whole book.
//!
//! ## Features
//!
//! - BOM-based UTF-8 / UTF-16 detection; converted members are written as UTF-8
//! - Line endings preserved exactly
//! - Optional conversion of member names
//! - `<dc:language>zh-CN</dc:language>` relabelled `zh-TW` in package documents
//! - Bounded concurrent conversion with output kept in archive order
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use epubconv::{ConversionOptions, TextConverter, convert};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let converter = Arc::new(TextConverter::from_tag("zh-TW")?);
//!     let input = std::fs::read("book.epub")?;
//!     let output = convert(input, ConversionOptions::default(), converter).await?;
//!     std::fs::write("book-tw.epub", output)?;
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod cli;
pub mod converter;
pub mod encoding;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod zip;

pub use classify::{Classification, TextKind, classify};
pub use cli::Cli;
pub use converter::{ScriptMapping, TextConverter};
pub use encoding::TextEncoding;
pub use error::{Error, Result};
pub use self::io::{HttpRangeReader, LocalFileReader, MemoryReader, ReadAt};
pub use pipeline::{
    ConversionOptions, ConversionPipeline, ConversionReport, ConvertedArchive, convert,
    suggest_output_name,
};
pub use self::zip::{ArchiveReader, ArchiveWriter, CompressionMethod, DosDateTime, Member, RawName};
