//! Sequential ZIP archive writer.
//!
//! Members are appended in the order they are added; each gets a Local File
//! Header with known sizes (no data descriptors) followed by its data. The
//! Central Directory and EOCD are written by [`ArchiveWriter::finalize`].

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Crc;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::Write;

use crate::error::{Error, Result};

use super::structures::*;

const VERSION_MADE_BY: u16 = 20;
const VERSION_STORED: u16 = 10;
const VERSION_DEFLATE: u16 = 20;

/// Largest value a classic (non-ZIP64) size or offset field can hold;
/// 0xFFFFFFFF itself is reserved as the ZIP64 marker.
const MAX_CLASSIC_U32: u64 = 0xFFFF_FFFE;
const MAX_CLASSIC_ENTRIES: usize = 0xFFFE;

/// Central directory record kept until finalization.
struct CentralRecord {
    name: Vec<u8>,
    flags: u16,
    method: u16,
    modified: DosDateTime,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    lfh_offset: u32,
}

/// Builds a new archive in memory.
pub struct ArchiveWriter {
    out: Vec<u8>,
    records: Vec<CentralRecord>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self {
            out: Vec::new(),
            records: Vec::new(),
        }
    }

    /// Add a member from its uncompressed content, compressing it with
    /// `method`. Only `Stored` and `Deflate` can be produced.
    pub fn add_member(
        &mut self,
        data: &[u8],
        name: impl Into<RawName>,
        method: CompressionMethod,
        modified: DosDateTime,
    ) -> Result<()> {
        let name = name.into();
        let mut crc = Crc::new();
        crc.update(data);

        match method {
            CompressionMethod::Stored => {
                self.append(&name, method, crc.sum(), data.len() as u64, data, modified)
            }
            CompressionMethod::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                let compressed = encoder.finish()?;
                self.append(
                    &name,
                    method,
                    crc.sum(),
                    data.len() as u64,
                    &compressed,
                    modified,
                )
            }
            CompressionMethod::Unknown(code) => Err(Error::write(format!(
                "cannot compress {} with unsupported method {}",
                name, code
            ))),
        }
    }

    /// Copy a member's stored bytes verbatim under `name`.
    pub fn add_raw(&mut self, raw: &RawMember, name: impl Into<RawName>) -> Result<()> {
        self.append(
            &name.into(),
            raw.compression_method,
            raw.crc32,
            raw.uncompressed_size,
            &raw.data,
            raw.modified,
        )
    }

    fn append(
        &mut self,
        name: &RawName,
        method: CompressionMethod,
        crc32: u32,
        uncompressed_size: u64,
        data: &[u8],
        modified: DosDateTime,
    ) -> Result<()> {
        let name_bytes = name.bytes.as_slice();
        if name_bytes.len() > u16::MAX as usize {
            return Err(Error::write(format!("member name too long: {} bytes", name_bytes.len())));
        }
        let compressed_size = data.len() as u64;
        let lfh_offset = self.out.len() as u64;
        if uncompressed_size > MAX_CLASSIC_U32
            || compressed_size > MAX_CLASSIC_U32
            || lfh_offset > MAX_CLASSIC_U32
        {
            return Err(Error::write(format!(
                "{} does not fit in a non-ZIP64 archive",
                name
            )));
        }

        let flags = name.flags();
        let method_code = method.as_u16();

        self.out.write_all(LFH_SIGNATURE)?;
        self.out.write_u16::<LittleEndian>(version_needed(method))?;
        self.out.write_u16::<LittleEndian>(flags)?;
        self.out.write_u16::<LittleEndian>(method_code)?;
        self.out.write_u16::<LittleEndian>(modified.time)?;
        self.out.write_u16::<LittleEndian>(modified.date)?;
        self.out.write_u32::<LittleEndian>(crc32)?;
        self.out.write_u32::<LittleEndian>(compressed_size as u32)?;
        self.out.write_u32::<LittleEndian>(uncompressed_size as u32)?;
        self.out.write_u16::<LittleEndian>(name_bytes.len() as u16)?;
        self.out.write_u16::<LittleEndian>(0)?;
        self.out.write_all(name_bytes)?;
        self.out.write_all(data)?;

        self.records.push(CentralRecord {
            name: name_bytes.to_vec(),
            flags,
            method: method_code,
            modified,
            crc32,
            compressed_size: compressed_size as u32,
            uncompressed_size: uncompressed_size as u32,
            lfh_offset: lfh_offset as u32,
        });

        tracing::trace!(%name, method = %method, compressed_size, "member written");
        Ok(())
    }

    /// Write the Central Directory and EOCD and return the finished archive.
    ///
    /// Consumes the writer, so it cannot be finalized twice or written to
    /// afterwards.
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        if self.records.len() > MAX_CLASSIC_ENTRIES {
            return Err(Error::write(format!(
                "{} members exceed the non-ZIP64 limit",
                self.records.len()
            )));
        }

        let cd_offset = self.out.len() as u64;
        if cd_offset > MAX_CLASSIC_U32 {
            return Err(Error::write("archive exceeds 4 GiB"));
        }

        let mut cd = Vec::with_capacity(self.records.len() * (CDFH_MIN_SIZE + 32));
        for record in &self.records {
            cd.write_all(CDFH_SIGNATURE)?;
            cd.write_u16::<LittleEndian>(VERSION_MADE_BY)?;
            cd.write_u16::<LittleEndian>(version_needed(CompressionMethod::from_u16(record.method)))?;
            cd.write_u16::<LittleEndian>(record.flags)?;
            cd.write_u16::<LittleEndian>(record.method)?;
            cd.write_u16::<LittleEndian>(record.modified.time)?;
            cd.write_u16::<LittleEndian>(record.modified.date)?;
            cd.write_u32::<LittleEndian>(record.crc32)?;
            cd.write_u32::<LittleEndian>(record.compressed_size)?;
            cd.write_u32::<LittleEndian>(record.uncompressed_size)?;
            cd.write_u16::<LittleEndian>(record.name.len() as u16)?;
            cd.write_u16::<LittleEndian>(0)?; // extra field
            cd.write_u16::<LittleEndian>(0)?; // comment
            cd.write_u16::<LittleEndian>(0)?; // disk number start
            cd.write_u16::<LittleEndian>(0)?; // internal attributes
            cd.write_u32::<LittleEndian>(0)?; // external attributes
            cd.write_u32::<LittleEndian>(record.lfh_offset)?;
            cd.write_all(&record.name)?;
        }

        let cd_size = cd.len() as u64;
        if cd_offset + cd_size > MAX_CLASSIC_U32 {
            return Err(Error::write("archive exceeds 4 GiB"));
        }
        self.out.extend_from_slice(&cd);

        let entries = self.records.len() as u16;
        self.out.write_all(EndOfCentralDirectory::SIGNATURE)?;
        self.out.write_u16::<LittleEndian>(0)?;
        self.out.write_u16::<LittleEndian>(0)?;
        self.out.write_u16::<LittleEndian>(entries)?;
        self.out.write_u16::<LittleEndian>(entries)?;
        self.out.write_u32::<LittleEndian>(cd_size as u32)?;
        self.out.write_u32::<LittleEndian>(cd_offset as u32)?;
        self.out.write_u16::<LittleEndian>(0)?;

        tracing::debug!(members = entries, bytes = self.out.len(), "archive finalized");
        Ok(self.out)
    }
}

impl Default for ArchiveWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn version_needed(method: CompressionMethod) -> u16 {
    match method {
        CompressionMethod::Stored => VERSION_STORED,
        _ => VERSION_DEFLATE,
    }
}
