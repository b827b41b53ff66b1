use flate2::Crc;
use flate2::read::DeflateDecoder;
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io::ReadAt;

use super::parser::ZipParser;
use super::structures::{CompressionMethod, Member, RawMember};

/// Lazily enumerates the members of an archive.
///
/// Opening reads only the central directory. Each call to
/// [`next_entry`](Self::next_entry) parses one more directory record, and
/// member data is fetched only when asked for, so memory scales with the
/// largest member being processed rather than with the archive.
pub struct ArchiveReader<R: ReadAt> {
    parser: ZipParser<R>,
    directory: Vec<u8>,
    position: u64,
    remaining: u64,
}

impl<R: ReadAt> ArchiveReader<R> {
    /// Locate and load the central directory.
    pub async fn open(reader: Arc<R>) -> Result<Self> {
        let parser = ZipParser::new(reader);
        let info = parser.directory_info().await?;
        let directory = parser.read_central_directory(&info).await?;

        tracing::debug!(
            entries = info.total_entries,
            directory_bytes = info.size,
            "opened archive"
        );

        Ok(Self {
            parser,
            directory,
            position: 0,
            remaining: info.total_entries,
        })
    }

    /// The next file member in directory order, or `None` once all records
    /// have been read. Directory entries are skipped.
    pub fn next_entry(&mut self) -> Result<Option<Member>> {
        while self.remaining > 0 {
            let mut cursor = Cursor::new(self.directory.as_slice());
            cursor.set_position(self.position);
            let member = self.parser.parse_cdfh(&mut cursor)?;
            self.position = cursor.position();
            self.remaining -= 1;

            if member.is_directory {
                tracing::trace!(name = %member.name, "skipping directory entry");
                continue;
            }
            return Ok(Some(member));
        }
        Ok(None)
    }

    /// The member's stored (possibly compressed) bytes, untouched.
    pub async fn read_raw(&self, member: &Member) -> Result<RawMember> {
        if member.is_encrypted() {
            return Err(Error::corrupt(format!(
                "{} is encrypted; encrypted members are not supported",
                member.name
            )));
        }

        let data_offset = self.parser.get_data_offset(member).await?;
        if data_offset.saturating_add(member.compressed_size) > self.parser.size() {
            return Err(Error::corrupt(format!(
                "data of {} extends past the end of the archive",
                member.name
            )));
        }

        let mut data = vec![0u8; member.compressed_size as usize];
        self.parser.read_exact_at(data_offset, &mut data).await?;

        Ok(RawMember {
            compression_method: member.compression_method,
            crc32: member.crc32,
            uncompressed_size: member.uncompressed_size,
            modified: member.modified(),
            data,
        })
    }

    /// The member's decompressed content, checked against the recorded size
    /// and CRC-32.
    pub async fn read_content(&self, member: &Member) -> Result<Vec<u8>> {
        let raw = self.read_raw(member).await?;

        let data = match raw.compression_method {
            CompressionMethod::Stored => raw.data,
            CompressionMethod::Deflate => inflate(&raw.data, member)?,
            CompressionMethod::Unknown(code) => {
                return Err(Error::corrupt(format!(
                    "{} uses unsupported compression method {}",
                    member.name, code
                )));
            }
        };

        if data.len() as u64 != member.uncompressed_size {
            return Err(Error::corrupt(format!(
                "{} decompressed to {} bytes, expected {}",
                member.name,
                data.len(),
                member.uncompressed_size
            )));
        }

        let mut crc = Crc::new();
        crc.update(&data);
        if crc.sum() != member.crc32 {
            return Err(Error::corrupt(format!(
                "CRC mismatch for {}: computed {:08x}, recorded {:08x}",
                member.name,
                crc.sum(),
                member.crc32
            )));
        }

        Ok(data)
    }
}

fn inflate(compressed: &[u8], member: &Member) -> Result<Vec<u8>> {
    // Read at most one byte past the recorded size so an oversized stream is
    // reported as a size mismatch without inflating all of it.
    let limit = member.uncompressed_size.saturating_add(1);
    let mut out = Vec::with_capacity(member.uncompressed_size.min(1 << 24) as usize);
    DeflateDecoder::new(compressed)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(|e| Error::corrupt(format!("failed to inflate {}: {}", member.name, e)))?;
    Ok(out)
}
