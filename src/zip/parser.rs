//! Low-level ZIP archive parser.
//!
//! This module handles the binary parsing of ZIP file structures,
//! reading from any source that implements the [`ReadAt`] trait.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Read the Central Directory bytes (metadata only)
//! 4. Parse one Central Directory record at a time as members are requested
//! 5. For content, read each member's Local File Header and data

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Read};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io::ReadAt;

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Location and size of the central directory.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryInfo {
    pub offset: u64,
    pub size: u64,
    pub total_entries: u64,
}

/// Low-level ZIP file parser.
///
/// Generic over the reader type to support in-memory buffers, local files
/// and HTTP sources. Typically used through
/// [`ArchiveReader`](super::ArchiveReader) rather than directly.
pub struct ZipParser<R: ReadAt> {
    /// The underlying data source
    reader: Arc<R>,
    /// Total size of the archive in bytes
    size: u64,
}

impl<R: ReadAt> ZipParser<R> {
    pub fn new(reader: Arc<R>) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    /// Total size of the archive in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fill `buf` from `offset`, treating a short read as a truncated archive.
    pub async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(buf.len() as u64);
        if end.is_none_or(|end| end > self.size) {
            return Err(Error::corrupt(format!(
                "{} bytes at offset {} lie outside the archive ({} bytes)",
                buf.len(),
                offset,
                self.size
            )));
        }

        let n = self.reader.read_at(offset, buf).await?;
        if n < buf.len() {
            return Err(Error::corrupt(format!(
                "archive truncated: expected {} bytes at offset {}, got {}",
                buf.len(),
                offset,
                n
            )));
        }
        Ok(())
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// Handles both the simple case (no comment) and archives with
    /// comments by searching backwards for the signature.
    ///
    /// Returns the EOCD record and its offset in the file.
    pub async fn find_eocd(&self) -> Result<(EndOfCentralDirectory, u64)> {
        if self.size < EndOfCentralDirectory::SIZE as u64 {
            return Err(Error::corrupt("not a ZIP archive: input is too small"));
        }

        // Common case first: no archive comment.
        let offset = self.size - EndOfCentralDirectory::SIZE as u64;
        let mut buf = vec![0u8; EndOfCentralDirectory::SIZE];
        self.read_exact_at(offset, &mut buf).await?;

        if &buf[0..4] == EndOfCentralDirectory::SIGNATURE && &buf[20..22] == b"\x00\x00" {
            let eocd = EndOfCentralDirectory::from_bytes(&buf)?;
            return Ok((eocd, offset));
        }

        // The EOCD sits earlier when the archive has a comment.
        let search_size = (MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64).min(self.size);
        let search_start = self.size - search_size;

        let mut buf = vec![0u8; search_size as usize];
        self.read_exact_at(search_start, &mut buf).await?;

        for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
            if &buf[i..i + 4] == EndOfCentralDirectory::SIGNATURE {
                // The comment length field must account for the remaining bytes.
                let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;

                if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                    let eocd = EndOfCentralDirectory::from_bytes(
                        &buf[i..i + EndOfCentralDirectory::SIZE],
                    )?;
                    return Ok((eocd, search_start + i as u64));
                }
            }
        }

        Err(Error::corrupt("not a ZIP archive: end of central directory not found"))
    }

    /// Read the ZIP64 End of Central Directory record.
    ///
    /// Called when the regular EOCD has fields saturated to 0xFFFF or
    /// 0xFFFFFFFF.
    pub async fn read_zip64_eocd(&self, eocd_offset: u64) -> Result<Zip64EOCD> {
        // The locator is located immediately before the regular EOCD
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| Error::corrupt("missing ZIP64 end of central directory locator"))?;
        let mut locator_buf = vec![0u8; Zip64EOCDLocator::SIZE];
        self.read_exact_at(locator_offset, &mut locator_buf).await?;

        let locator = Zip64EOCDLocator::from_bytes(&locator_buf)?;

        let mut eocd64_buf = vec![0u8; Zip64EOCD::MIN_SIZE];
        self.read_exact_at(locator.eocd64_offset, &mut eocd64_buf)
            .await?;

        Zip64EOCD::from_bytes(&eocd64_buf)
    }

    /// Locate the central directory, using the ZIP64 records when needed.
    pub async fn directory_info(&self) -> Result<DirectoryInfo> {
        let (eocd, eocd_offset) = self.find_eocd().await?;

        if eocd.is_multi_disk() {
            return Err(Error::corrupt("multi-disk archives are not supported"));
        }

        let info = if eocd.is_zip64() {
            let eocd64 = self.read_zip64_eocd(eocd_offset).await?;
            DirectoryInfo {
                offset: eocd64.cd_offset,
                size: eocd64.cd_size,
                total_entries: eocd64.total_entries,
            }
        } else {
            DirectoryInfo {
                offset: eocd.cd_offset as u64,
                size: eocd.cd_size as u64,
                total_entries: eocd.total_entries as u64,
            }
        };

        if info.offset.saturating_add(info.size) > eocd_offset {
            return Err(Error::corrupt(
                "central directory overlaps the end of central directory record",
            ));
        }
        if info.total_entries.saturating_mul(CDFH_MIN_SIZE as u64) > info.size {
            return Err(Error::corrupt(format!(
                "central directory of {} bytes cannot hold {} entries",
                info.size, info.total_entries
            )));
        }

        Ok(info)
    }

    /// Read the raw central directory in one request
    /// (a single Range request for HTTP sources).
    pub async fn read_central_directory(&self, info: &DirectoryInfo) -> Result<Vec<u8>> {
        let mut cd_data = vec![0u8; info.size as usize];
        self.read_exact_at(info.offset, &mut cd_data).await?;
        Ok(cd_data)
    }

    /// Parse a Central Directory File Header from a cursor.
    ///
    /// The cursor is left positioned at the next record.
    pub fn parse_cdfh(&self, cursor: &mut Cursor<&[u8]>) -> Result<Member> {
        read_cdfh(cursor).map_err(|e| {
            Error::corrupt(format!(
                "malformed central directory record at offset {}: {}",
                cursor.position(),
                e
            ))
        })
    }

    /// Get the actual data offset for a member.
    ///
    /// The Local File Header has variable-length fields (filename, extra
    /// field) that may differ from the Central Directory entry, so it has to
    /// be read to find where the data begins.
    pub async fn get_data_offset(&self, member: &Member) -> Result<u64> {
        let mut lfh_buf = vec![0u8; LFH_SIZE];
        self.read_exact_at(member.lfh_offset, &mut lfh_buf).await?;

        if &lfh_buf[0..4] != LFH_SIGNATURE {
            return Err(Error::corrupt(format!(
                "invalid local file header for {}",
                member.name
            )));
        }

        let file_name_length = u16::from_le_bytes([lfh_buf[26], lfh_buf[27]]) as u64;
        let extra_field_length = u16::from_le_bytes([lfh_buf[28], lfh_buf[29]]) as u64;

        Ok(member.lfh_offset + LFH_SIZE as u64 + file_name_length + extra_field_length)
    }
}

fn read_cdfh(cursor: &mut Cursor<&[u8]>) -> io::Result<Member> {
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig)?;
    if sig != CDFH_SIGNATURE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad signature"));
    }

    let _version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let compression_method = cursor.read_u16::<LittleEndian>()?;
    let last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>()?;
    let extra_field_length = cursor.read_u16::<LittleEndian>()?;
    let file_comment_length = cursor.read_u16::<LittleEndian>()?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let _external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut lfh_offset = cursor.read_u32::<LittleEndian>()? as u64;

    let mut file_name_bytes = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut file_name_bytes)?;
    let utf8 = flags & FLAG_UTF8 != 0;
    let name = decode_name(&file_name_bytes, utf8);

    // Directory entries end with '/'
    let is_directory = name.ends_with('/');

    // ZIP64 extended information lives in extra field 0x0001
    let extra_field_end = cursor.position() + extra_field_length as u64;

    while cursor.position() + 4 <= extra_field_end {
        let header_id = cursor.read_u16::<LittleEndian>()?;
        let field_size = cursor.read_u16::<LittleEndian>()?;
        let field_end = cursor.position() + field_size as u64;

        if header_id == 0x0001 {
            // Present only when the corresponding header field is saturated
            if uncompressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                uncompressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if compressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                compressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if lfh_offset == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                lfh_offset = cursor.read_u64::<LittleEndian>()?;
            }
        }
        cursor.set_position(field_end);
    }

    cursor.set_position(extra_field_end + file_comment_length as u64);
    if cursor.position() > cursor.get_ref().len() as u64 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "record extends past the central directory",
        ));
    }

    Ok(Member {
        name,
        raw_name: RawName {
            bytes: file_name_bytes,
            utf8,
        },
        is_directory,
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size,
        uncompressed_size,
        crc32,
        lfh_offset,
        last_mod_time,
        last_mod_date,
        flags,
    })
}

/// Upper half of code page 437, the ZIP default for names without the
/// UTF-8 flag.
const CP437_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å',
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ',
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»',
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐',
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧',
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀',
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩',
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{A0}',
];

/// Decode a stored member name: UTF-8 when bit 11 is set, CP437 otherwise.
fn decode_name(bytes: &[u8], utf8: bool) -> String {
    if utf8 {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    bytes
        .iter()
        .map(|&b| {
            if b < 0x80 {
                b as char
            } else {
                CP437_HIGH[(b - 0x80) as usize]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;

    fn parser(data: Vec<u8>) -> ZipParser<MemoryReader> {
        ZipParser::new(Arc::new(MemoryReader::new(data)))
    }

    #[tokio::test]
    async fn too_small_is_corrupt() {
        let err = parser(b"PK".to_vec()).find_eocd().await.unwrap_err();
        assert!(matches!(err, Error::CorruptArchive(_)));
    }

    #[tokio::test]
    async fn finds_eocd_behind_comment() {
        let mut data = vec![0u8; 10];
        data.extend_from_slice(b"PK\x05\x06");
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(&5u16.to_le_bytes());
        data.extend_from_slice(b"hello");

        let (eocd, offset) = parser(data).find_eocd().await.unwrap();
        assert_eq!(offset, 10);
        assert_eq!(eocd.comment_len, 5);
        assert_eq!(eocd.total_entries, 0);
    }

    #[tokio::test]
    async fn rejects_directory_past_eocd() {
        let mut data = b"PK\x05\x06".to_vec();
        data.extend_from_slice(&[0, 0, 0, 0, 1, 0, 1, 0]);
        data.extend_from_slice(&46u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());

        let err = parser(data).directory_info().await.unwrap_err();
        assert!(matches!(err, Error::CorruptArchive(_)));
    }

    #[test]
    fn names_without_utf8_flag_are_cp437() {
        assert_eq!(decode_name(b"OEBPS/a.css", false), "OEBPS/a.css");
        assert_eq!(decode_name(&[0x80, 0x82, b'.', b'x'], false), "Çé.x");
        assert_eq!(decode_name(&[0xB2, 0xE2, 0xCA, 0xD4], false), "▓Γ╩╘");
        assert_eq!(decode_name(&[0xFF], false), "\u{A0}");
        assert_eq!(decode_name("章節".as_bytes(), true), "章節");
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let data = b"PK\x01\x02\x14\x00".to_vec();
        let p = parser(Vec::new());
        let mut cursor = Cursor::new(data.as_slice());
        assert!(matches!(p.parse_cdfh(&mut cursor), Err(Error::CorruptArchive(_))));
    }
}
