use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use epubconv::{
    ArchiveReader, ArchiveWriter, CompressionMethod, ConversionOptions, ConversionPipeline,
    ConversionReport, DosDateTime, Error, MemoryReader, RawName, ScriptMapping, TextConverter,
    convert,
};
use zip::write::SimpleFileOptions;

const STORED: zip::CompressionMethod = zip::CompressionMethod::Stored;
const DEFLATED: zip::CompressionMethod = zip::CompressionMethod::Deflated;

/// Small character table, so expected output does not depend on phrase rules.
struct CharTable;

impl ScriptMapping for CharTable {
    fn map(&self, text: &str) -> String {
        text.chars()
            .map(|c| match c {
                '简' => '簡',
                '体' => '體',
                '书' => '書',
                '汉' => '漢',
                '语' => '語',
                '测' => '測',
                '试' => '試',
                '龙' => '龍',
                '门' => '門',
                other => other,
            })
            .collect()
    }
}

fn table_converter() -> Arc<TextConverter> {
    Arc::new(TextConverter::with_loader("table", || {
        Ok(Arc::new(CharTable) as Arc<dyn ScriptMapping>)
    }))
}

fn build(entries: &[(&str, &[u8], zip::CompressionMethod)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data, method) in entries {
        let options = SimpleFileOptions::default().compression_method(*method);
        if name.ends_with('/') {
            zip.add_directory(*name, options).unwrap();
        } else {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}

struct Entry {
    name: String,
    method: zip::CompressionMethod,
    data: Vec<u8>,
}

fn read_back(bytes: &[u8]) -> Vec<Entry> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut file = archive.by_index(i).unwrap();
            let mut data = Vec::new();
            file.read_to_end(&mut data).unwrap();
            Entry {
                name: file.name().to_string(),
                method: file.compression(),
                data,
            }
        })
        .collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap()
}

/// Rewrite the compression method of the first member in both its local
/// header and its central directory record.
fn patch_first_method(bytes: &mut [u8], method: u16) {
    assert_eq!(&bytes[..4], b"PK\x03\x04");
    bytes[8..10].copy_from_slice(&method.to_le_bytes());
    let cd = find(bytes, b"PK\x01\x02");
    bytes[cd + 10..cd + 12].copy_from_slice(&method.to_le_bytes());
}

fn sequential() -> ConversionOptions {
    ConversionOptions {
        convert_filenames: true,
        concurrency: 1,
    }
}

#[tokio::test]
async fn minimal_book_end_to_end() {
    let cover: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let content = "<p>简体\r\n汉语</p>\n<p>书</p>\r\n";
    let input = build(&[
        ("OEBPS/", b"", STORED),
        ("OEBPS/content.xhtml", content.as_bytes(), DEFLATED),
        ("OEBPS/cover.jpg", &cover, STORED),
    ]);

    let output = convert(input, ConversionOptions::default(), table_converter())
        .await
        .unwrap();
    let entries = read_back(&output);

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "OEBPS/content.xhtml");
    assert_eq!(entries[0].method, DEFLATED);
    assert_eq!(
        String::from_utf8(entries[0].data.clone()).unwrap(),
        "<p>簡體\r\n漢語</p>\n<p>書</p>\r\n"
    );
    assert_eq!(entries[1].name, "OEBPS/cover.jpg");
    assert_eq!(entries[1].method, STORED);
    assert_eq!(entries[1].data, cover);
}

#[tokio::test]
async fn member_count_order_and_compression_are_kept() {
    let input = build(&[
        ("mimetype", b"application/epub+zip", STORED),
        ("META-INF/container.xml", b"<container/>", DEFLATED),
        ("OEBPS/content.opf", "<package>简</package>".as_bytes(), DEFLATED),
        ("OEBPS/toc.ncx", "<ncx>目录</ncx>".as_bytes(), STORED),
        ("OEBPS/style.css", b"p { margin: 0 }", DEFLATED),
        ("OEBPS/ch1.html", "测试".as_bytes(), STORED),
        ("OEBPS/ch2.HTM", "龙门".as_bytes(), DEFLATED),
    ]);
    let before = read_back(&input);

    let output = convert(input, ConversionOptions::default(), table_converter())
        .await
        .unwrap();
    let after = read_back(&output);

    assert_eq!(after.len(), before.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.method, b.method, "{}", a.name);
    }
    assert_eq!(after[0].data, b"application/epub+zip");
    assert_eq!(after[4].data, b"p { margin: 0 }");
    assert_eq!(after[5].data, "測試".as_bytes());
    assert_eq!(after[6].data, "龍門".as_bytes());
}

#[tokio::test]
async fn non_target_members_are_byte_identical() {
    // Simplified text in a stylesheet or a plain .txt is still copied as is.
    let css = "/* 简体 */ body { font-family: \"汉语\" }".as_bytes();
    let txt = "简体书".as_bytes();
    let input = build(&[
        ("style.css", css, DEFLATED),
        ("notes.txt", txt, STORED),
        ("chapter.xhtml.orig", txt, STORED),
    ]);

    let output = convert(input, sequential(), table_converter()).await.unwrap();
    let entries = read_back(&output);
    assert_eq!(entries[0].data, css);
    assert_eq!(entries[1].data, txt);
    assert_eq!(entries[2].data, txt);
}

#[tokio::test]
async fn package_language_is_relabelled() {
    let opf = "<metadata>\n  <dc:title>简体书</dc:title>\n  <dc:language>zh-CN</dc:language>\n</metadata>\n";
    let other = "<p><dc:language>zh-CN</dc:language></p>";
    let input = build(&[
        ("content.opf", opf.as_bytes(), DEFLATED),
        ("page.xhtml", other.as_bytes(), DEFLATED),
    ]);

    let output = convert(input, sequential(), table_converter()).await.unwrap();
    let entries = read_back(&output);
    let opf = String::from_utf8(entries[0].data.clone()).unwrap();
    assert!(opf.contains("<dc:language>zh-TW</dc:language>"));
    assert!(!opf.contains("zh-CN"));
    assert!(opf.contains("簡體書"));
    assert_eq!(entries[1].data, other.as_bytes());
}

#[tokio::test]
async fn garbage_input_is_corrupt_archive() {
    let err = convert(
        b"this is not a zip archive at all".to_vec(),
        ConversionOptions::default(),
        table_converter(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::CorruptArchive(_)), "{err:?}");
    assert!(err.is_client_error());

    let err = convert(Vec::new(), ConversionOptions::default(), table_converter())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CorruptArchive(_)), "{err:?}");
}

#[tokio::test]
async fn crc_mismatch_in_converted_member_is_corrupt() {
    let mut input = build(&[("chapter.xhtml", b"plain text body", STORED)]);
    let at = find(&input, b"plain");
    input[at] = b'P';

    let err = convert(input, sequential(), table_converter())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CorruptArchive(_)), "{err:?}");
}

#[tokio::test]
async fn filenames_converted_unless_disabled() {
    let input = build(&[
        ("Text/简体.xhtml", "汉语".as_bytes(), DEFLATED),
        ("Images/书.png", b"\x89PNG", STORED),
    ]);

    let output = convert(input.clone(), sequential(), table_converter())
        .await
        .unwrap();
    let names: Vec<_> = read_back(&output).into_iter().map(|e| e.name).collect();
    assert_eq!(names, ["Text/簡體.xhtml", "Images/書.png"]);

    let keep = ConversionOptions {
        convert_filenames: false,
        concurrency: 2,
    };
    let pipeline = ConversionPipeline::new(table_converter(), keep);
    let archive = pipeline
        .run(Arc::new(MemoryReader::new(input)))
        .await
        .unwrap();
    assert_eq!(archive.report.renamed, 0);
    let entries = read_back(&archive.bytes);
    assert_eq!(entries[0].name, "Text/简体.xhtml");
    assert_eq!(entries[0].data, "漢語".as_bytes());
    assert_eq!(entries[1].name, "Images/书.png");
}

#[tokio::test]
async fn unknown_compression_is_copied_for_pass_through() {
    let mut input = build(&[
        ("fonts/embedded.obf", b"obfuscated font payload", STORED),
        ("chapter.xhtml", "简".as_bytes(), DEFLATED),
    ]);
    patch_first_method(&mut input, 99);

    let pipeline = ConversionPipeline::new(table_converter(), sequential());
    let archive = pipeline
        .run(Arc::new(MemoryReader::new(input)))
        .await
        .unwrap();
    assert_eq!(
        archive.report,
        ConversionReport {
            members: 2,
            transformed: 1,
            passed_through: 1,
            renamed: 0,
        }
    );

    let source = Arc::new(MemoryReader::new(archive.bytes));
    let mut reader = ArchiveReader::open(source).await.unwrap();
    let font = reader.next_entry().unwrap().unwrap();
    assert_eq!(font.name, "fonts/embedded.obf");
    assert_eq!(font.compression_method, CompressionMethod::Unknown(99));
    let raw = reader.read_raw(&font).await.unwrap();
    assert_eq!(raw.data, b"obfuscated font payload");

    let chapter = reader.next_entry().unwrap().unwrap();
    assert_eq!(chapter.compression_method, CompressionMethod::Deflate);
    assert_eq!(reader.read_content(&chapter).await.unwrap(), "簡".as_bytes());
    assert!(reader.next_entry().unwrap().is_none());
}

#[tokio::test]
async fn unknown_compression_on_converted_member_is_rejected() {
    let mut input = build(&[
        ("chapter.xhtml", b"<p>text</p>", STORED),
        ("cover.jpg", b"\xFF\xD8\xFF", STORED),
    ]);
    patch_first_method(&mut input, 12);

    let err = convert(input, sequential(), table_converter())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CorruptArchive(_)), "{err:?}");
}

#[tokio::test]
async fn utf16_members_are_written_as_utf8() {
    let text = "<?xml version=\"1.0\" encoding=\"UTF-16\"?>\r\n<p>简体</p>\n";
    let mut le = vec![0xFF, 0xFE];
    le.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
    let mut be = vec![0xFE, 0xFF];
    be.extend(text.encode_utf16().flat_map(u16::to_be_bytes));

    let input = build(&[("le.xhtml", &le, DEFLATED), ("be.xhtml", &be, STORED)]);
    let output = convert(input, sequential(), table_converter()).await.unwrap();

    let expected = "\u{FEFF}<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n<p>簡體</p>\n";
    for entry in read_back(&output) {
        assert_eq!(String::from_utf8(entry.data).unwrap(), expected, "{}", entry.name);
    }
}

#[tokio::test]
async fn utf8_bom_is_kept() {
    let mut content = b"\xEF\xBB\xBF".to_vec();
    content.extend_from_slice("简体".as_bytes());
    let input = build(&[("a.html", &content, DEFLATED), ("b.html", "书".as_bytes(), DEFLATED)]);

    let output = convert(input, sequential(), table_converter()).await.unwrap();
    let entries = read_back(&output);
    assert_eq!(entries[0].data, "\u{FEFF}簡體".as_bytes());
    assert_eq!(entries[1].data, "書".as_bytes());
}

#[tokio::test]
async fn converting_twice_matches_converting_once() {
    let input = build(&[
        ("简体/第一章.xhtml", "简体\r\n汉语\r书\n".as_bytes(), DEFLATED),
        ("content.opf", "<dc:language>zh-CN</dc:language>".as_bytes(), STORED),
        ("cover.jpg", b"\xFF\xD8\xFF\xE0", STORED),
    ]);

    let once = convert(input, ConversionOptions::default(), table_converter())
        .await
        .unwrap();
    let twice = convert(once.clone(), ConversionOptions::default(), table_converter())
        .await
        .unwrap();

    let once = read_back(&once);
    let twice = read_back(&twice);
    assert_eq!(once.len(), twice.len());
    for (a, b) in once.iter().zip(&twice) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.data, b.data, "{}", a.name);
    }
    assert_eq!(once[0].name, "簡體/第一章.xhtml");
}

#[tokio::test]
async fn builtin_tables_convert_to_taiwan_script() {
    let input = build(&[
        ("简体.xhtml", "<p>简体中文</p>\r\n<p>汉语</p>\n".as_bytes(), DEFLATED),
        ("content.opf", "<dc:language>zh-CN</dc:language>".as_bytes(), DEFLATED),
    ]);
    let converter = Arc::new(TextConverter::from_tag("zh-TW").unwrap());

    let output = convert(input, ConversionOptions::default(), converter)
        .await
        .unwrap();
    let entries = read_back(&output);
    assert_eq!(entries[0].name, "簡體.xhtml");
    assert_eq!(
        String::from_utf8(entries[0].data.clone()).unwrap(),
        "<p>簡體中文</p>\r\n<p>漢語</p>\n"
    );
    assert_eq!(entries[1].data, b"<dc:language>zh-TW</dc:language>");
}

#[tokio::test]
async fn non_traditional_variant_fails_to_initialize() {
    let input = build(&[("a.xhtml", b"x", STORED)]);
    let converter = Arc::new(TextConverter::from_tag("zh-CN").unwrap());
    let err = convert(input, ConversionOptions::default(), converter)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConverterInit(_)), "{err:?}");
    assert!(TextConverter::from_tag("klingon").is_err());
}

async fn stored_names(bytes: Vec<u8>) -> Vec<RawName> {
    let mut reader = ArchiveReader::open(Arc::new(MemoryReader::new(bytes)))
        .await
        .unwrap();
    let mut names = Vec::new();
    while let Some(member) = reader.next_entry().unwrap() {
        names.push(member.raw_name);
    }
    names
}

#[tokio::test]
async fn legacy_encoded_names_are_written_back_unchanged() {
    // GBK bytes for "测试.css" and "简体.xhtml", stored without the UTF-8 flag.
    let css = RawName {
        bytes: vec![0xB2, 0xE2, 0xCA, 0xD4, b'.', b'c', b's', b's'],
        utf8: false,
    };
    let xhtml = RawName {
        bytes: vec![0xBC, 0xF2, 0xCC, 0xE5, b'.', b'x', b'h', b't', b'm', b'l'],
        utf8: false,
    };
    let mut writer = ArchiveWriter::new();
    writer
        .add_member(b"p {}", css.clone(), CompressionMethod::Stored, DosDateTime::default())
        .unwrap();
    writer
        .add_member("简体".as_bytes(), xhtml.clone(), CompressionMethod::Deflate, DosDateTime::default())
        .unwrap();
    let input = writer.finalize().unwrap();

    for convert_filenames in [false, true] {
        let options = ConversionOptions {
            convert_filenames,
            concurrency: 2,
        };
        let output = convert(input.clone(), options, table_converter()).await.unwrap();
        assert_eq!(stored_names(output).await, [css.clone(), xhtml.clone()]);
    }
}

#[tokio::test]
async fn renaming_onto_an_existing_name_is_rejected() {
    let input = build(&[
        ("簡.xhtml", "書".as_bytes(), DEFLATED),
        ("简.xhtml", "书".as_bytes(), DEFLATED),
    ]);

    let err = convert(input.clone(), sequential(), table_converter())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Write(_)), "{err:?}");

    let keep = ConversionOptions {
        convert_filenames: false,
        concurrency: 1,
    };
    let output = convert(input, keep, table_converter()).await.unwrap();
    assert_eq!(read_back(&output).len(), 2);
}
