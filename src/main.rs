//! Main entry point for the epubconv CLI application.
//!
//! Converts a Simplified Chinese EPUB, read from the local filesystem or a
//! remote HTTP URL, and writes the Traditional Chinese book to disk or stdout.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use epubconv::{
    ArchiveReader, Classification, Cli, ConversionPipeline, HttpRangeReader, LocalFileReader,
    ReadAt, TextConverter, classify, suggest_output_name,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let file_name = cli.input_file_name();
    if !file_name.to_ascii_lowercase().ends_with(".epub") {
        bail!("{}: not an .epub file", file_name);
    }

    if cli.is_http_url() {
        let reader = HttpRangeReader::new(cli.file.clone())
            .await
            .with_context(|| format!("cannot open {}", cli.file))?;
        let reader = Arc::new(reader);

        process_book(reader.clone(), &cli, &file_name).await?;

        if !cli.is_quiet() {
            eprintln!(
                "Total bytes transferred: {}",
                format_size(reader.transferred_bytes())
            );
        }
    } else {
        let reader = LocalFileReader::new(Path::new(&cli.file))
            .with_context(|| format!("cannot open {}", cli.file))?;
        process_book(Arc::new(reader), &cli, &file_name).await?;
    }

    Ok(())
}

/// List or convert one book.
async fn process_book<R: ReadAt + 'static>(reader: Arc<R>, cli: &Cli, file_name: &str) -> Result<()> {
    if reader.size() > cli.max_bytes {
        bail!(
            "{}: {} exceeds the {} limit",
            file_name,
            format_size(reader.size()),
            format_size(cli.max_bytes)
        );
    }

    if cli.list || cli.verbose {
        return list_members(reader, cli.verbose).await;
    }

    let converter = Arc::new(
        TextConverter::from_tag(&cli.variant)
            .with_context(|| format!("unsupported variant {}", cli.variant))?,
    );
    let mut output_name = suggest_output_name(&converter, file_name)?;
    if output_name == file_name {
        output_name = tagged_name(&output_name, converter.label());
    }
    let target = if cli.pipe {
        None
    } else {
        let path = output_path(cli, &output_name);
        if path.exists() && !cli.overwrite {
            bail!("{} exists (use -o to overwrite)", path.display());
        }
        Some(path)
    };

    let pipeline = ConversionPipeline::new(converter, cli.conversion_options());
    let archive = pipeline
        .run(reader)
        .await
        .with_context(|| format!("cannot convert {}", file_name))?;

    match target {
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&archive.bytes).await?;
            stdout.flush().await?;
        }
        Some(path) => {
            tokio::fs::write(&path, &archive.bytes)
                .await
                .with_context(|| format!("cannot write {}", path.display()))?;
            if !cli.is_quiet() {
                let report = &archive.report;
                println!("  converted: {} -> {}", file_name, path.display());
                println!(
                    "  {} members, {} converted, {} copied, {} renamed, {}",
                    report.members,
                    report.transformed,
                    report.passed_through,
                    report.renamed,
                    format_size(archive.bytes.len() as u64)
                );
            }
        }
    }

    Ok(())
}

/// Where the converted book goes: `--output`, else the suggested name in
/// `-d`, else alongside a local input, else the current directory.
fn output_path(cli: &Cli, output_name: &str) -> PathBuf {
    if let Some(ref path) = cli.output {
        return PathBuf::from(path);
    }
    if let Some(ref dir) = cli.output_dir {
        return PathBuf::from(dir).join(output_name);
    }
    if cli.is_http_url() {
        return PathBuf::from(output_name);
    }
    Path::new(&cli.file)
        .parent()
        .map(|parent| parent.join(output_name))
        .unwrap_or_else(|| PathBuf::from(output_name))
}

/// `book.epub` -> `book.zh-tw.epub`, for names the converter leaves alone.
fn tagged_name(name: &str, label: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}.{}.{}", stem, label, ext),
        None => format!("{}.{}", name, label),
    }
}

/// List the members of the book.
///
/// - Simple format (`-l`): member names, one per line
/// - Verbose format (`-v`): sizes, method, timestamps and what conversion would do
async fn list_members<R: ReadAt + 'static>(reader: Arc<R>, verbose: bool) -> Result<()> {
    let mut archive = ArchiveReader::open(reader).await?;

    if verbose {
        println!(
            "{:>10}  {:>10}  {:>8}  {:>10}  {:>5}  {:<7}  Name",
            "Length", "Size", "Method", "Date", "Time", "Action"
        );
        println!("{}", "-".repeat(76));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut member_count = 0usize;
    let mut convert_count = 0usize;

    while let Some(member) = archive.next_entry()? {
        if !verbose {
            println!("{}", member.name);
            continue;
        }

        let (year, month, day) = member.mod_date();
        let (hour, minute, _second) = member.mod_time();
        let action = match classify(&member.name) {
            Classification::Transform(_) => {
                convert_count += 1;
                "convert"
            }
            Classification::PassThrough => "copy",
        };

        println!(
            "{:>10}  {:>10}  {:>8}  {:04}-{:02}-{:02}  {:02}:{:02}  {:<7}  {}",
            member.uncompressed_size,
            member.compressed_size,
            member.compression_method.to_string(),
            year,
            month,
            day,
            hour,
            minute,
            action,
            member.name
        );

        total_uncompressed += member.uncompressed_size;
        total_compressed += member.compressed_size;
        member_count += 1;
    }

    if verbose {
        println!("{}", "-".repeat(76));
        println!(
            "{:>10}  {:>10}  {} members, {} to convert",
            total_uncompressed, total_compressed, member_count, convert_count
        );
    }

    Ok(())
}

/// Format a byte size into a human-readable string.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
