use clap::Parser;

use crate::pipeline::{ConversionOptions, DEFAULT_CONCURRENCY};

/// Default input size limit: 20 MiB.
pub const DEFAULT_MAX_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "epubconv")]
#[command(version)]
#[command(about = "Convert Simplified Chinese EPUB books to Traditional Chinese", long_about = None)]
#[command(after_help = "Examples:\n  \
  epubconv book.epub                 write the converted book next to book.epub\n  \
  epubconv -d out/ book.epub         write the converted book into out/\n  \
  epubconv -p book.epub > tw.epub    send the converted book to stdout\n  \
  epubconv -v https://example.com/book.epub   list members of a remote book")]
pub struct Cli {
    /// EPUB file path or HTTP URL
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Write the converted book into DIR
    #[arg(short = 'd', value_name = "DIR")]
    pub output_dir: Option<String>,

    /// Write the converted book to PATH (overrides -d)
    #[arg(long = "output", value_name = "PATH")]
    pub output: Option<String>,

    /// Write the converted book to stdout, no messages
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Overwrite the output file if it exists
    #[arg(short = 'o')]
    pub overwrite: bool,

    /// List members (short format) instead of converting
    #[arg(short = 'l')]
    pub list: bool,

    /// List members verbosely instead of converting
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Keep member names as they are
    #[arg(long = "keep-filenames")]
    pub keep_filenames: bool,

    /// Number of members converted concurrently
    #[arg(short = 'j', long = "jobs", env = "EPUBCONV_JOBS", default_value_t = DEFAULT_CONCURRENCY)]
    pub jobs: usize,

    /// Target variant: zh-tw, zh-hant, zh-hk or zh-mo
    #[arg(long = "variant", env = "EPUBCONV_VARIANT", default_value = "zh-tw")]
    pub variant: String,

    /// Refuse inputs larger than this many bytes
    #[arg(long = "max-bytes", env = "EPUBCONV_MAX_BYTES", default_value_t = DEFAULT_MAX_BYTES)]
    pub max_bytes: u64,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    pub fn is_http_url(&self) -> bool {
        self.file.starts_with("http://") || self.file.starts_with("https://")
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || self.pipe
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &'static str {
        if self.is_very_quiet() {
            "off"
        } else if self.is_quiet() {
            "error"
        } else {
            "warn"
        }
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        ConversionOptions {
            convert_filenames: !self.keep_filenames,
            concurrency: self.jobs.max(1),
        }
    }

    /// The input's file name: the last path segment of the path or URL,
    /// without any query string.
    pub fn input_file_name(&self) -> String {
        let path = self.file.split(['?', '#']).next().unwrap_or(&self.file);
        path.rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("book.epub")
            .to_string()
    }
}
