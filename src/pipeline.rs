//! Archive conversion pipeline.
//!
//! Members are enumerated by a single producer in archive order. Members
//! that need converting are decoded and converted on the blocking pool, at
//! most [`ConversionOptions::concurrency`] at a time; everything else is
//! copied as stored. Finished members go through a reordering buffer so the
//! writer always receives them in their original order, and the archive is
//! finalized only once enumeration is over and nothing is pending.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};

use crate::classify::{Classification, TextKind, apply_post_rule, classify};
use crate::converter::TextConverter;
use crate::encoding;
use crate::error::{Error, Result};
use crate::io::{MemoryReader, ReadAt};
use crate::zip::{
    ArchiveReader, ArchiveWriter, CompressionMethod, DosDateTime, RawMember, RawName,
};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Options recognised by a conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOptions {
    /// Pass member names through the converter before writing them.
    pub convert_filenames: bool,
    /// Maximum number of members converted at the same time.
    pub concurrency: usize,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            convert_filenames: true,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Counts of what a finished conversion did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionReport {
    pub members: usize,
    pub transformed: usize,
    pub passed_through: usize,
    pub renamed: usize,
}

/// A finished output archive.
#[derive(Debug)]
pub struct ConvertedArchive {
    pub bytes: Vec<u8>,
    pub report: ConversionReport,
}

/// Where a conversion was when it stopped; reported when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Initializing,
    Reading,
    Converting,
    Writing,
    Finalizing,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Initializing => "initializing",
            Stage::Reading => "reading",
            Stage::Converting => "converting",
            Stage::Writing => "writing",
            Stage::Finalizing => "finalizing",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Pending-count barrier guarding finalization.
///
/// `pending` goes up when a member starts processing and down when the
/// writer has accepted it. Finalizing before enumeration has ended or while
/// anything is pending would truncate the archive.
#[derive(Debug, Default)]
struct CompletionBarrier {
    enumeration_done: bool,
    pending: usize,
}

impl CompletionBarrier {
    fn begin(&mut self) {
        debug_assert!(!self.enumeration_done, "member started after enumeration ended");
        self.pending += 1;
    }

    fn complete(&mut self) {
        debug_assert!(self.pending > 0, "member completed twice");
        self.pending -= 1;
    }

    fn finish_enumeration(&mut self) {
        self.enumeration_done = true;
    }

    fn is_settled(&self) -> bool {
        self.enumeration_done && self.pending == 0
    }
}

enum Payload {
    /// Stored bytes copied without recompression.
    Raw(RawMember),
    /// Converted UTF-8 content, compressed by the writer.
    Content {
        data: Vec<u8>,
        method: CompressionMethod,
        modified: DosDateTime,
    },
}

struct ReadyMember {
    name: RawName,
    payload: Payload,
}

/// Holds finished members until every earlier member has been written.
#[derive(Default)]
struct ReorderBuffer {
    next: usize,
    ready: BTreeMap<usize, ReadyMember>,
}

impl ReorderBuffer {
    fn insert(&mut self, seq: usize, member: ReadyMember) {
        debug_assert!(seq >= self.next, "member {seq} already released");
        self.ready.insert(seq, member);
    }

    /// The next member in sequence, if it has finished.
    fn pop_next(&mut self) -> Option<ReadyMember> {
        let member = self.ready.remove(&self.next)?;
        self.next += 1;
        Some(member)
    }
}

/// Output side of a conversion: the writer plus the bookkeeping that
/// decides when members may be written and when the archive may be closed.
struct Assembly {
    writer: ArchiveWriter,
    barrier: CompletionBarrier,
    reorder: ReorderBuffer,
}

impl Assembly {
    fn new() -> Self {
        Self {
            writer: ArchiveWriter::new(),
            barrier: CompletionBarrier::default(),
            reorder: ReorderBuffer::default(),
        }
    }

    /// Accept a finished member and write everything now in sequence.
    fn accept(&mut self, seq: usize, member: ReadyMember) -> Result<()> {
        self.reorder.insert(seq, member);
        while let Some(member) = self.reorder.pop_next() {
            match member.payload {
                Payload::Raw(raw) => self.writer.add_raw(&raw, member.name)?,
                Payload::Content {
                    data,
                    method,
                    modified,
                } => self
                    .writer
                    .add_member(&data, member.name, method, modified)?,
            }
            self.barrier.complete();
        }
        Ok(())
    }

    fn finalize(mut self) -> Result<Vec<u8>> {
        self.barrier.finish_enumeration();
        if !self.barrier.is_settled() {
            return Err(Error::write(format!(
                "{} members still pending at finalization",
                self.barrier.pending
            )));
        }
        self.writer.finalize()
    }
}

/// Output names handed out so far, and whether each came from renaming.
#[derive(Default)]
struct OutputNames {
    seen: HashMap<Vec<u8>, bool>,
}

impl OutputNames {
    /// Record `name`. Two members may only share a name if both already had
    /// it in the input.
    fn claim(&mut self, name: &RawName, renamed: bool) -> Result<()> {
        match self.seen.get_mut(&name.bytes) {
            Some(earlier_renamed) => {
                if renamed || *earlier_renamed {
                    return Err(Error::write(format!(
                        "two members would both be written as {}",
                        name
                    )));
                }
                Ok(())
            }
            None => {
                self.seen.insert(name.bytes.clone(), renamed);
                Ok(())
            }
        }
    }
}

type TaskOutput = (usize, Result<ReadyMember>);

/// Converts archives with a shared [`TextConverter`].
pub struct ConversionPipeline {
    converter: Arc<TextConverter>,
    options: ConversionOptions,
}

impl ConversionPipeline {
    pub fn new(converter: Arc<TextConverter>, options: ConversionOptions) -> Self {
        Self { converter, options }
    }

    /// Convert the archive read from `source`.
    ///
    /// Any failure aborts the whole conversion; members already in flight
    /// are dropped and no partial archive is returned.
    pub async fn run<R: ReadAt + 'static>(&self, source: Arc<R>) -> Result<ConvertedArchive> {
        let mut stage = Stage::Idle;
        let result = self.run_stages(source, &mut stage).await;
        match &result {
            Ok(archive) => tracing::info!(
                members = archive.report.members,
                transformed = archive.report.transformed,
                passed_through = archive.report.passed_through,
                renamed = archive.report.renamed,
                bytes = archive.bytes.len(),
                "conversion finished"
            ),
            Err(e) => tracing::warn!(%stage, error = %e, "conversion failed"),
        }
        result
    }

    async fn run_stages<R: ReadAt + 'static>(
        &self,
        source: Arc<R>,
        stage: &mut Stage,
    ) -> Result<ConvertedArchive> {
        *stage = Stage::Initializing;
        let converter = self.converter.clone();
        tokio::task::spawn_blocking(move || converter.initialize())
            .await
            .map_err(join_error)??;

        *stage = Stage::Reading;
        let mut reader = ArchiveReader::open(source).await?;
        let mut assembly = Assembly::new();
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut report = ConversionReport::default();
        let limit = self.options.concurrency.max(1);
        let mut names = OutputNames::default();
        let mut seq = 0;

        while let Some(member) = reader.next_entry()? {
            *stage = Stage::Reading;
            assembly.barrier.begin();
            report.members += 1;

            let converted = self.output_name(&member.name)?;
            let renamed = converted != member.name;
            let name = if renamed {
                report.renamed += 1;
                RawName::from(converted)
            } else {
                member.raw_name.clone()
            };
            names.claim(&name, renamed)?;

            let classification = classify(&member.name);
            tracing::debug!(
                member = %member.name,
                ?classification,
                method = %member.compression_method,
                size = member.uncompressed_size,
                "member classified"
            );

            // Nothing new is read while `limit` members are already held.
            make_room(&mut tasks, &mut assembly, limit).await?;

            match classification {
                Classification::PassThrough => {
                    let raw = reader.read_raw(&member).await?;
                    report.passed_through += 1;
                    *stage = Stage::Writing;
                    assembly.accept(seq, ReadyMember {
                        name,
                        payload: Payload::Raw(raw),
                    })?;
                }
                Classification::Transform(kind) => {
                    let content = reader.read_content(&member).await?;
                    report.transformed += 1;

                    *stage = Stage::Converting;
                    let converter = self.converter.clone();
                    let method = member.compression_method;
                    let modified = member.modified();
                    let source_name = member.name;
                    tasks.spawn_blocking(move || {
                        let result = transform_member(&converter, kind, &source_name, &content)
                            .map(|data| ReadyMember {
                                name,
                                payload: Payload::Content {
                                    data,
                                    method,
                                    modified,
                                },
                            });
                        (seq, result)
                    });
                }
            }
            seq += 1;
        }

        *stage = Stage::Converting;
        while !tasks.is_empty() {
            let (done, result) = join_next(&mut tasks).await?;
            *stage = Stage::Writing;
            assembly.accept(done, result?)?;
        }

        *stage = Stage::Finalizing;
        let bytes = assembly.finalize()?;
        *stage = Stage::Done;

        Ok(ConvertedArchive { bytes, report })
    }

    fn output_name(&self, name: &str) -> Result<String> {
        if self.options.convert_filenames {
            self.converter.convert_filename(name)
        } else {
            Ok(name.to_string())
        }
    }
}

/// Wait for conversions until fewer than `limit` members are held in
/// memory, counting running conversions and finished members still waiting
/// for an earlier one. Once no conversion is running, nothing can be
/// waiting either.
async fn make_room(
    tasks: &mut JoinSet<TaskOutput>,
    assembly: &mut Assembly,
    limit: usize,
) -> Result<()> {
    while !tasks.is_empty() && tasks.len() + assembly.reorder.ready.len() >= limit {
        let (done, result) = join_next(tasks).await?;
        assembly.accept(done, result?)?;
    }
    Ok(())
}

async fn join_next(tasks: &mut JoinSet<TaskOutput>) -> Result<TaskOutput> {
    match tasks.join_next().await {
        Some(joined) => joined.map_err(join_error),
        None => Err(Error::Internal("no conversion task to wait for".into())),
    }
}

fn join_error(e: JoinError) -> Error {
    Error::Internal(format!("conversion task failed: {}", e))
}

/// Detect, decode, convert and re-encode one text member.
fn transform_member(
    converter: &TextConverter,
    kind: TextKind,
    name: &str,
    content: &[u8],
) -> Result<Vec<u8>> {
    let decoded = encoding::decode(content, encoding::detect(content));
    tracing::trace!(member = name, encoding = %decoded.encoding, bom = decoded.had_bom, "decoded");

    let converted = converter.convert_content(&decoded.text)?;
    let converted = apply_post_rule(kind, converted);
    Ok(decoded.reencode(&converted))
}

/// Convert an in-memory archive.
pub async fn convert(
    input: Vec<u8>,
    options: ConversionOptions,
    converter: Arc<TextConverter>,
) -> Result<Vec<u8>> {
    let pipeline = ConversionPipeline::new(converter, options);
    let archive = pipeline.run(Arc::new(MemoryReader::new(input))).await?;
    Ok(archive.bytes)
}

/// Suggested name for the converted book: the input's file name run
/// through the same filename conversion as the members.
pub fn suggest_output_name(converter: &TextConverter, input_name: &str) -> Result<String> {
    converter.initialize()?;
    converter.convert_filename(input_name)
}
