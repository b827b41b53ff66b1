//! Chinese script conversion for member content and names.
//!
//! [`TextConverter`] is constructed explicitly, shared behind an `Arc`, and
//! loads its mapping tables once on first [`initialize`](TextConverter::initialize).
//! After that it is read-only and safe to use from many tasks at once.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use zhconv::{Variant, ZhConverter};

use crate::error::{Error, Result};

/// A deterministic, table-driven rewrite of text from one script variant to
/// another.
pub trait ScriptMapping: Send + Sync {
    fn map(&self, text: &str) -> String;
}

/// The built-in `zhconv` tables for one target variant.
struct BuiltinMapping(&'static ZhConverter);

impl ScriptMapping for BuiltinMapping {
    fn map(&self, text: &str) -> String {
        self.0.convert(text)
    }
}

type Loader = Box<dyn Fn() -> Result<Arc<dyn ScriptMapping>> + Send + Sync>;

/// Variants a Simplified Chinese book can be converted to.
const TRADITIONAL_TARGETS: &[Variant] = &[Variant::ZhTW, Variant::ZhHant, Variant::ZhHK, Variant::ZhMO];

pub struct TextConverter {
    label: String,
    loader: Loader,
    mapping: OnceCell<Arc<dyn ScriptMapping>>,
}

impl TextConverter {
    /// Converter to a Traditional Chinese variant using the built-in tables.
    pub fn new(target: Variant) -> Self {
        Self::with_loader(target.to_string(), move || {
            if !TRADITIONAL_TARGETS.contains(&target) {
                return Err(Error::ConverterInit(format!(
                    "{} is not a Traditional Chinese variant",
                    target
                )));
            }
            Ok(Arc::new(BuiltinMapping(zhconv::get_builtin_converter(target))) as Arc<dyn ScriptMapping>)
        })
    }

    /// Converter for a language tag such as `zh-TW` or `zh-Hant`.
    pub fn from_tag(tag: &str) -> Result<Self> {
        let target: Variant = tag
            .parse()
            .map_err(|_| Error::ConverterInit(format!("unknown Chinese variant: {}", tag)))?;
        Ok(Self::new(target))
    }

    /// Converter whose mapping is produced by `loader` on first use.
    pub fn with_loader<F>(label: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn ScriptMapping>> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            loader: Box::new(loader),
            mapping: OnceCell::new(),
        }
    }

    /// Load the mapping tables. Idempotent; concurrent callers wait for the
    /// first load to finish and never observe a partial handle.
    ///
    /// The loaded mapping must leave printable ASCII untouched, since names
    /// and markup pass through it whole.
    pub fn initialize(&self) -> Result<()> {
        self.mapping.get_or_try_init(|| {
            let mapping = (self.loader)().map_err(|e| match e {
                Error::ConverterInit(_) => e,
                other => Error::ConverterInit(other.to_string()),
            })?;

            let printable: String = (0x20u8..0x7F).map(char::from).collect();
            if mapping.map(&printable) != printable {
                return Err(Error::ConverterInit(format!(
                    "{} mapping rewrites ASCII characters",
                    self.label
                )));
            }

            tracing::info!(target_variant = %self.label, "text converter initialized");
            Ok(mapping)
        })?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.mapping.get().is_some()
    }

    /// The target variant or label this converter was built for.
    pub fn label(&self) -> &str {
        &self.label
    }

    fn mapping(&self) -> Result<&dyn ScriptMapping> {
        self.mapping
            .get()
            .map(|m| m.as_ref())
            .ok_or(Error::NotInitialized)
    }

    /// Convert document text, leaving every `\n`, `\r\n` and `\r` exactly
    /// where it was. Only the spans between line endings are mapped.
    pub fn convert_content(&self, text: &str) -> Result<String> {
        let mapping = self.mapping()?;
        let mut out = String::with_capacity(text.len());
        for segment in split_line_endings(text) {
            match segment {
                Segment::Text(span) => out.push_str(&mapping.map(span)),
                Segment::LineEnding(eol) => out.push_str(eol),
            }
        }
        Ok(out)
    }

    /// Convert a member or file name as a whole.
    pub fn convert_filename(&self, name: &str) -> Result<String> {
        Ok(self.mapping()?.map(name))
    }
}

impl std::fmt::Debug for TextConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextConverter")
            .field("label", &self.label)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    LineEnding(&'a str),
}

/// Split `text` into alternating text spans and line-ending tokens.
/// `\r\n` is one token; a lone `\r` or `\n` is its own token.
fn split_line_endings(text: &str) -> impl Iterator<Item = Segment<'_>> {
    let mut rest = text;
    let mut pending_eol: Option<&str> = None;

    std::iter::from_fn(move || {
        if let Some(eol) = pending_eol.take() {
            return Some(Segment::LineEnding(eol));
        }
        if rest.is_empty() {
            return None;
        }

        let Some(pos) = rest.find(['\r', '\n']) else {
            let span = rest;
            rest = "";
            return Some(Segment::Text(span));
        };

        let eol_len = if rest[pos..].starts_with("\r\n") { 2 } else { 1 };
        let span = &rest[..pos];
        let eol = &rest[pos..pos + eol_len];
        rest = &rest[pos + eol_len..];

        if span.is_empty() {
            Some(Segment::LineEnding(eol))
        } else {
            pending_eol = Some(eol);
            Some(Segment::Text(span))
        }
    })
}
