//! Decides which members get their text converted.

/// Text document types whose content is converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Htm,
    Html,
    Xhtml,
    Ncx,
    Opf,
}

impl TextKind {
    /// Look up a lower-cased extension in the closed target set.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "htm" => Some(TextKind::Htm),
            "html" => Some(TextKind::Html),
            "xhtml" => Some(TextKind::Xhtml),
            "ncx" => Some(TextKind::Ncx),
            "opf" => Some(TextKind::Opf),
            _ => None,
        }
    }
}

/// What the pipeline does with a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Transform(TextKind),
    PassThrough,
}

/// Classify a member by the final dot-segment of its name, case-insensitively.
///
/// Content is never sniffed. A name without a dot has no extension and
/// passes through.
pub fn classify(name: &str) -> Classification {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return Classification::PassThrough;
    };
    match TextKind::from_extension(&ext.to_ascii_lowercase()) {
        Some(kind) => Classification::Transform(kind),
        None => Classification::PassThrough,
    }
}

const SIMPLIFIED_LANGUAGE: &str = "<dc:language>zh-CN</dc:language>";
const TRADITIONAL_LANGUAGE: &str = "<dc:language>zh-TW</dc:language>";

/// Rules applied after script conversion.
///
/// Package documents declaring exactly `zh-CN` are relabelled `zh-TW`. Only
/// that literal element is matched; other spellings of the tag (`zh-Hans`,
/// attributes on the element, different case) are left alone.
pub fn apply_post_rule(kind: TextKind, text: String) -> String {
    match kind {
        TextKind::Opf if text.contains(SIMPLIFIED_LANGUAGE) => {
            text.replace(SIMPLIFIED_LANGUAGE, TRADITIONAL_LANGUAGE)
        }
        _ => text,
    }
}
