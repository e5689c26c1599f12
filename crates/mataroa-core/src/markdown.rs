//! Supported Markdown subset.
//!
//! The bot promises a small rendering subset: `*emphasis*`,
//! `***bold italics***`, `` `inline code` `` and headings of levels 1–3.
//! Bodies are never rewritten or rejected. Syntax outside the subset is sent
//! as literal text and only reported so the preview can mention it.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Markdown syntax that is outside the supported subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnsupportedSyntax {
    /// `**bold**` (only `***bold italics***` is supported).
    DoubleAsteriskBold,
    /// `####` and deeper headings.
    DeepHeading,
    /// `[text](url)`
    Link,
    /// `![alt](url)`
    Image,
    /// Triple-backtick code fences.
    CodeFence,
    /// `~~strikethrough~~`
    Strikethrough,
    /// `> quoted` lines.
    Blockquote,
}

impl fmt::Display for UnsupportedSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::DoubleAsteriskBold => "**bold** (use ***bold italics***)",
            Self::DeepHeading => "headings below level 3",
            Self::Link => "[links](url)",
            Self::Image => "![images](url)",
            Self::CodeFence => "``` code blocks",
            Self::Strikethrough => "~~strikethrough~~",
            Self::Blockquote => "> blockquotes",
        };
        f.write_str(text)
    }
}

/// A body after the subset check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredBody {
    /// The body exactly as it will be submitted.
    pub text: String,
    /// Unsupported syntax found, in order of first appearance, without repeats.
    pub unsupported: Vec<UnsupportedSyntax>,
}

impl FilteredBody {
    /// True when every construct in the body renders as promised.
    pub fn is_fully_supported(&self) -> bool {
        self.unsupported.is_empty()
    }
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})\s").expect("valid heading regex"))
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`[^`]+`").expect("valid code regex"))
}

fn image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid image regex"))
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]+\]\([^)]*\)").expect("valid link regex"))
}

fn strike_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"~~[^~]+~~").expect("valid strikethrough regex"))
}

fn asterisks_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*+").expect("valid asterisk regex"))
}

/// Pass a body through the subset check.
///
/// The returned text is always identical to the input.
pub fn filter_body(body: &str) -> FilteredBody {
    let mut unsupported = Vec::new();
    let mut note = |syntax: UnsupportedSyntax| {
        if !unsupported.contains(&syntax) {
            unsupported.push(syntax);
        }
    };

    for line in body.lines() {
        let trimmed = line.trim_start();

        if trimmed.starts_with("```") {
            note(UnsupportedSyntax::CodeFence);
            continue;
        }
        if let Some(caps) = heading_re().captures(trimmed) {
            if caps[1].len() > 3 {
                note(UnsupportedSyntax::DeepHeading);
            }
        }
        if trimmed.starts_with('>') {
            note(UnsupportedSyntax::Blockquote);
        }

        // Inline code is literal, so nothing inside it counts.
        let without_code = inline_code_re().replace_all(line, "");

        if image_re().is_match(&without_code) {
            note(UnsupportedSyntax::Image);
        }
        let without_images = image_re().replace_all(&without_code, "");
        if link_re().is_match(&without_images) {
            note(UnsupportedSyntax::Link);
        }
        if strike_re().is_match(&without_code) {
            note(UnsupportedSyntax::Strikethrough);
        }
        if asterisks_re()
            .find_iter(&without_code)
            .any(|run| run.as_str().len() == 2 || run.as_str().len() > 3)
        {
            note(UnsupportedSyntax::DoubleAsteriskBold);
        }
    }

    FilteredBody {
        text: body.to_string(),
        unsupported,
    }
}
