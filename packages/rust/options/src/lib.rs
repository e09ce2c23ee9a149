//! Numbered-option extraction from assistant replies.
//!
//! Replies such as
//!
//! ```text
//! Here are a few directions:
//! 1. Dark fantasy
//!    - grim tone, high stakes
//! 2. Cozy mystery
//! Pick one and I'll outline it.
//! ```
//!
//! are split into a preamble, an ordered option list, and a postamble so the
//! chat surface can render selectable choices. A reply needs at least two
//! numbered lines to count as a list; anything else is returned untouched.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

/// Minimum number of numbered lines before a reply is treated as a list.
const MIN_NUMBERED_LINES: usize = 2;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One selectable option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionItem {
    /// The number as written in the reply (not necessarily sequential).
    pub number: u32,
    pub title: String,
    /// Indented or bulleted lines that followed the numbered line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A reply partitioned around its numbered list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionList {
    pub preamble: String,
    pub options: Vec<OptionItem>,
    pub postamble: String,
}

/// Outcome of [`parse_options`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedReply {
    /// Fewer than two numbered lines; the text is returned as-is.
    Plain { text: String },
    Options(OptionList),
}

impl ParsedReply {
    pub fn has_options(&self) -> bool {
        matches!(self, Self::Options(_))
    }

    /// Option titles in list order (empty for plain replies).
    pub fn titles(&self) -> Vec<String> {
        match self {
            Self::Plain { .. } => Vec::new(),
            Self::Options(list) => list.options.iter().map(|o| o.title.clone()).collect(),
        }
    }

    /// Rebuild reply text from the parsed parts.
    pub fn to_text(&self) -> String {
        match self {
            Self::Plain { text } => text.clone(),
            Self::Options(list) => list.to_text(),
        }
    }
}

impl OptionList {
    /// Render back to text: preamble, `N. title` lines with indented
    /// descriptions, postamble.
    pub fn to_text(&self) -> String {
        let mut lines: Vec<String> = Vec::new();

        if !self.preamble.is_empty() {
            lines.push(self.preamble.clone());
            lines.push(String::new());
        }

        for option in &self.options {
            lines.push(format!("{}. {}", option.number, option.title));
            if let Some(description) = &option.description {
                lines.extend(description.lines().map(|l| format!("   {l}")));
            }
        }

        if !self.postamble.is_empty() {
            lines.push(String::new());
            lines.push(self.postamble.clone());
        }

        lines.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Line patterns (compiled once)
// ---------------------------------------------------------------------------

/// `  12. Title` or `3) Title`.
static NUMBERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{1,9})[.)]\s+(\S.*)$").expect("numbered line regex")
});

/// A bullet marker at the start of a (trimmed) line.
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*•]").expect("bullet regex"));

fn numbered(line: &str) -> Option<(u32, &str)> {
    let caps = NUMBERED_RE.captures(line)?;
    let number = caps.get(1)?.as_str().parse().ok()?;
    Some((number, caps.get(2)?.as_str().trim_end()))
}

fn is_continuation(line: &str) -> bool {
    if line.trim().is_empty() {
        return false;
    }
    line.starts_with(char::is_whitespace) || BULLET_RE.is_match(line.trim_start())
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Partition `text` into preamble, numbered options and postamble.
///
/// The list starts at the first numbered line and runs while lines are
/// numbered, indented, or bulleted. Blank lines inside the list are skipped
/// when the list resumes after them; otherwise the list ends there.
#[instrument(skip_all, fields(len = text.len()))]
pub fn parse_options(text: &str) -> ParsedReply {
    let lines: Vec<&str> = text.lines().collect();

    let numbered_count = lines.iter().filter(|l| numbered(l).is_some()).count();
    let Some(first) = lines.iter().position(|l| numbered(l).is_some()) else {
        return ParsedReply::Plain {
            text: text.to_string(),
        };
    };
    if numbered_count < MIN_NUMBERED_LINES {
        return ParsedReply::Plain {
            text: text.to_string(),
        };
    }

    let mut options: Vec<OptionItem> = Vec::new();
    let mut descriptions: Vec<Vec<&str>> = Vec::new();
    let mut end = lines.len();

    let mut i = first;
    while i < lines.len() {
        let line = lines[i];

        if let Some((number, title)) = numbered(line) {
            options.push(OptionItem {
                number,
                title: title.trim().to_string(),
                description: None,
            });
            descriptions.push(Vec::new());
        } else if line.trim().is_empty() {
            let resumes = lines[i + 1..]
                .iter()
                .find(|l| !l.trim().is_empty())
                .is_some_and(|next| numbered(next).is_some() || is_continuation(next));
            if !resumes {
                end = i;
                break;
            }
        } else if is_continuation(line) {
            if let Some(current) = descriptions.last_mut() {
                current.push(line.trim());
            }
        } else {
            end = i;
            break;
        }

        i += 1;
    }

    for (option, extra) in options.iter_mut().zip(descriptions) {
        if !extra.is_empty() {
            option.description = Some(extra.join("\n"));
        }
    }

    let preamble = lines[..first].join("\n").trim().to_string();
    let postamble = lines[end..].join("\n").trim().to_string();

    debug!(options = options.len(), "parsed numbered options");

    ParsedReply::Options(OptionList {
        preamble,
        options,
        postamble,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "\
Here are three directions for your novel:

1. Dark fantasy
   A grim world where magic has a cost.
   - high stakes
2) Cozy mystery
   - small village setting
3. Space opera

Let me know which one you'd like to develop.";

    fn normalize(s: &str) -> String {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn unwrap_list(reply: ParsedReply) -> OptionList {
        match reply {
            ParsedReply::Options(list) => list,
            ParsedReply::Plain { text } => panic!("expected options, got plain: {text}"),
        }
    }

    #[test]
    fn parses_numbers_titles_and_descriptions() {
        let list = unwrap_list(parse_options(REPLY));

        assert_eq!(list.preamble, "Here are three directions for your novel:");
        assert_eq!(
            list.postamble,
            "Let me know which one you'd like to develop."
        );
        assert_eq!(list.options.len(), 3);

        assert_eq!(list.options[0].number, 1);
        assert_eq!(list.options[0].title, "Dark fantasy");
        assert_eq!(
            list.options[0].description.as_deref(),
            Some("A grim world where magic has a cost.\n- high stakes")
        );

        assert_eq!(list.options[1].number, 2);
        assert_eq!(list.options[1].title, "Cozy mystery");
        assert_eq!(
            list.options[1].description.as_deref(),
            Some("- small village setting")
        );

        assert_eq!(list.options[2].number, 3);
        assert_eq!(list.options[2].title, "Space opera");
        assert!(list.options[2].description.is_none());
    }

    #[test]
    fn reconstruction_matches_input_modulo_whitespace() {
        let input = "\
Pick a structure:
1. Three acts
   - setup, confrontation, resolution
2. Hero's journey
   - twelve stages

Either works for a novel.";
        let reply = parse_options(input);
        assert!(reply.has_options());
        assert_eq!(normalize(&reply.to_text()), normalize(input));
    }

    #[test]
    fn single_numbered_line_is_plain() {
        let text = "Step 1 is done.\n1. Outline the plot\nThat's all for now.";
        let reply = parse_options(text);
        assert_eq!(
            reply,
            ParsedReply::Plain {
                text: text.to_string()
            }
        );
        assert!(reply.titles().is_empty());
    }

    #[test]
    fn no_numbered_lines_is_plain() {
        let reply = parse_options("Sure, I can help with that.");
        assert!(!reply.has_options());
        assert_eq!(reply.to_text(), "Sure, I can help with that.");
    }

    #[test]
    fn list_without_preamble_or_postamble() {
        let list = unwrap_list(parse_options("1. Yes\n2. No"));
        assert!(list.preamble.is_empty());
        assert!(list.postamble.is_empty());
        assert_eq!(list.options.len(), 2);
    }

    #[test]
    fn unindented_prose_ends_the_list() {
        let list = unwrap_list(parse_options(
            "Options:\n1. Alpha\n2. Beta\nThanks!\n3. Not part of the list",
        ));
        assert_eq!(list.options.len(), 2);
        assert_eq!(list.postamble, "Thanks!\n3. Not part of the list");
    }

    #[test]
    fn numbering_is_kept_as_written() {
        let list = unwrap_list(parse_options("4. Four\n7) Seven"));
        let numbers: Vec<u32> = list.options.iter().map(|o| o.number).collect();
        assert_eq!(numbers, vec![4, 7]);
    }

    #[test]
    fn blank_lines_between_options_are_skipped() {
        let list = unwrap_list(parse_options("1. One\n\n2. Two\n\n\nDone."));
        assert_eq!(list.options.len(), 2);
        assert_eq!(list.postamble, "Done.");
    }

    #[test]
    fn titles_in_order() {
        let reply = parse_options(REPLY);
        assert_eq!(
            reply.titles(),
            vec!["Dark fantasy", "Cozy mystery", "Space opera"]
        );
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_string(&parse_options("1. A\n2. B")).unwrap();
        assert!(json.contains(r#""kind":"options""#));
        let json = serde_json::to_string(&parse_options("plain")).unwrap();
        assert!(json.contains(r#""kind":"plain""#));
    }
}
