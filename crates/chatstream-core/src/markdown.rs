//! Markdown to styled lines
//!
//! Output is toolkit-neutral: a front end maps [`SpanStyle`] onto whatever its
//! widgets understand. Rendering is pure and never fails. Source newlines are
//! kept as line breaks and code block contents are reproduced verbatim, so a
//! half-streamed, still-open code fence renders sensibly.

use std::ops::Range;

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanStyle {
    pub bold: bool,
    pub italic: bool,
    pub strikethrough: bool,
    /// Inline `code`
    pub code: bool,
    pub code_block: bool,
    pub heading: Option<u8>,
    pub link: bool,
    /// Decorations such as list bullets and quote bars
    pub dim: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledSpan {
    pub text: String,
    pub style: SpanStyle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyledLine {
    pub spans: Vec<StyledSpan>,
}

impl StyledLine {
    pub fn raw(text: &str) -> Self {
        Self {
            spans: vec![StyledSpan {
                text: text.to_string(),
                style: SpanStyle::default(),
            }],
        }
    }

    pub fn plain_text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }

    pub fn is_blank(&self) -> bool {
        self.spans.iter().all(|s| s.text.trim().is_empty())
    }
}

/// Render a Markdown buffer into styled lines.
pub fn render_markdown(text: &str) -> Vec<StyledLine> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let mut builder = LineBuilder::new(text);
    for (event, range) in Parser::new_ext(text, options).into_offset_iter() {
        builder.handle(event, range);
    }
    let lines = builder.finish();

    if lines.iter().all(StyledLine::is_blank) && !text.trim().is_empty() {
        return render_plain(text);
    }
    lines
}

/// Unstyled fallback, one line per source line.
pub fn render_plain(text: &str) -> Vec<StyledLine> {
    text.split('\n').map(StyledLine::raw).collect()
}

fn heading_number(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn is_block(tag: &Tag<'_>) -> bool {
    matches!(
        tag,
        Tag::Paragraph
            | Tag::Heading(..)
            | Tag::BlockQuote
            | Tag::CodeBlock(_)
            | Tag::List(_)
            | Tag::Item
            | Tag::FootnoteDefinition(_)
            | Tag::Table(_)
            | Tag::TableHead
            | Tag::TableRow
    )
}

/// Containers whose end offset can run past trailing blank lines.
fn is_container(tag: &Tag<'_>) -> bool {
    matches!(
        tag,
        Tag::BlockQuote | Tag::List(_) | Tag::Item | Tag::FootnoteDefinition(_) | Tag::Table(_)
    )
}

fn is_indent(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c == ' ' || c == '\t')
}

struct LineBuilder<'a> {
    source: &'a str,
    lines: Vec<StyledLine>,
    current: Vec<StyledSpan>,
    style: SpanStyle,
    /// Next ordinal for each open list, `None` for bullet lists
    lists: Vec<Option<u64>>,
    quote_depth: usize,
    paragraph_depth: usize,
    /// Source offset up to which content has been laid out
    consumed: usize,
    /// Inside an indented code block copied straight from the source
    raw_code: bool,
}

impl<'a> LineBuilder<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            lines: Vec::new(),
            current: Vec::new(),
            style: SpanStyle::default(),
            lists: Vec::new(),
            quote_depth: 0,
            paragraph_depth: 0,
            consumed: 0,
            raw_code: false,
        }
    }

    fn slice(&self, range: Range<usize>) -> &'a str {
        self.source.get(range).unwrap_or("")
    }

    fn handle(&mut self, event: Event<'_>, range: Range<usize>) {
        match event {
            Event::Start(tag) => {
                if is_block(&tag) {
                    self.source_gap(range.start);
                } else {
                    self.source_indent(range.start);
                }
                self.start(tag, range.clone());
                self.consumed = self.consumed.max(range.start);
                return;
            }
            Event::End(tag) => {
                let container = is_container(&tag);
                self.end(tag);
                if container {
                    return;
                }
            }
            Event::Text(text) => {
                if self.raw_code {
                    // Already copied from the source at block start
                } else if self.style.code_block {
                    self.push_verbatim(&text);
                } else {
                    self.source_indent(range.start);
                    self.push_text(&text, self.style);
                }
            }
            Event::Code(code) => {
                self.source_indent(range.start);
                let style = SpanStyle {
                    code: true,
                    ..self.style
                };
                self.push_text(&code, style);
            }
            Event::Html(html) => self.push_verbatim(&html),
            Event::SoftBreak | Event::HardBreak => {
                self.trailing_whitespace(range.clone());
                self.newline();
            }
            Event::Rule => {
                self.source_gap(range.start);
                self.flush();
                self.push_decoration("───");
                self.newline();
            }
            Event::TaskListMarker(checked) => {
                self.push_decoration(if checked { "[x] " } else { "[ ] " });
            }
            Event::FootnoteReference(name) => {
                let text = format!("[^{name}]");
                self.push_text(&text, self.style);
            }
        }
        self.consumed = self.consumed.max(range.end);
    }

    fn start(&mut self, tag: Tag<'_>, range: Range<usize>) {
        match tag {
            Tag::Paragraph => self.paragraph_depth += 1,
            Tag::Heading(level, _, _) => {
                self.flush();
                self.style.heading = Some(heading_number(level));
                self.style.bold = true;
            }
            Tag::BlockQuote => {
                self.flush();
                self.quote_depth += 1;
            }
            Tag::CodeBlock(kind) => {
                self.flush();
                match kind {
                    CodeBlockKind::Fenced(lang) => {
                        if !lang.is_empty() {
                            self.push_decoration(&lang);
                            self.newline();
                        }
                    }
                    // Indented code keeps its indentation when it sits at top level
                    CodeBlockKind::Indented if self.lists.is_empty() && self.quote_depth == 0 => {
                        self.raw_code = true;
                    }
                    CodeBlockKind::Indented => {}
                }
                self.style.code_block = true;
                if self.raw_code {
                    let line_start = self.slice(0..range.start).rfind('\n').map_or(0, |i| i + 1);
                    let block = self.slice(line_start..range.end).trim_end_matches('\n');
                    self.push_verbatim(block);
                }
            }
            Tag::List(start) => {
                self.flush();
                self.lists.push(start);
            }
            Tag::Item => {
                self.flush();
                let indent = "  ".repeat(self.lists.len().saturating_sub(1));
                let marker = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let marker = format!("{indent}{n}. ");
                        *n += 1;
                        marker
                    }
                    _ => format!("{indent}• "),
                };
                self.push_decoration(&marker);
            }
            Tag::Emphasis => self.style.italic = true,
            Tag::Strong => self.style.bold = true,
            Tag::Strikethrough => self.style.strikethrough = true,
            Tag::Link(..) => self.style.link = true,
            _ => {}
        }
    }

    fn end(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph => {
                self.flush();
                self.paragraph_depth = self.paragraph_depth.saturating_sub(1);
            }
            Tag::Heading(..) => {
                self.flush();
                self.style.heading = None;
                self.style.bold = false;
            }
            Tag::BlockQuote => {
                self.flush();
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }
            Tag::CodeBlock(_) => {
                self.flush();
                self.style.code_block = false;
                self.raw_code = false;
            }
            Tag::List(_) => {
                self.flush();
                self.lists.pop();
            }
            Tag::Item => self.flush(),
            Tag::Emphasis => self.style.italic = false,
            Tag::Strong => self.style.bold = self.style.heading.is_some(),
            Tag::Strikethrough => self.style.strikethrough = false,
            Tag::Link(..) => self.style.link = false,
            _ => {}
        }
    }

    /// One blank line per blank source line between the last laid out
    /// content and a block starting at `start`.
    fn source_gap(&mut self, start: usize) {
        if start <= self.consumed {
            return;
        }
        let gap = self.slice(self.consumed..start);
        let line_open = self.consumed > 0 && !self.slice(0..self.consumed).ends_with('\n');
        let blanks = gap.matches('\n').count().saturating_sub(usize::from(line_open));
        self.consumed = start;

        if blanks > 0 {
            self.flush();
            for _ in 0..blanks {
                self.lines.push(StyledLine::default());
            }
        }
    }

    /// Re-insert leading whitespace that Markdown strips from paragraph lines.
    fn source_indent(&mut self, pos: usize) {
        if self.paragraph_depth == 0 || !self.current.is_empty() {
            return;
        }
        let line_start = self.slice(0..pos).rfind('\n').map_or(0, |i| i + 1);
        let indent = self.slice(line_start..pos);
        if is_indent(indent) {
            self.push_text(indent, SpanStyle::default());
        }
    }

    /// Keep whitespace that ends a line before a soft or hard break.
    fn trailing_whitespace(&mut self, range: Range<usize>) {
        let break_text = self.slice(range.clone());
        let newline = break_text
            .find('\n')
            .map_or(range.end, |i| range.start + i);
        let from = self.consumed.min(newline);
        let tail = self.slice(from..newline).trim_end_matches('\r');
        if is_indent(tail) {
            self.push_text(tail, self.style);
        }
    }

    fn push_text(&mut self, text: &str, style: SpanStyle) {
        if text.is_empty() {
            return;
        }
        self.quote_prefix();
        self.current.push(StyledSpan {
            text: text.to_string(),
            style,
        });
    }

    fn push_decoration(&mut self, text: &str) {
        self.quote_prefix();
        self.current.push(StyledSpan {
            text: text.to_string(),
            style: SpanStyle {
                dim: true,
                ..SpanStyle::default()
            },
        });
    }

    /// Push text that may contain newlines, one output line per source line.
    fn push_verbatim(&mut self, text: &str) {
        let style = self.style;
        let mut parts = text.split('\n');
        if let Some(first) = parts.next() {
            self.push_text(first, style);
        }
        for part in parts {
            self.newline();
            self.push_text(part, style);
        }
    }

    fn quote_prefix(&mut self) {
        if self.quote_depth > 0 && self.current.is_empty() {
            self.current.push(StyledSpan {
                text: "│ ".repeat(self.quote_depth),
                style: SpanStyle {
                    dim: true,
                    ..SpanStyle::default()
                },
            });
        }
    }

    fn newline(&mut self) {
        self.lines.push(StyledLine {
            spans: std::mem::take(&mut self.current),
        });
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.newline();
        }
    }

    fn finish(mut self) -> Vec<StyledLine> {
        self.flush();
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[StyledLine]) -> Vec<String> {
        lines.iter().map(StyledLine::plain_text).collect()
    }

    #[test]
    fn test_bold_and_italic() {
        let lines = render_markdown("plain **bold** and *italic*");
        assert_eq!(lines.len(), 1);
        let spans = &lines[0].spans;
        assert_eq!(spans[0].text, "plain ");
        assert!(!spans[0].style.bold);
        assert_eq!(spans[1].text, "bold");
        assert!(spans[1].style.bold);
        assert_eq!(spans[3].text, "italic");
        assert!(spans[3].style.italic);
    }

    #[test]
    fn test_heading_levels() {
        let lines = render_markdown("# Title\n\n### Sub");
        assert_eq!(texts(&lines), vec!["Title", "", "Sub"]);
        assert_eq!(lines[0].spans[0].style.heading, Some(1));
        assert!(lines[0].spans[0].style.bold);
        assert_eq!(lines[2].spans[0].style.heading, Some(3));
    }

    #[test]
    fn test_code_block_preserves_whitespace() {
        let lines = render_markdown("```rust\nfn main() {\n    let x = 1;\n\n}\n```");
        assert_eq!(
            texts(&lines),
            vec!["rust", "fn main() {", "    let x = 1;", "", "}"]
        );
        assert!(lines[2].spans[0].style.code_block);
    }

    #[test]
    fn test_unclosed_code_fence_while_streaming() {
        let lines = render_markdown("Here:\n\n```\nfor i in 0..3 {\n    println!(\"{i}\");");
        assert_eq!(
            texts(&lines),
            vec!["Here:", "", "for i in 0..3 {", "    println!(\"{i}\");"]
        );
        assert!(lines[3].spans[0].style.code_block);
    }

    #[test]
    fn test_soft_breaks_keep_source_newlines() {
        let lines = render_markdown("first line\nsecond line");
        assert_eq!(texts(&lines), vec!["first line", "second line"]);
    }

    #[test]
    fn test_lists() {
        let lines = render_markdown("- one\n- two\n\n1. a\n2. b");
        assert_eq!(texts(&lines), vec!["• one", "• two", "", "1. a", "2. b"]);
        assert!(lines[0].spans[0].style.dim);
    }

    #[test]
    fn test_inline_code() {
        let lines = render_markdown("run `cargo test` now");
        assert!(lines[0].spans[1].style.code);
        assert_eq!(lines[0].spans[1].text, "cargo test");
    }

    #[test]
    fn test_unterminated_bold_is_literal() {
        let lines = render_markdown("this is **not yet closed");
        assert_eq!(texts(&lines), vec!["this is **not yet closed"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(render_markdown("").is_empty());
    }

    #[test]
    fn test_render_plain() {
        let lines = render_plain("a\n  b");
        assert_eq!(texts(&lines), vec!["a", "  b"]);
        assert_eq!(lines[1].spans[0].style, SpanStyle::default());
    }

    #[test]
    fn test_render_is_deterministic() {
        let text = "## Plan\n\n1. **parse**\n2. render `lines`\n\n> quoted";
        assert_eq!(render_markdown(text), render_markdown(text));
    }

    #[test]
    fn test_blank_line_runs_are_kept() {
        assert_eq!(texts(&render_markdown("a\n\n\nb")), vec!["a", "", "", "b"]);
        assert_eq!(
            texts(&render_markdown("a\n\n\n\nb")),
            vec!["a", "", "", "", "b"]
        );
    }

    #[test]
    fn test_leading_spaces_are_kept() {
        assert_eq!(texts(&render_markdown("   x")), vec!["   x"]);
        assert_eq!(
            texts(&render_markdown("first\n  second **bold**")),
            vec!["first", "  second bold"]
        );
    }

    #[test]
    fn test_hard_break_spaces_are_kept() {
        let lines = render_markdown("line with hard  \nbreak");
        assert_eq!(texts(&lines), vec!["line with hard  ", "break"]);
    }

    #[test]
    fn test_indented_code_keeps_indentation() {
        let lines = render_markdown("intro\n\n    let x = 1;\n        nested();");
        assert_eq!(
            texts(&lines),
            vec!["intro", "", "    let x = 1;", "        nested();"]
        );
        assert!(lines[3].spans[0].style.code_block);
    }

    #[test]
    fn test_loose_list_keeps_gap() {
        let lines = render_markdown("- a\n\n- b");
        assert_eq!(texts(&lines), vec!["• a", "", "• b"]);
    }
}
