use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Wrap},
};
use crate::app::{App, InputMode};
use chatstream_core::{ChatRole, SpanStyle, StyledLine};

/// Height of the prompt box, borders included
const MAX_INPUT_LINES: u16 = 6;

fn span_style(style: &SpanStyle) -> Style {
    let mut out = Style::default();

    if let Some(level) = style.heading {
        out = out.fg(match level {
            1 => Color::Yellow,
            2 => Color::LightYellow,
            _ => Color::LightCyan,
        });
    }
    if style.code_block {
        out = out.fg(Color::Green);
    }
    if style.code {
        out = out.fg(Color::LightGreen).bg(Color::DarkGray);
    }
    if style.dim {
        out = out.fg(Color::DarkGray);
    }
    if style.bold {
        out = out.add_modifier(Modifier::BOLD);
    }
    if style.italic {
        out = out.add_modifier(Modifier::ITALIC);
    }
    if style.strikethrough {
        out = out.add_modifier(Modifier::CROSSED_OUT);
    }
    if style.link {
        out = out.fg(Color::Blue).add_modifier(Modifier::UNDERLINED);
    }
    out
}

/// Map a toolkit-neutral styled line onto ratatui spans
fn to_line(line: &StyledLine) -> Line<'static> {
    if line.spans.is_empty() {
        return Line::default();
    }
    Line::from(
        line.spans
            .iter()
            .map(|span| Span::styled(span.text.clone(), span_style(&span.style)))
            .collect::<Vec<_>>(),
    )
}

fn role_header(role: ChatRole) -> Line<'static> {
    let color = match role {
        ChatRole::User => Color::Cyan,
        ChatRole::Assistant => Color::Yellow,
    };
    Line::from(Span::styled(
        role.display_name(),
        Style::default().fg(color).add_modifier(Modifier::BOLD),
    ))
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    let input_lines = (app.query_input.split('\n').count() as u16).min(MAX_INPUT_LINES - 2);

    // Main layout: header, chat, input, footer
    let [header_area, chat_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(input_lines + 2),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_chat(app, frame, chat_area);
    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let header = Line::from(vec![
        Span::styled(" chatstream ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(format!("({})", app.model), Style::default().fg(Color::DarkGray)),
    ]);
    frame.render_widget(Paragraph::new(header), area);
}

fn render_chat(app: &mut App, frame: &mut Frame, area: Rect) {
    // Store chat area dimensions for scroll calculations (inner size minus borders)
    let height_changed = app.query_chat_height != area.height.saturating_sub(2);
    let width_changed = app.query_chat_width != area.width.saturating_sub(2);
    app.query_chat_height = area.height.saturating_sub(2);
    app.query_chat_width = area.width.saturating_sub(2);
    if (height_changed || width_changed) && app.follow_output {
        app.scroll_query_to_bottom();
    }

    let border_color = if app.input_mode == InputMode::Normal {
        Color::Cyan
    } else {
        Color::DarkGray
    };
    let chat_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(" Chat ");

    let chat_text = if app.rendered.is_empty() && !app.controller.is_streaming() {
        Text::from(Span::styled(
            "Type your message...",
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        let mut lines: Vec<Line> = Vec::new();

        for msg in &app.rendered {
            lines.push(role_header(msg.role));
            lines.extend(msg.lines.iter().map(to_line));
            lines.push(Line::default());
        }

        if app.is_thinking() {
            lines.push(role_header(ChatRole::Assistant));
            // Animated ellipsis: cycles through ".", "..", "..."
            let dots = ".".repeat((app.animation_frame as usize) + 1);
            lines.push(Line::from(Span::styled(
                format!("Thinking{}", dots),
                Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
            )));
        }

        Text::from(lines)
    };

    // No trimming, leading whitespace in code must survive wrapping
    let chat = Paragraph::new(chat_text)
        .block(chat_block)
        .wrap(Wrap { trim: false })
        .scroll((app.query_scroll, 0));

    frame.render_widget(chat, area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let editing = app.input_mode == InputMode::Editing;
    let border_color = if editing { Color::Yellow } else { Color::DarkGray };

    let input_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(" Message (Enter to send, Shift+Enter for newline) ");

    let inner_width = area.width.saturating_sub(2) as usize;
    let inner_height = area.height.saturating_sub(2) as usize;

    // Locate the cursor as (row, col) within the multi-line input
    let before_cursor: String = app.query_input.chars().take(app.query_cursor).collect();
    let cursor_row = before_cursor.matches('\n').count();
    let cursor_col = before_cursor
        .rsplit('\n')
        .next()
        .map(|l| l.chars().count())
        .unwrap_or(0);

    // Scroll offsets that keep the cursor visible
    let row_offset = (cursor_row + 1).saturating_sub(inner_height.max(1));
    let col_offset = if inner_width == 0 {
        0
    } else {
        (cursor_col + 1).saturating_sub(inner_width)
    };

    let visible: Vec<Line> = app
        .query_input
        .split('\n')
        .skip(row_offset)
        .take(inner_height)
        .map(|line| {
            Line::from(
                line.chars()
                    .skip(col_offset)
                    .take(inner_width)
                    .collect::<String>(),
            )
        })
        .collect();

    // Use cyan text to match the "You:" style - visible in both light and dark terminals
    let input = Paragraph::new(Text::from(visible))
        .style(Style::default().fg(Color::Cyan))
        .block(input_block);

    frame.render_widget(input, area);

    if editing {
        let cursor_x = (cursor_col - col_offset) as u16;
        let cursor_y = (cursor_row - row_offset) as u16;
        frame.set_cursor_position((area.x + cursor_x + 1, area.y + cursor_y + 1));
    }
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let footer = if let Some(status) = &app.status {
        Line::from(Span::styled(
            format!(" {} ", status),
            Style::default().fg(Color::Red),
        ))
    } else {
        let hints = match (app.input_mode, app.controller.is_streaming()) {
            (_, true) => " Esc: stop response | Ctrl+C: quit ",
            (InputMode::Editing, false) => " Esc: scroll mode | Ctrl+L: clear history | Ctrl+C: quit ",
            (InputMode::Normal, false) => " i: type | j/k: scroll | g/G: top/bottom | q: quit ",
        };
        Line::from(Span::styled(hints, Style::default().fg(Color::DarkGray)))
    };
    frame.render_widget(Paragraph::new(footer), area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatstream_core::render_markdown;

    #[test]
    fn test_to_line_maps_styles() {
        let lines = render_markdown("**bold** `code`");
        let line = to_line(&lines[0]);
        assert_eq!(line.spans[0].content, "bold");
        assert!(line.spans[0].style.add_modifier.contains(Modifier::BOLD));
        assert_eq!(line.spans[2].style.bg, Some(Color::DarkGray));
    }

    #[test]
    fn test_to_line_keeps_code_indentation() {
        let lines = render_markdown("```\n    indented\n```");
        let line = to_line(&lines[0]);
        assert_eq!(line.spans[0].content, "    indented");
    }

    #[test]
    fn test_empty_line() {
        assert_eq!(to_line(&StyledLine::default()), Line::default());
    }
}
