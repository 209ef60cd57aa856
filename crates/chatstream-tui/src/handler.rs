use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseEvent, MouseEventKind};
use crate::app::{App, InputMode};
use crate::tui::AppEvent;

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

pub fn handle_event(app: &mut App, event: AppEvent) {
    match event {
        AppEvent::Key(key) => handle_key(app, key),
        AppEvent::Mouse(mouse) => handle_mouse(app, mouse),
        AppEvent::Paste(text) => {
            if app.input_mode == InputMode::Editing {
                insert_text(app, &text);
            }
        }
        AppEvent::Resize(_, _) => {}
        AppEvent::Tick => app.tick_animation(),
    }
}

fn handle_key(app: &mut App, key: KeyEvent) {
    // Global keys that work in any mode
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        match key.code {
            KeyCode::Char('c') => {
                app.should_quit = true;
                return;
            }
            KeyCode::Char('l') => {
                app.clear_history();
                return;
            }
            KeyCode::Char('d') => {
                app.scroll_down(half_page(app));
                return;
            }
            KeyCode::Char('u') => {
                app.scroll_up(half_page(app));
                return;
            }
            _ => {}
        }
    }

    match (key.code, app.input_mode) {
        (KeyCode::PageUp, _) => app.scroll_up(half_page(app)),
        (KeyCode::PageDown, _) => app.scroll_down(half_page(app)),
        (_, InputMode::Normal) => handle_normal_mode(app, key),
        (_, InputMode::Editing) => handle_editing_mode(app, key),
    }
}

fn half_page(app: &App) -> u16 {
    (app.query_chat_height / 2).max(1)
}

fn handle_normal_mode(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Char('q') => app.should_quit = true,

        KeyCode::Char('i') | KeyCode::Char('a') | KeyCode::Enter | KeyCode::Tab => {
            app.input_mode = InputMode::Editing;
        }

        KeyCode::Esc => app.cancel_stream(),

        KeyCode::Char('j') | KeyCode::Down => app.scroll_down(1),
        KeyCode::Char('k') | KeyCode::Up => app.scroll_up(1),
        KeyCode::Char('g') => app.scroll_up(u16::MAX),
        KeyCode::Char('G') => app.scroll_down(u16::MAX),

        _ => {}
    }
}

fn handle_editing_mode(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            if app.controller.is_streaming() {
                app.cancel_stream();
            } else {
                app.input_mode = InputMode::Normal;
            }
        }
        KeyCode::Enter
            if key.modifiers.intersects(KeyModifiers::SHIFT | KeyModifiers::ALT) =>
        {
            insert_text(app, "\n");
        }
        KeyCode::Enter => app.submit_prompt(),
        KeyCode::Tab => app.input_mode = InputMode::Normal,
        KeyCode::Backspace => {
            if app.query_cursor > 0 {
                app.query_cursor -= 1;
                let byte_pos = char_to_byte_index(&app.query_input, app.query_cursor);
                app.query_input.remove(byte_pos);
            }
        }
        KeyCode::Delete => {
            let char_count = app.query_input.chars().count();
            if app.query_cursor < char_count {
                let byte_pos = char_to_byte_index(&app.query_input, app.query_cursor);
                app.query_input.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            app.query_cursor = app.query_cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            let char_count = app.query_input.chars().count();
            app.query_cursor = (app.query_cursor + 1).min(char_count);
        }
        KeyCode::Home => {
            app.query_cursor = 0;
        }
        KeyCode::End => {
            app.query_cursor = app.query_input.chars().count();
        }
        KeyCode::Up => app.scroll_up(1),
        KeyCode::Down => app.scroll_down(1),
        KeyCode::Char(c) => {
            let byte_pos = char_to_byte_index(&app.query_input, app.query_cursor);
            app.query_input.insert(byte_pos, c);
            app.query_cursor += 1;
        }
        _ => {}
    }
}

fn insert_text(app: &mut App, text: &str) {
    // Terminals deliver pasted newlines as '\r'
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let byte_pos = char_to_byte_index(&app.query_input, app.query_cursor);
    app.query_input.insert_str(byte_pos, &text);
    app.query_cursor += text.chars().count();
}

fn handle_mouse(app: &mut App, mouse: MouseEvent) {
    match mouse.kind {
        MouseEventKind::ScrollDown => app.scroll_down(3),
        MouseEventKind::ScrollUp => app.scroll_up(3),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatstream_core::{
        CancellationToken, ChatSessionController, ChatTranscript, CompletionSource, MemoryStore,
        StreamErrorPolicy, StreamEvent,
    };
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct ClosedSource;

    impl CompletionSource for ClosedSource {
        fn stream(&self, _prompt: &str, _cancel: CancellationToken) -> mpsc::Receiver<StreamEvent> {
            mpsc::channel(1).1
        }
    }

    fn app() -> App {
        let transcript = ChatTranscript::new(Box::new(MemoryStore::new()));
        let controller =
            ChatSessionController::new(transcript, Arc::new(ClosedSource), StreamErrorPolicy::Retain);
        App::new(controller, "gpt-4".to_string())
    }

    fn press(app: &mut App, code: KeyCode, modifiers: KeyModifiers) {
        handle_event(app, AppEvent::Key(KeyEvent::new(code, modifiers)));
    }

    fn type_str(app: &mut App, text: &str) {
        for c in text.chars() {
            press(app, KeyCode::Char(c), KeyModifiers::NONE);
        }
    }

    #[test]
    fn test_char_to_byte_index() {
        assert_eq!(char_to_byte_index("héllo", 2), 3);
        assert_eq!(char_to_byte_index("abc", 10), 3);
    }

    #[test]
    fn test_enter_submits() {
        let mut app = app();
        type_str(&mut app, "Hello");
        press(&mut app, KeyCode::Enter, KeyModifiers::NONE);

        assert!(app.query_input.is_empty());
        assert_eq!(app.controller.transcript().len(), 1);
    }

    #[test]
    fn test_shift_enter_inserts_newline() {
        let mut app = app();
        type_str(&mut app, "line one");
        press(&mut app, KeyCode::Enter, KeyModifiers::SHIFT);
        type_str(&mut app, "two");

        assert_eq!(app.query_input, "line one\ntwo");
        assert!(app.controller.transcript().is_empty());
    }

    #[test]
    fn test_editing_in_the_middle() {
        let mut app = app();
        type_str(&mut app, "héllo");
        press(&mut app, KeyCode::Left, KeyModifiers::NONE);
        press(&mut app, KeyCode::Left, KeyModifiers::NONE);
        press(&mut app, KeyCode::Backspace, KeyModifiers::NONE);
        type_str(&mut app, "L");

        assert_eq!(app.query_input, "héLlo");
        assert_eq!(app.query_cursor, 3);
    }

    #[test]
    fn test_paste_normalizes_newlines() {
        let mut app = app();
        handle_event(&mut app, AppEvent::Paste("a\r\nb\rc".to_string()));
        assert_eq!(app.query_input, "a\nb\nc");
        assert_eq!(app.query_cursor, 5);
    }

    #[test]
    fn test_esc_then_quit() {
        let mut app = app();
        press(&mut app, KeyCode::Esc, KeyModifiers::NONE);
        assert_eq!(app.input_mode, InputMode::Normal);
        press(&mut app, KeyCode::Char('q'), KeyModifiers::NONE);
        assert!(app.should_quit);
    }

    #[test]
    fn test_ctrl_l_clears_history() {
        let mut app = app();
        type_str(&mut app, "Hello");
        press(&mut app, KeyCode::Enter, KeyModifiers::NONE);
        press(&mut app, KeyCode::Char('l'), KeyModifiers::CONTROL);
        assert!(app.controller.transcript().is_empty());
    }
}
