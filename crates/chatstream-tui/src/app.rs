use chatstream_core::{ChatSessionController, RenderedMessage, SessionUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub input_mode: InputMode,
    pub controller: ChatSessionController,
    pub model: String,

    // Prompt input
    pub query_input: String,
    pub query_cursor: usize, // cursor position in query_input, in chars

    // Chat view
    pub rendered: Vec<RenderedMessage>,
    pub query_scroll: u16,
    pub query_chat_height: u16, // Height of chat area for scroll calculations
    pub query_chat_width: u16,  // Width of chat area for wrap calculations
    pub follow_output: bool,

    // Last stream error, shown in the footer
    pub status: Option<String>,

    // Animation frame for the "Thinking..." indicator (0-2)
    pub animation_frame: u8,
}

impl App {
    pub fn new(controller: ChatSessionController, model: String) -> Self {
        let mut app = Self {
            should_quit: false,
            input_mode: InputMode::Editing,
            controller,
            model,

            query_input: String::new(),
            query_cursor: 0,

            rendered: Vec::new(),
            query_scroll: 0,
            query_chat_height: 0,
            query_chat_width: 0,
            follow_output: true,

            status: None,
            animation_frame: 0,
        };
        app.refresh_transcript();
        app
    }

    /// Send the current input as a prompt. Blank input is left untouched.
    pub fn submit_prompt(&mut self) {
        if !self.controller.send_prompt(&self.query_input) {
            return;
        }
        self.query_input.clear();
        self.query_cursor = 0;
        self.status = None;
        self.animation_frame = 0;
        self.follow_output = true;
        self.refresh_transcript();
    }

    pub fn cancel_stream(&mut self) {
        if self.controller.cancel() {
            self.status = Some("Response cancelled".to_string());
        }
    }

    pub fn clear_history(&mut self) {
        self.controller.clear_history();
        self.status = None;
        self.query_scroll = 0;
        self.refresh_transcript();
    }

    /// Apply the outcome of one stream event.
    pub fn on_session_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::TranscriptChanged | SessionUpdate::Finished => self.refresh_transcript(),
            SessionUpdate::Unchanged => {}
            SessionUpdate::Failed(reason) => {
                self.status = Some(reason);
                self.refresh_transcript();
            }
        }
    }

    /// Re-render the transcript and keep the newest text in view.
    pub fn refresh_transcript(&mut self) {
        self.rendered = self.controller.rendered_transcript();
        if self.follow_output {
            self.scroll_query_to_bottom();
        }
    }

    /// True while waiting on the first delta of a reply
    pub fn is_thinking(&self) -> bool {
        self.controller
            .accumulated_text()
            .is_some_and(|text| text.is_empty())
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.controller.is_streaming() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    /// Total chat lines once wrapped to the chat width
    pub fn total_chat_lines(&self) -> u16 {
        // Use actual chat width for wrap calculation, default to 50 if not set
        let wrap_width = if self.query_chat_width > 0 {
            self.query_chat_width as usize
        } else {
            50
        };

        let mut total_lines: u16 = 0;

        for msg in &self.rendered {
            total_lines = total_lines.saturating_add(1); // Role line
            for line in &msg.lines {
                // Use character count, not byte length, for proper UTF-8 handling
                let char_count = line.plain_text().chars().count();
                let wrapped = if char_count == 0 {
                    1
                } else {
                    char_count.div_ceil(wrap_width)
                };
                total_lines = total_lines.saturating_add(wrapped as u16);
            }
            total_lines = total_lines.saturating_add(1); // Blank line after message
        }

        if self.is_thinking() {
            total_lines = total_lines.saturating_add(2); // "Assistant:" + "Thinking..."
        }

        total_lines
    }

    fn max_scroll(&self) -> u16 {
        let visible_height = if self.query_chat_height > 0 {
            self.query_chat_height
        } else {
            20
        };
        self.total_chat_lines().saturating_sub(visible_height)
    }

    pub fn scroll_query_to_bottom(&mut self) {
        self.query_scroll = self.max_scroll();
    }

    pub fn scroll_up(&mut self, lines: u16) {
        self.query_scroll = self.query_scroll.saturating_sub(lines);
        self.follow_output = false;
    }

    pub fn scroll_down(&mut self, lines: u16) {
        let max = self.max_scroll();
        self.query_scroll = self.query_scroll.saturating_add(lines).min(max);
        self.follow_output = self.query_scroll >= max;
    }
}
