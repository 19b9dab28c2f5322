use std::sync::Mutex;
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};

use replift_engine::ProgressSink;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

/// Renders engine progress on the terminal. Rich mode drives one
/// 0..=100 progress bar for the whole run; plain mode prints a line per
/// stage change and stays silent otherwise.
pub struct TerminalSink {
    style: OutputStyle,
    state: Mutex<SinkState>,
}

struct SinkState {
    bar: Option<ProgressBar>,
    last_message: String,
}

impl TerminalSink {
    pub fn new(style: OutputStyle) -> Self {
        let bar = match style {
            OutputStyle::Plain => None,
            OutputStyle::Rich => {
                let bar = ProgressBar::new(100);
                if let Ok(template) = ProgressStyle::with_template(
                    "{spinner:.cyan.bold} [{bar:24.cyan/blue}] {pos:>3}% {msg}",
                ) {
                    bar.set_style(template.progress_chars("=>-"));
                }
                bar.enable_steady_tick(Duration::from_millis(80));
                Some(bar)
            }
        };
        Self {
            style,
            state: Mutex::new(SinkState {
                bar,
                last_message: String::new(),
            }),
        }
    }

    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(bar) = state.bar.take() {
            bar.finish_and_clear();
        }
    }

    pub fn print_status(&self, status: &str, message: &str) {
        match self.style {
            OutputStyle::Plain => println!("{status}: {message}"),
            OutputStyle::Rich => {
                println!("{} {message}", colorize(status_style(), status));
            }
        }
    }
}

impl ProgressSink for TerminalSink {
    fn report(&self, percent: i32, message: &str) {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());

        match &state.bar {
            Some(bar) => {
                if percent >= 0 {
                    bar.set_position(percent.min(100) as u64);
                }
                bar.set_message(message.to_string());
            }
            None => {
                // plain mode reports stage transitions only
                if state.last_message != message {
                    println!("{message}");
                }
            }
        }
        if state.last_message != message {
            state.last_message = message.to_string();
        }
    }
}

fn status_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightGreen.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}
