use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

/// Rich output only on a terminal, and never when `NO_COLOR` is set.
pub fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    if std::io::stdout().is_terminal() && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

#[derive(Copy, Clone, Debug)]
pub struct TerminalRenderer {
    style: OutputStyle,
}

impl TerminalRenderer {
    pub fn current() -> Self {
        Self {
            style: current_output_style(),
        }
    }

    pub fn style(self) -> OutputStyle {
        self.style
    }

    pub fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    /// A blank line and a bold heading before a phase; nothing when plain.
    pub fn print_section(self, title: &str) {
        if self.style == OutputStyle::Rich {
            println!();
            println!("{}", paint(heading_style(), &format!("== {title} ==")));
        }
    }

    /// Counts packages as they are put in place. Plain output shows no bar.
    pub fn start_progress(self, phase: &str, packages: u64) -> PhaseProgress {
        let bar = (self.style == OutputStyle::Rich).then(|| {
            let bar = ProgressBar::new(packages.max(1));
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan} {msg:<8} [{bar:24.cyan/blue}] {pos}/{len} packages",
            ) {
                bar.set_style(style.progress_chars("=> "));
            }
            bar.set_message(phase.to_string());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        PhaseProgress {
            style: self.style,
            phase: phase.to_string(),
            packages,
            done: 0,
            bar,
            started_at: Instant::now(),
        }
    }
}

pub struct PhaseProgress {
    style: OutputStyle,
    phase: String,
    packages: u64,
    done: u64,
    bar: Option<ProgressBar>,
    started_at: Instant,
}

impl PhaseProgress {
    pub fn set(&mut self, done: u64) {
        self.done = done.min(self.packages);
        if let Some(bar) = &self.bar {
            bar.set_position(self.done);
        }
    }

    pub fn finish_success(mut self) {
        let Some(bar) = self.bar.take() else {
            return;
        };
        bar.finish_and_clear();
        let elapsed = self.started_at.elapsed();
        println!(
            "{}",
            render_status_line(
                self.style,
                "ok",
                &format!(
                    "{} finished: {}/{} packages in {}.{:03}s",
                    self.phase,
                    self.done,
                    self.packages,
                    elapsed.as_secs(),
                    elapsed.subsec_millis()
                ),
            )
        );
    }

    pub fn finish_abandon(mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

/// `[OK] message` and friends when rich; the bare message when plain.
pub fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let badge = match status {
                "ok" => "[OK]",
                "warn" => "[WARN]",
                "err" => "[ERR]",
                _ => "[..]",
            };
            format!("{badge} {message}")
        }
    }
}

fn heading_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn paint(style: Style, text: &str) -> String {
    format!("{}{text}{}", style.render(), style.render_reset())
}
