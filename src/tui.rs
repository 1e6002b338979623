use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
};
use std::io::stdout;
use std::path::Path;
use std::time::Duration;

use crate::interrupt::{Challenge, FileControl};
use crate::progress::{read_snapshot, Phase, ProgressSnapshot, RunState};

const REFRESH: Duration = Duration::from_millis(500);

struct WatchState {
    snapshot: Option<ProgressSnapshot>,
    challenge: Option<Challenge>,
    message: Option<String>,
}

impl WatchState {
    fn refresh(&mut self, progress_path: &Path, control: &FileControl) {
        self.snapshot = read_snapshot(progress_path);
        self.challenge = control.suspended();
    }
}

/// Live view of a run's progress file. `r` resumes a suspended run, `s`
/// asks it to stop, `q` leaves the view without touching the run.
pub fn watch(progress_path: &Path, control_dir: &Path) -> Result<()> {
    let control = FileControl::new(control_dir);
    let mut state = WatchState {
        snapshot: None,
        challenge: None,
        message: None,
    };
    state.refresh(progress_path, &control);

    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = run_loop(&mut terminal, &mut state, progress_path, &control);

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    state: &mut WatchState,
    progress_path: &Path,
    control: &FileControl,
) -> Result<()> {
    loop {
        terminal.draw(|frame| draw(frame, state))?;

        if event::poll(REFRESH)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => break,
                    KeyCode::Char('r') => {
                        state.message = Some(match control.request_resume() {
                            Ok(()) => "Resume requested".to_string(),
                            Err(e) => format!("Resume failed: {}", e),
                        });
                    }
                    KeyCode::Char('s') => {
                        state.message = Some(match control.request_stop() {
                            Ok(()) => "Stop requested".to_string(),
                            Err(e) => format!("Stop failed: {}", e),
                        });
                    }
                    _ => {}
                }
            }
        }
        state.refresh(progress_path, control);
    }
    Ok(())
}

fn ratio(done: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    }
}

fn draw(frame: &mut Frame, state: &WatchState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(frame.area());

    let Some(snapshot) = &state.snapshot else {
        let waiting = Paragraph::new("No progress yet. Start a run with: jobscout run")
            .block(Block::default().borders(Borders::ALL).title(" jobscout "));
        frame.render_widget(waiting, chunks[0]);
        return;
    };

    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            format!(" {} ", snapshot.site),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(
            "keyword {}/{} '{}'  ",
            snapshot.keyword_index, snapshot.total_keywords, snapshot.keyword
        )),
        Span::styled(snapshot.phase.label(), Style::default().fg(Color::Cyan)),
        Span::raw("  "),
        state_span(snapshot.state),
    ]))
    .block(Block::default().borders(Borders::ALL).title(" Run "));
    frame.render_widget(header, chunks[0]);

    let summary = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Summary scan "))
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio(snapshot.processed_count, snapshot.total_listings))
        .label(format!("{}/{}", snapshot.processed_count, snapshot.total_listings));
    frame.render_widget(summary, chunks[1]);

    let deep_style = if snapshot.phase == Phase::DeepScan {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    let deep = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Deep scan "))
        .gauge_style(deep_style)
        .ratio(ratio(snapshot.deep_scanned, snapshot.total_deep))
        .label(format!("{}/{}", snapshot.deep_scanned, snapshot.total_deep));
    frame.render_widget(deep, chunks[2]);

    let detail = Paragraph::new(build_detail(state, snapshot))
        .block(Block::default().borders(Borders::ALL).title(" Detail "))
        .wrap(Wrap { trim: false });
    frame.render_widget(detail, chunks[3]);

    let help = Paragraph::new(" r:resume after verification  s:stop run  q:quit")
        .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(help, chunks[4]);
}

fn state_span(state: RunState) -> Span<'static> {
    match state {
        RunState::Running => Span::styled("running", Style::default().fg(Color::Green)),
        RunState::Suspended => Span::styled(
            "SUSPENDED",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ),
        RunState::Finished => Span::styled("finished", Style::default().fg(Color::DarkGray)),
    }
}

fn build_detail<'a>(state: &'a WatchState, snapshot: &'a ProgressSnapshot) -> Text<'a> {
    let mut lines: Vec<Line> = Vec::new();

    lines.push(Line::from(vec![
        Span::styled("Highly suitable ", Style::default().add_modifier(Modifier::BOLD)),
        Span::styled(
            snapshot.highly_suitable.to_string(),
            Style::default().fg(Color::Green),
        ),
        Span::raw(format!(
            "   Suitable {}   Not suitable {}",
            snapshot.suitable, snapshot.not_suitable
        )),
    ]));
    lines.push(Line::from(format!(
        "Already known: {}",
        snapshot.skipped_existing
    )));
    lines.push(Line::from(Span::styled(
        format!("Updated {}", snapshot.updated_at),
        Style::default().fg(Color::DarkGray),
    )));
    lines.push(Line::from(""));

    if let Some(challenge) = &state.challenge {
        lines.push(Line::from(Span::styled(
            "Verification required",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )));
        for line in textwrap::fill(&challenge.url, 70).lines() {
            lines.push(Line::from(format!("  {}", line)));
        }
        lines.push(Line::from(format!("  since {}", challenge.detected_at)));
        lines.push(Line::from(
            "  Solve it in the browser window, then press r.",
        ));
        lines.push(Line::from(""));
    }

    if let Some(message) = &state.message {
        lines.push(Line::from(Span::styled(
            message.as_str(),
            Style::default().fg(Color::Yellow),
        )));
    }

    Text::from(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_handles_unknown_totals() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(60, 200), 0.3);
        assert_eq!(ratio(25, 20), 1.0);
    }

    #[test]
    fn test_detail_shows_challenge() {
        let snapshot = ProgressSnapshot {
            highly_suitable: 3,
            ..Default::default()
        };
        let state = WatchState {
            snapshot: None,
            challenge: Some(Challenge {
                url: "https://www.example.com/check".to_string(),
                detected_at: "2026-01-01T00:00:00Z".to_string(),
            }),
            message: None,
        };
        let text = build_detail(&state, &snapshot);
        let rendered: Vec<String> = text.lines.iter().map(|l| l.to_string()).collect();
        assert!(rendered.iter().any(|l| l.contains("Verification required")));
        assert!(rendered.iter().any(|l| l.contains("https://www.example.com/check")));
        assert!(rendered[0].contains("3"));
    }
}
