//! Interactive answers for batch validation, drawn with ratatui.

use std::io::{self, IsTerminal, Stdout};
use std::time::Duration;

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use tracing::{error, warn};

use crate::batch::{
    Duplicate, DuplicateChoice, DuplicateDecision, NotFoundDecision, OnDuplicate,
    PolicyDecisions, Unresolved, UnresolvedDecision, ValidationDecisions,
};

const POLL: Duration = Duration::from_millis(100);

/// Raw mode and the alternate screen, restored on drop.
struct Screen {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl Screen {
    fn open() -> miette::Result<Self> {
        enable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout)).into_diagnostic()?;
        Ok(Self { terminal })
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().execute(LeaveAlternateScreen);
    }
}

/// Single choice among `options`. `None` when the user presses Esc.
pub fn select(
    title: &str,
    context: &[String],
    options: &[&str],
) -> miette::Result<Option<usize>> {
    let mut screen = Screen::open()?;
    let mut cursor = 0usize;
    loop {
        screen
            .terminal
            .draw(|frame| {
                let chunks = Layout::default()
                    .direction(Direction::Vertical)
                    .constraints([
                        Constraint::Min(3),
                        Constraint::Length(options.len() as u16 + 2),
                    ])
                    .split(frame.area());
                let lines = context
                    .iter()
                    .map(|line| Line::from(line.clone()))
                    .collect::<Vec<_>>();
                let context = Paragraph::new(lines)
                    .wrap(Wrap { trim: false })
                    .block(Block::default().borders(Borders::ALL).title(title.to_string()));
                frame.render_widget(context, chunks[0]);

                let lines = options
                    .iter()
                    .enumerate()
                    .map(|(index, option)| option_line(index == cursor, option.to_string()))
                    .collect::<Vec<_>>();
                let menu = Paragraph::new(lines).block(
                    Block::default()
                        .borders(Borders::ALL)
                        .title("Up/Down to move, Enter to choose, Esc to cancel"),
                );
                frame.render_widget(menu, chunks[1]);
            })
            .into_diagnostic()?;

        if event::poll(POLL).into_diagnostic()? {
            if let Event::Key(key) = event::read().into_diagnostic()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Up | KeyCode::Char('k') => cursor = cursor.saturating_sub(1),
                    KeyCode::Down | KeyCode::Char('j') => {
                        cursor = (cursor + 1).min(options.len().saturating_sub(1))
                    }
                    KeyCode::Enter => return Ok(Some(cursor)),
                    KeyCode::Esc | KeyCode::Char('q') => return Ok(None),
                    _ => {}
                }
            }
        }
    }
}

/// Multi-select over `items`; `None` when the user presses Esc.
pub fn checklist(title: &str, items: &[String]) -> miette::Result<Option<Vec<bool>>> {
    let mut screen = Screen::open()?;
    let mut checked = vec![false; items.len()];
    let mut cursor = 0usize;
    loop {
        screen
            .terminal
            .draw(|frame| {
                let lines = items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        let mark = if checked[index] { "[x]" } else { "[ ]" };
                        option_line(index == cursor, format!("{mark} {item}"))
                    })
                    .collect::<Vec<_>>();
                let list = Paragraph::new(lines).block(
                    Block::default()
                        .borders(Borders::ALL)
                        .title(format!("{title} (Space to toggle, Enter to confirm)")),
                );
                frame.render_widget(list, frame.area());
            })
            .into_diagnostic()?;

        if event::poll(POLL).into_diagnostic()? {
            if let Event::Key(key) = event::read().into_diagnostic()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Up | KeyCode::Char('k') => cursor = cursor.saturating_sub(1),
                    KeyCode::Down | KeyCode::Char('j') => {
                        cursor = (cursor + 1).min(items.len().saturating_sub(1))
                    }
                    KeyCode::Char(' ') => {
                        if let Some(mark) = checked.get_mut(cursor) {
                            *mark = !*mark;
                        }
                    }
                    KeyCode::Char('a') => {
                        let all = checked.iter().all(|mark| *mark);
                        checked.iter_mut().for_each(|mark| *mark = !all);
                    }
                    KeyCode::Enter => return Ok(Some(checked)),
                    KeyCode::Esc | KeyCode::Char('q') => return Ok(None),
                    _ => {}
                }
            }
        }
    }
}

fn option_line(selected: bool, text: String) -> Line<'static> {
    if selected {
        Line::from(vec![
            Span::styled("> ", Style::default().fg(Color::Cyan)),
            Span::styled(
                text,
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ),
        ])
    } else {
        Line::from(vec![Span::raw("  "), Span::raw(text)])
    }
}

/// True when both stdin and stdout are attached to a terminal.
pub fn terminal_available() -> bool {
    io::stdin().is_terminal() && io::stdout().is_terminal()
}

/// Picks who answers batch validation questions. `ask` only opens the
/// terminal prompt when `interactive`; otherwise the fixed policy answers and
/// duplicates are skipped.
pub fn validation_decisions(
    policy: PolicyDecisions,
    interactive: bool,
) -> Box<dyn ValidationDecisions> {
    match policy.on_duplicate {
        OnDuplicate::Ask if interactive => Box::new(TerminalPrompt),
        OnDuplicate::Ask => {
            warn!("--on-duplicate ask needs an interactive terminal, skipping duplicates instead");
            Box::new(policy)
        }
        _ => Box::new(policy),
    }
}

/// Asks the user at every validation step. Terminal failures and Esc
/// abort the batch.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    fn ask(&self, title: &str, context: Vec<String>, options: &[&str]) -> Option<usize> {
        match select(title, &context, options) {
            Ok(choice) => choice,
            Err(err) => {
                error!("terminal prompt failed: {err:?}");
                None
            }
        }
    }
}

impl ValidationDecisions for TerminalPrompt {
    fn unresolved(&mut self, failures: &[Unresolved]) -> UnresolvedDecision {
        let context = failures
            .iter()
            .map(|failure| format!("• {}: {}", failure.identifier, failure.reason))
            .collect();
        match self.ask(
            &format!("No SMILES for {} molecules", failures.len()),
            context,
            &["Continue without them", "Cancel batch"],
        ) {
            Some(0) => UnresolvedDecision::Drop,
            _ => UnresolvedDecision::Abort,
        }
    }

    fn duplicates(&mut self, duplicates: &[Duplicate]) -> DuplicateDecision {
        let context = duplicates
            .iter()
            .map(|duplicate| format!("• {} ({})", duplicate.identifier, duplicate.key))
            .collect();
        match self.ask(
            &format!("{} molecules are already in the store", duplicates.len()),
            context,
            &[
                "Overwrite all (recalculate)",
                "Skip all",
                "Choose individually",
                "Cancel batch",
            ],
        ) {
            Some(0) => DuplicateDecision::OverwriteAll,
            Some(1) => DuplicateDecision::SkipAll,
            Some(2) => DuplicateDecision::PerIdentifier,
            _ => DuplicateDecision::Abort,
        }
    }

    fn choose_individually(&mut self, duplicates: &[Duplicate]) -> Vec<DuplicateChoice> {
        let items = duplicates
            .iter()
            .map(|duplicate| duplicate.identifier.clone())
            .collect::<Vec<_>>();
        let checked = match checklist("Select molecules to recalculate", &items) {
            Ok(Some(checked)) => checked,
            Ok(None) => vec![false; duplicates.len()],
            Err(err) => {
                error!("terminal prompt failed: {err:?}");
                vec![false; duplicates.len()]
            }
        };
        checked
            .into_iter()
            .map(|mark| {
                if mark {
                    DuplicateChoice::Overwrite
                } else {
                    DuplicateChoice::Skip
                }
            })
            .collect()
    }

    fn not_found(&mut self, missing: &[String]) -> NotFoundDecision {
        let context = missing.iter().map(|name| format!("• {name}")).collect();
        match self.ask(
            &format!("{} molecules not found in PubChem", missing.len()),
            context,
            &["Continue (record them in not-found.txt)", "Cancel batch"],
        ) {
            Some(0) => NotFoundDecision::RecordAndDrop,
            _ => NotFoundDecision::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{OnNotFound, OnUnresolved};

    fn duplicate() -> Vec<Duplicate> {
        vec![Duplicate {
            identifier: "ethanol".to_string(),
            key: "CCO".to_string(),
        }]
    }

    #[test]
    fn ask_without_terminal_skips_duplicates() {
        let policy = PolicyDecisions {
            on_duplicate: OnDuplicate::Ask,
            on_unresolved: OnUnresolved::Drop,
            on_not_found: OnNotFound::Record,
        };
        let mut decisions = validation_decisions(policy, false);
        assert_eq!(decisions.duplicates(&duplicate()), DuplicateDecision::SkipAll);
        assert_eq!(decisions.unresolved(&[]), UnresolvedDecision::Drop);
        assert_eq!(
            decisions.not_found(&["unobtainium".to_string()]),
            NotFoundDecision::RecordAndDrop
        );
    }

    #[test]
    fn fixed_policies_ignore_the_terminal() {
        let policy = PolicyDecisions {
            on_duplicate: OnDuplicate::Overwrite,
            ..PolicyDecisions::default()
        };
        let mut decisions = validation_decisions(policy, true);
        assert_eq!(
            decisions.duplicates(&duplicate()),
            DuplicateDecision::OverwriteAll
        );
    }
}
