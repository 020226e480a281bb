use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use crossterm::{
    cursor, execute,
    style::{Print, Stylize},
    terminal::{self, ClearType},
};
use tokio_util::sync::CancellationToken;

use crate::manager::{ProgressSummary, TasksManager};

pub const REDRAW_INTERVAL: Duration = Duration::from_millis(250);

const DEFAULT_COLUMNS: u16 = 80;

/// Renders `summary` as a coloured bar `width` cells wide, followed by the
/// done percentage. Done tasks are green, tasks in progress yellow.
pub fn render_bar(summary: &ProgressSummary, width: usize) -> String {
    let (done_cells, working_cells) = if summary.total == 0 {
        (width, 0)
    } else {
        let done = summary.done * width / summary.total;
        let working = (summary.in_progress * width).div_ceil(summary.total);
        (done, working.min(width - done))
    };
    let spaces = width - done_cells - working_cells;
    let percentage = if summary.is_finished() {
        100.0
    } else {
        summary.done_ratio() * 100.0
    };

    format!(
        "{}{}{}{}{} {percentage:6.2} %",
        "[".bold(),
        "|".repeat(done_cells).green(),
        "|".repeat(working_cells).yellow(),
        " ".repeat(spaces),
        "]".bold(),
    )
}

/// Half the terminal width, or half of 80 columns when the size is unknown.
fn bar_width(size: io::Result<(u16, u16)>) -> usize {
    let columns = size.map(|(columns, _)| columns).unwrap_or(DEFAULT_COLUMNS);
    usize::from(columns) / 2
}

fn draw(out: &mut impl Write, summary: &ProgressSummary, width: usize) {
    let _ = execute!(
        out,
        cursor::MoveToColumn(0),
        terminal::Clear(ClearType::CurrentLine),
        Print(render_bar(summary, width)),
    );
}

/// Redraws the progress bar on stderr every `interval` until all tasks are
/// done or `stop` is cancelled, then draws the last state and ends the line.
///
/// Only reads status snapshots from the manager.
pub async fn observe(manager: Arc<TasksManager>, interval: Duration, stop: CancellationToken) {
    let width = bar_width(terminal::size());
    let mut ticker = tokio::time::interval(interval);
    let mut stderr = io::stderr();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = manager.wait_all_done() => break,
            _ = ticker.tick() => draw(&mut stderr, &manager.progress(), width),
        }
    }

    draw(&mut stderr, &manager.progress(), width);
    let _ = writeln!(stderr);
}
