use std::borrow::Cow;
use std::fmt::Write as _;

/// Cells wider than this are cut and marked with an ellipsis.
pub const MAX_CELL_WIDTH: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub title: &'static str,
    pub align: Align,
}

impl Column {
    pub const fn left(title: &'static str) -> Self {
        Self {
            title,
            align: Align::Left,
        }
    }

    pub const fn right(title: &'static str) -> Self {
        Self {
            title,
            align: Align::Right,
        }
    }
}

pub fn render_table(columns: &[Column], rows: &[Vec<String>]) -> String {
    let cells: Vec<Vec<Cow<'_, str>>> = rows
        .iter()
        .map(|row| row.iter().take(columns.len()).map(|cell| fit_cell(cell)).collect())
        .collect();

    let mut widths = columns
        .iter()
        .map(|column| display_width(column.title))
        .collect::<Vec<_>>();
    for row in &cells {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(display_width(cell));
        }
    }
    for width in &mut widths {
        *width = (*width).max(3);
    }

    let mut output = String::new();
    let titles = columns.iter().map(|c| Cow::Borrowed(c.title)).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&titles, columns, &widths));
    let rule = widths
        .iter()
        .map(|w| Cow::Owned("-".repeat(*w)))
        .collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&rule, columns, &widths));
    for row in &cells {
        let _ = writeln!(output, "{}", format_row(row, columns, &widths));
    }
    output
}

pub fn print_table(columns: &[Column], rows: &[Vec<String>]) {
    print!("{}", render_table(columns, rows));
}

fn format_row(values: &[Cow<'_, str>], columns: &[Column], widths: &[usize]) -> String {
    let mut line = String::new();
    for (idx, width) in widths.iter().enumerate() {
        let value = values.get(idx).map(|v| v.as_ref()).unwrap_or_default();
        let padding = " ".repeat(width.saturating_sub(display_width(value)));
        if idx > 0 {
            line.push_str("  ");
        }
        match columns[idx].align {
            Align::Left => {
                line.push_str(value);
                line.push_str(&padding);
            }
            Align::Right => {
                line.push_str(&padding);
                line.push_str(value);
            }
        }
    }
    line.truncate(line.trim_end().len());
    line
}

fn display_width(value: &str) -> usize {
    value.chars().count()
}

/// Flattens line breaks and cuts overly long values.
fn fit_cell(value: &str) -> Cow<'_, str> {
    let flattened = if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(
            value
                .chars()
                .map(|ch| if matches!(ch, '\n' | '\r' | '\t') { ' ' } else { ch })
                .collect(),
        )
    } else {
        Cow::Borrowed(value)
    };
    if display_width(&flattened) <= MAX_CELL_WIDTH {
        return flattened;
    }
    let mut cut: String = flattened.chars().take(MAX_CELL_WIDTH - 1).collect();
    cut.push('…');
    Cow::Owned(cut)
}
