use std::fmt::Display;
use std::io::IsTerminal;

use nu_ansi_term::{Color, Style};
use strata::tree::{Count, Node};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Theme {
    Auto,
    Light,
    Dark,
    Plain,
}

pub struct Ui {
    palette: Palette,
    paint: bool,
}

impl Ui {
    pub fn new(theme: Theme) -> Self {
        let stdout_is_tty = std::io::stdout().is_terminal();
        let paint = match theme {
            Theme::Plain => false,
            Theme::Auto | Theme::Light | Theme::Dark => stdout_is_tty,
        };

        #[cfg(windows)]
        if paint {
            let _ = nu_ansi_term::enable_ansi_support();
        }

        let palette = match theme {
            Theme::Plain => Palette::plain(),
            Theme::Light => Palette::light(),
            Theme::Dark | Theme::Auto => Palette::dark(),
        };
        Self { palette, paint }
    }

    pub fn section<'a, I, V>(&self, title: &str, rows: I)
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: Display,
    {
        let rows: Vec<(String, String)> = rows
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        if rows.is_empty() {
            return;
        }

        self.heading(title);
        let key_width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in rows {
            println!(
                "  {} {}",
                self.paint(self.palette.key, format!("{key:>key_width$}:")),
                self.paint(self.palette.value, value)
            );
        }
    }

    pub fn warn(&self, message: &str) {
        eprintln!("{} {message}", self.paint(self.palette.warn, WARNING_ICON));
    }

    /// Prints `root` and every materialized descendant, one row per line.
    pub fn tree(&self, title: &str, root: &Node, columns: &[String]) {
        self.heading(title);
        let mut lines = Vec::new();
        render(root, columns, 1, &mut lines);
        for line in lines {
            let indent = "  ".repeat(line.depth);
            match line.kind {
                LineKind::Row { label, stats, pages } => {
                    let mut out = format!("{indent}{}", self.paint(self.palette.label, label));
                    if !stats.is_empty() {
                        out.push_str("  ");
                        out.push_str(&self.paint(self.palette.value, stats));
                    }
                    if let Some(pages) = pages {
                        out.push_str("  ");
                        out.push_str(&self.paint(self.palette.muted, pages));
                    }
                    println!("{out}");
                }
                LineKind::More(hint) => {
                    println!("{indent}{}", self.paint(self.palette.muted, hint));
                }
            }
        }
    }

    fn heading(&self, title: &str) {
        println!("{}", self.paint(self.palette.heading, format!("{HEADING_ICON} {title}")));
    }

    fn paint(&self, style: Style, text: impl Into<String>) -> String {
        let text = text.into();
        if self.paint {
            style.paint(text).to_string()
        } else {
            text
        }
    }
}

struct Line {
    depth: usize,
    kind: LineKind,
}

enum LineKind {
    Row {
        label: String,
        stats: String,
        pages: Option<String>,
    },
    More(String),
}

fn render(node: &Node, columns: &[String], depth: usize, out: &mut Vec<Line>) {
    let label = match &node.breakdown_id {
        Some(id) => id.to_string(),
        None => "Total".to_string(),
    };
    let stats = columns
        .iter()
        .filter_map(|key| node.stat(key).map(|value| format!("{key}={}", display_value(value))))
        .collect::<Vec<_>>()
        .join(" ");
    let pages = node.pagination().map(|pagination| match pagination.count {
        Count::Known(total) => format!("[{}/{total}]", pagination.limit),
        Count::Unknown => format!("[{}/?]", pagination.limit),
    });
    out.push(Line {
        depth,
        kind: LineKind::Row { label, stats, pages },
    });

    let Some(children) = node.children.as_ref() else {
        return;
    };
    for child in children.iter() {
        render(child, columns, depth + 1, out);
    }
    let pagination = &children.pagination;
    if !pagination.complete {
        let hint = match pagination.count {
            Count::Known(total) => format!("… {} more", total.saturating_sub(pagination.limit)),
            Count::Unknown if node.loading => "… loading".to_string(),
            Count::Unknown => "… more".to_string(),
        };
        out.push(Line {
            depth: depth + 1,
            kind: LineKind::More(hint),
        });
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Number(number) => match number.as_f64() {
            Some(float) if number.is_f64() => format!("{float:.2}"),
            _ => number.to_string(),
        },
        other => other.to_string(),
    }
}

struct Palette {
    heading: Style,
    key: Style,
    label: Style,
    value: Style,
    muted: Style,
    warn: Style,
}

impl Palette {
    fn dark() -> Self {
        Self {
            heading: Style::new().fg(Color::Purple).bold(),
            key: Style::new().fg(Color::LightBlue).bold(),
            label: Style::new().fg(Color::LightCyan).bold(),
            value: Style::new().fg(Color::White),
            muted: Style::new().fg(Color::DarkGray),
            warn: Style::new().fg(Color::Yellow).bold(),
        }
    }

    fn light() -> Self {
        Self {
            heading: Style::new().fg(Color::Blue).bold(),
            key: Style::new().fg(Color::Black).bold(),
            label: Style::new().fg(Color::Blue),
            value: Style::new().fg(Color::Black),
            muted: Style::new().fg(Color::DarkGray),
            warn: Style::new().fg(Color::Red).bold(),
        }
    }

    fn plain() -> Self {
        Self {
            heading: Style::new(),
            key: Style::new(),
            label: Style::new(),
            value: Style::new(),
            muted: Style::new(),
            warn: Style::new(),
        }
    }
}

const HEADING_ICON: &str = "▸";
const WARNING_ICON: &str = "⚠";
