use std::io::IsTerminal;

use nu_ansi_term::{Color, Style};

pub struct Ui {
    paint: bool,
    heading: Style,
    key: Style,
    dim: Style,
}

impl Ui {
    pub fn new(plain: bool) -> Self {
        let paint = !plain && std::io::stdout().is_terminal();

        #[cfg(windows)]
        if paint {
            let _ = nu_ansi_term::enable_ansi_support();
        }

        Self {
            paint,
            heading: Color::Cyan.bold(),
            key: Style::new().fg(Color::Blue),
            dim: Style::new().dimmed(),
        }
    }

    pub fn heading(&self, title: &str, note: &str) {
        if self.paint {
            println!("{} {}", self.heading.paint(title), self.dim.paint(note));
        } else {
            println!("{title} {note}");
        }
    }

    pub fn row(&self, key: &str, value: &str) {
        if self.paint {
            println!("  {} {value}", self.key.paint(format!("{key}:")));
        } else {
            println!("  {key}: {value}");
        }
    }
}
