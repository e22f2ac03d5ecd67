use crate::clock::DisplayAction;

/// Character display with a switchable backlight.
///
/// Hardware writes are fire-and-forget; backends log bus errors themselves.
pub trait CharDisplay {
    fn clear(&mut self);
    fn write(&mut self, text: &str, row: u8, col: u8);
    fn backlight(&mut self, on: bool);
    fn backlight_state(&self) -> bool;
}

pub fn apply_actions<D: CharDisplay + ?Sized>(display: &mut D, actions: &[DisplayAction]) {
    for action in actions {
        match action {
            DisplayAction::Clear => display.clear(),
            DisplayAction::Write { text, row, col } => display.write(text, *row, *col),
            DisplayAction::Backlight(on) => display.backlight(*on),
        }
    }
}

/// In-memory character grid. Text past the last column or row is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextGrid {
    cols: usize,
    cells: Vec<Vec<char>>,
    backlight: bool,
}

impl TextGrid {
    pub fn new(rows: u8, cols: u8) -> Self {
        Self {
            cols: usize::from(cols),
            cells: vec![vec![' '; usize::from(cols)]; usize::from(rows)],
            backlight: false,
        }
    }

    pub fn row(&self, row: u8) -> Option<String> {
        self.cells
            .get(usize::from(row))
            .map(|cells| cells.iter().collect::<String>().trim_end().to_string())
    }

    pub fn lines(&self) -> Vec<String> {
        (0..self.cells.len())
            .filter_map(|row| u8::try_from(row).ok())
            .filter_map(|row| self.row(row))
            .collect()
    }
}

impl CharDisplay for TextGrid {
    fn clear(&mut self) {
        for row in &mut self.cells {
            row.fill(' ');
        }
    }

    fn write(&mut self, text: &str, row: u8, col: u8) {
        let Some(cells) = self.cells.get_mut(usize::from(row)) else {
            return;
        };
        for (cell, ch) in cells
            .iter_mut()
            .skip(usize::from(col))
            .take(self.cols)
            .zip(text.chars())
        {
            *cell = ch;
        }
    }

    fn backlight(&mut self, on: bool) {
        self.backlight = on;
    }

    fn backlight_state(&self) -> bool {
        self.backlight
    }
}
