//! The 3×3 game grid.
//!
//! Pure state, no locking: the peer core serializes all access through its
//! session lock. `check()` scans rows and columns first, then the diagonals
//! (only when the center cell is occupied), then falls through to the
//! draw/ongoing decision.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A player mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symbol {
    X,
    O,
}

impl Symbol {
    /// The other player's mark.
    pub fn flip(self) -> Self {
        match self {
            Symbol::X => Symbol::O,
            Symbol::O => Symbol::X,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Symbol::X => "X",
            Symbol::O => "O",
        })
    }
}

/// State of a game after a move: a winner, a draw, or still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Win(Symbol),
    Draw,
    Ongoing,
}

impl Outcome {
    /// True when the game is over.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Ongoing)
    }
}

/// The 3×3 grid.
#[derive(Debug, Clone, Default)]
pub struct Board {
    cells: [[Option<Symbol>; 3]; 3],
}

impl Board {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty every cell.
    pub fn reset(&mut self) {
        self.cells = Default::default();
    }

    /// True when the coordinates are on the grid and the cell is free.
    pub fn is_valid(&self, row: i32, col: i32) -> bool {
        (0..3).contains(&row)
            && (0..3).contains(&col)
            && self.cells[row as usize][col as usize].is_none()
    }

    /// Place a mark. Callers check [`Board::is_valid`] first.
    pub fn apply(&mut self, row: i32, col: i32, symbol: Symbol) {
        debug_assert!(self.is_valid(row, col));
        self.cells[row as usize][col as usize] = Some(symbol);
    }

    /// Scan for a winner, a draw, or an unfinished game.
    pub fn check(&self) -> Outcome {
        let c = &self.cells;

        for i in 0..3 {
            if let Some(s) = c[i][0] {
                if c[i][1] == Some(s) && c[i][2] == Some(s) {
                    return Outcome::Win(s);
                }
            }
            if let Some(s) = c[0][i] {
                if c[1][i] == Some(s) && c[2][i] == Some(s) {
                    return Outcome::Win(s);
                }
            }
        }

        // Diagonals share the center: nothing to scan while it is empty.
        if let Some(center) = c[1][1] {
            let main = c[0][0] == Some(center) && c[2][2] == Some(center);
            let anti = c[0][2] == Some(center) && c[2][0] == Some(center);
            if main || anti {
                return Outcome::Win(center);
            }
        }

        if c.iter().flatten().all(|cell| cell.is_some()) {
            Outcome::Draw
        } else {
            Outcome::Ongoing
        }
    }

    /// Textual grid: cells joined by `|`, rows separated by a dash line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (r, row) in self.cells.iter().enumerate() {
            for (i, cell) in row.iter().enumerate() {
                if i > 0 {
                    out.push('|');
                }
                out.push(match cell {
                    Some(Symbol::X) => 'X',
                    Some(Symbol::O) => 'O',
                    None => ' ',
                });
            }
            if r < 2 {
                out.push('\n');
                out.push_str("-----");
                out.push('\n');
            }
        }
        out
    }
}
