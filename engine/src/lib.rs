//! Core Othello rules engine: board state, flip resolution, move history.
//! Shared by every search agent; agents drive it through apply/undo.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BOARD_SIZE: u8 = 8;
pub const FILES: &str = "abcdefgh";

/// (row, col), zero-based, row 0 at the top.
pub type Coord = (u8, u8);

const DIRECTIONS: [(i8, i8); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Dark,
    Light,
}

impl Color {
    pub fn opponent(self) -> Color {
        match self {
            Color::Dark => Color::Light,
            Color::Light => Color::Dark,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid coordinate token: {0}")]
    InvalidCoord(String),
    #[error("out of bounds coordinate: {0}")]
    OutOfBounds(String),
    #[error("illegal move: no discs flipped")]
    IllegalMove,
    #[error("no moves to undo")]
    EmptyHistory,
}

/// One applied move: the placed cell (`None` for a pass) and the discs it
/// flipped. Exactly the delta needed to reverse the move.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HistoryEntry {
    mv: Option<Coord>,
    flips: Vec<Coord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    grid: [[Option<Color>; BOARD_SIZE as usize]; BOARD_SIZE as usize],
    to_move: Color,
    history: Vec<HistoryEntry>,
}

impl Default for Board {
    fn default() -> Self {
        Self::new()
    }
}

impl Board {
    /// Canonical starting position: center four cells occupied, Dark to move.
    pub fn new() -> Self {
        let mut grid = [[None; BOARD_SIZE as usize]; BOARD_SIZE as usize];
        let mid = BOARD_SIZE as usize / 2;
        grid[mid - 1][mid - 1] = Some(Color::Light);
        grid[mid][mid] = Some(Color::Light);
        grid[mid - 1][mid] = Some(Color::Dark);
        grid[mid][mid - 1] = Some(Color::Dark);
        Self {
            grid,
            to_move: Color::Dark,
            history: Vec::new(),
        }
    }

    pub fn to_move(&self) -> Color {
        self.to_move
    }

    pub fn get(&self, coord: Coord) -> Option<Color> {
        self.grid[coord.0 as usize][coord.1 as usize]
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Legal moves for `side` in row-major order. Callers rely on the order
    /// for deterministic first-legal-move fallbacks.
    pub fn legal_moves(&self, side: Color) -> Vec<Coord> {
        let mut moves = Vec::new();
        for r in 0..BOARD_SIZE {
            for c in 0..BOARD_SIZE {
                if self.grid[r as usize][c as usize].is_some() {
                    continue;
                }
                if !flips_for(&self.grid, (r, c), side).is_empty() {
                    moves.push((r, c));
                }
            }
        }
        moves
    }

    pub fn has_legal_move(&self, side: Color) -> bool {
        for r in 0..BOARD_SIZE {
            for c in 0..BOARD_SIZE {
                if self.grid[r as usize][c as usize].is_none()
                    && !flips_for(&self.grid, (r, c), side).is_empty()
                {
                    return true;
                }
            }
        }
        false
    }

    /// Applies a move (or a pass when `mv` is `None`) for `side`. Flips are
    /// recomputed here; a placement that captures nothing is rejected.
    pub fn apply_move(&mut self, mv: Option<Coord>, side: Color) -> Result<(), EngineError> {
        let Some(coord) = mv else {
            self.history.push(HistoryEntry {
                mv: None,
                flips: Vec::new(),
            });
            self.to_move = side.opponent();
            return Ok(());
        };
        let flips = flips_for(&self.grid, coord, side);
        if flips.is_empty() {
            return Err(EngineError::IllegalMove);
        }
        self.grid[coord.0 as usize][coord.1 as usize] = Some(side);
        for &(fr, fc) in &flips {
            self.grid[fr as usize][fc as usize] = Some(side);
        }
        self.history.push(HistoryEntry {
            mv: Some(coord),
            flips,
        });
        self.to_move = side.opponent();
        Ok(())
    }

    /// Reverses the most recent move, restoring grid and side to move.
    pub fn undo(&mut self) -> Result<(), EngineError> {
        let entry = self.history.pop().ok_or(EngineError::EmptyHistory)?;
        self.to_move = self.to_move.opponent();
        let Some((r, c)) = entry.mv else {
            return Ok(());
        };
        self.grid[r as usize][c as usize] = None;
        // Flipped discs belonged to the restored mover's opponent.
        let restored = self.to_move.opponent();
        for (fr, fc) in entry.flips {
            self.grid[fr as usize][fc as usize] = Some(restored);
        }
        Ok(())
    }

    /// Terminal iff neither side has a legal move; one stuck side only passes.
    pub fn is_terminal(&self) -> bool {
        !self.has_legal_move(Color::Dark) && !self.has_legal_move(Color::Light)
    }

    /// Disc counts as (dark, light).
    pub fn score(&self) -> (u32, u32) {
        let mut dark = 0;
        let mut light = 0;
        for row in &self.grid {
            for cell in row {
                match cell {
                    Some(Color::Dark) => dark += 1,
                    Some(Color::Light) => light += 1,
                    None => {}
                }
            }
        }
        (dark, light)
    }

    /// Higher disc count wins; `None` is a draw.
    pub fn winner(&self) -> Option<Color> {
        let (dark, light) = self.score();
        if dark > light {
            Some(Color::Dark)
        } else if light > dark {
            Some(Color::Light)
        } else {
            None
        }
    }
}

pub fn coord_in_bounds(coord: Coord) -> bool {
    coord.0 < BOARD_SIZE && coord.1 < BOARD_SIZE
}

/// Every opponent disc flipped by `side` placing at `coord`: rays in all
/// eight directions, contiguous opponent runs terminated by an own disc.
pub fn flips_for(
    grid: &[[Option<Color>; BOARD_SIZE as usize]; BOARD_SIZE as usize],
    coord: Coord,
    side: Color,
) -> Vec<Coord> {
    if grid[coord.0 as usize][coord.1 as usize].is_some() {
        return Vec::new();
    }
    let opponent = side.opponent();
    let mut flips = Vec::new();
    for (dr, dc) in DIRECTIONS {
        let mut rr = coord.0 as i8 + dr;
        let mut cc = coord.1 as i8 + dc;
        let mut line = Vec::new();
        while rr >= 0
            && cc >= 0
            && rr < BOARD_SIZE as i8
            && cc < BOARD_SIZE as i8
            && grid[rr as usize][cc as usize] == Some(opponent)
        {
            line.push((rr as u8, cc as u8));
            rr += dr;
            cc += dc;
        }
        if !line.is_empty()
            && rr >= 0
            && cc >= 0
            && rr < BOARD_SIZE as i8
            && cc < BOARD_SIZE as i8
            && grid[rr as usize][cc as usize] == Some(side)
        {
            flips.extend(line);
        }
    }
    flips
}

pub fn coord_to_notation(coord: Coord) -> Result<String, EngineError> {
    if !coord_in_bounds(coord) {
        return Err(EngineError::OutOfBounds(format!(
            "({}, {})",
            coord.0, coord.1
        )));
    }
    let (row, col) = coord;
    let file_char = FILES.as_bytes()[col as usize] as char;
    Ok(format!("{file_char}{}", row + 1))
}

pub fn notation_to_coord(token: &str) -> Result<Coord, EngineError> {
    if token.len() < 2 {
        return Err(EngineError::InvalidCoord(token.to_string()));
    }
    let (file_part, rank_part) = token.split_at(1);
    let file_char = file_part
        .chars()
        .next()
        .ok_or_else(|| EngineError::InvalidCoord(token.to_string()))?
        .to_ascii_lowercase();
    let col = FILES
        .chars()
        .position(|c| c == file_char)
        .ok_or_else(|| EngineError::InvalidCoord(token.to_string()))?;
    let rank: i32 = rank_part
        .parse()
        .map_err(|_| EngineError::InvalidCoord(token.to_string()))?;
    // Range-check before the narrowing cast; "a257" must not wrap to a1.
    if rank < 1 || rank > BOARD_SIZE as i32 {
        return Err(EngineError::OutOfBounds(token.to_string()));
    }
    Ok(((rank - 1) as u8, col as u8))
}

// --- Serialization ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedBoard {
    pub to_move: Color,
    pub rows: Vec<String>,
}

pub fn serialize_board(board: &Board) -> SerializedBoard {
    let mut rows = Vec::with_capacity(BOARD_SIZE as usize);
    for r in 0..BOARD_SIZE {
        let row: String = (0..BOARD_SIZE)
            .map(|c| match board.get((r, c)) {
                Some(Color::Dark) => 'D',
                Some(Color::Light) => 'L',
                None => '.',
            })
            .collect();
        rows.push(row);
    }
    SerializedBoard {
        to_move: board.to_move(),
        rows,
    }
}

/// Rebuilds a board from a snapshot. The history is empty: a deserialized
/// position cannot be undone past its snapshot point.
pub fn deserialize_board(payload: &SerializedBoard) -> Result<Board, EngineError> {
    if payload.rows.len() != BOARD_SIZE as usize {
        return Err(EngineError::InvalidCoord(format!(
            "expected {} rows, got {}",
            BOARD_SIZE,
            payload.rows.len()
        )));
    }
    let mut grid = [[None; BOARD_SIZE as usize]; BOARD_SIZE as usize];
    for (r, row) in payload.rows.iter().enumerate() {
        if row.chars().count() != BOARD_SIZE as usize {
            return Err(EngineError::InvalidCoord(format!("bad row: {row}")));
        }
        for (c, ch) in row.chars().enumerate() {
            grid[r][c] = match ch {
                'D' => Some(Color::Dark),
                'L' => Some(Color::Light),
                '.' => None,
                other => return Err(EngineError::InvalidCoord(other.to_string())),
            };
        }
    }
    Ok(Board {
        grid,
        to_move: payload.to_move,
        history: Vec::new(),
    })
}

// --- Tests ---
