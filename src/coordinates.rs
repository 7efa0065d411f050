//! Board Cell Addressing
//!
//! Pure mapping between logical board cells ("A1", "H8") and physical gantry
//! coordinates in millimetres. Nothing in this module touches hardware, so every
//! function here can be tested exhaustively.
//!
//! # Conventions
//!
//! - Files are letters (`A` = index 0), ranks are 1-based numbers.
//! - Physical coordinates address the *center* of a cell:
//!   `x = origin_x + file * pitch_x + pitch_x / 2`.
//! - The inverse mapping never fails; it clamps to the nearest valid cell.
//!
//! # Example
//!
//! ```
//! use gantry_motion::coordinates::{CoordinateFrame, CoordinateTransformer, PhysicalPosition};
//!
//! let frame = CoordinateFrame::new(400.0, 400.0, 8, 8, PhysicalPosition::ORIGIN).unwrap();
//! let transformer = CoordinateTransformer::new(frame);
//!
//! let a1 = transformer.parse_cell_id("A1").unwrap();
//! assert_eq!(transformer.to_physical(a1), PhysicalPosition::new(25.0, 25.0));
//! ```

use crate::error::{AppResult, GantryError, ValidationError};
use serde::{Deserialize, Serialize};

/// Largest supported file count (one letter per file).
pub const MAX_FILES: u8 = 26;

/// Largest supported rank count.
pub const MAX_RANKS: u8 = 99;

/// Gantry position in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PhysicalPosition {
    /// X coordinate (mm)
    pub x: f64,
    /// Y coordinate (mm)
    pub y: f64,
}

impl PhysicalPosition {
    /// Machine origin.
    pub const ORIGIN: PhysicalPosition = PhysicalPosition { x: 0.0, y: 0.0 };

    /// Create a position from X/Y millimetres.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for PhysicalPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}

/// A validated (file, rank) pair, zero-based.
///
/// Only obtainable through [`CoordinateTransformer::parse_cell_id`],
/// [`CoordinateTransformer::cell`] or [`CoordinateTransformer::to_logical`], so an
/// instance is always inside the frame it was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalCellId {
    file: u8,
    rank: u8,
}

impl LogicalCellId {
    /// Zero-based file index.
    pub fn file_index(&self) -> u8 {
        self.file
    }

    /// Zero-based rank index.
    pub fn rank_index(&self) -> u8 {
        self.rank
    }

    /// Uppercase file letter.
    pub fn file_letter(&self) -> char {
        (b'A' + self.file) as char
    }
}

impl std::fmt::Display for LogicalCellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.file_letter(), u16::from(self.rank) + 1)
    }
}

/// Board geometry. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateFrame {
    width_mm: f64,
    height_mm: f64,
    files: u8,
    ranks: u8,
    origin: PhysicalPosition,
    pitch_x: f64,
    pitch_y: f64,
}

impl CoordinateFrame {
    /// Build a frame and derive the cell pitch.
    ///
    /// # Errors
    /// Returns [`GantryError::Configuration`] for non-positive or non-finite
    /// dimensions, a non-finite origin, or cell counts outside `1..=26` files /
    /// `1..=99` ranks.
    pub fn new(
        width_mm: f64,
        height_mm: f64,
        files: u8,
        ranks: u8,
        origin: PhysicalPosition,
    ) -> AppResult<Self> {
        if !(width_mm.is_finite() && width_mm > 0.0 && height_mm.is_finite() && height_mm > 0.0) {
            return Err(GantryError::Configuration(format!(
                "Board dimensions must be positive, got {}x{} mm",
                width_mm, height_mm
            )));
        }
        if !(1..=MAX_FILES).contains(&files) {
            return Err(GantryError::Configuration(format!(
                "File count must be 1-{}, got {}",
                MAX_FILES, files
            )));
        }
        if !(1..=MAX_RANKS).contains(&ranks) {
            return Err(GantryError::Configuration(format!(
                "Rank count must be 1-{}, got {}",
                MAX_RANKS, ranks
            )));
        }
        if !(origin.x.is_finite() && origin.y.is_finite()) {
            return Err(GantryError::Configuration(format!(
                "Board origin must be finite, got {}",
                origin
            )));
        }

        Ok(Self {
            width_mm,
            height_mm,
            files,
            ranks,
            origin,
            pitch_x: width_mm / f64::from(files),
            pitch_y: height_mm / f64::from(ranks),
        })
    }

    /// Physical board width (mm).
    pub fn width_mm(&self) -> f64 {
        self.width_mm
    }

    /// Physical board height (mm).
    pub fn height_mm(&self) -> f64 {
        self.height_mm
    }

    /// Number of files (X cells).
    pub fn files(&self) -> u8 {
        self.files
    }

    /// Number of ranks (Y cells).
    pub fn ranks(&self) -> u8 {
        self.ranks
    }

    /// Board origin offset.
    pub fn origin(&self) -> PhysicalPosition {
        self.origin
    }

    /// Cell pitch along X (mm).
    pub fn pitch_x(&self) -> f64 {
        self.pitch_x
    }

    /// Cell pitch along Y (mm).
    pub fn pitch_y(&self) -> f64 {
        self.pitch_y
    }
}

/// Maps between [`LogicalCellId`] and [`PhysicalPosition`] for one frame.
#[derive(Debug, Clone)]
pub struct CoordinateTransformer {
    frame: CoordinateFrame,
}

impl CoordinateTransformer {
    /// Create a transformer over `frame`.
    pub fn new(frame: CoordinateFrame) -> Self {
        Self { frame }
    }

    /// The frame this transformer maps into.
    pub fn frame(&self) -> &CoordinateFrame {
        &self.frame
    }

    /// Build a cell from zero-based indices.
    pub fn cell(&self, file: u8, rank: u8) -> Result<LogicalCellId, ValidationError> {
        if file >= self.frame.files || rank >= self.frame.ranks {
            return Err(ValidationError::InvalidCellId {
                input: format!("file {} rank {}", file, rank),
                reason: format!(
                    "indices outside {}x{} board",
                    self.frame.files, self.frame.ranks
                ),
            });
        }
        Ok(LogicalCellId { file, rank })
    }

    /// Parse a cell identifier such as `"e4"` or `"H8"`.
    ///
    /// Letters are case-insensitive. Ranks are plain decimal numbers without sign or
    /// leading zero. Surrounding whitespace is ignored.
    pub fn parse_cell_id(&self, input: &str) -> Result<LogicalCellId, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidCellId {
            input: input.to_string(),
            reason,
        };

        let text = input.trim();
        let max_rank_digits = self.frame.ranks.to_string().len();
        if text.len() < 2 || text.len() > 1 + max_rank_digits {
            return Err(invalid(format!(
                "expected a file letter followed by 1-{} rank digits",
                max_rank_digits
            )));
        }

        let mut chars = text.chars();
        let file_char = chars
            .next()
            .filter(char::is_ascii_alphabetic)
            .ok_or_else(|| invalid("first character must be a file letter".into()))?;
        let file = file_char.to_ascii_uppercase() as u8 - b'A';
        if file >= self.frame.files {
            return Err(invalid(format!(
                "file '{}' outside A-{}",
                file_char,
                (b'A' + self.frame.files - 1) as char
            )));
        }

        let rank_text = chars.as_str();
        if !rank_text.bytes().all(|b| b.is_ascii_digit()) || rank_text.starts_with('0') {
            return Err(invalid(format!("rank '{}' is not a number", rank_text)));
        }
        let rank_number: u16 = rank_text
            .parse()
            .map_err(|_| invalid(format!("rank '{}' is not a number", rank_text)))?;
        if rank_number == 0 || rank_number > u16::from(self.frame.ranks) {
            return Err(invalid(format!(
                "rank {} outside 1-{}",
                rank_number, self.frame.ranks
            )));
        }

        Ok(LogicalCellId {
            file,
            rank: (rank_number - 1) as u8,
        })
    }

    /// Center of `cell` in machine coordinates.
    pub fn to_physical(&self, cell: LogicalCellId) -> PhysicalPosition {
        let frame = &self.frame;
        PhysicalPosition {
            x: frame.origin.x + f64::from(cell.file) * frame.pitch_x + frame.pitch_x / 2.0,
            y: frame.origin.y + f64::from(cell.rank) * frame.pitch_y + frame.pitch_y / 2.0,
        }
    }

    /// Nearest cell to `position`, clamped onto the board.
    ///
    /// Never fails: positions off the board map to the closest edge cell, and
    /// NaN coordinates map to index 0.
    pub fn to_logical(&self, position: PhysicalPosition) -> LogicalCellId {
        let frame = &self.frame;
        LogicalCellId {
            file: clamp_index(position.x, frame.origin.x, frame.pitch_x, frame.files),
            rank: clamp_index(position.y, frame.origin.y, frame.pitch_y, frame.ranks),
        }
    }

    /// Every cell on the board, file-major.
    pub fn cells(&self) -> impl Iterator<Item = LogicalCellId> + '_ {
        (0..self.frame.files)
            .flat_map(move |file| (0..self.frame.ranks).map(move |rank| LogicalCellId { file, rank }))
    }
}

fn clamp_index(coordinate: f64, origin: f64, pitch: f64, count: u8) -> u8 {
    let raw = ((coordinate - origin) / pitch).floor();
    // `as` saturates and maps NaN to 0
    raw.clamp(0.0, f64::from(count - 1)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> CoordinateTransformer {
        let frame = CoordinateFrame::new(400.0, 400.0, 8, 8, PhysicalPosition::ORIGIN).unwrap();
        CoordinateTransformer::new(frame)
    }

    #[test]
    fn test_corner_cells() {
        let t = standard();
        let a1 = t.parse_cell_id("A1").unwrap();
        let h8 = t.parse_cell_id("H8").unwrap();
        assert_eq!(t.to_physical(a1), PhysicalPosition::new(25.0, 25.0));
        assert_eq!(t.to_physical(h8), PhysicalPosition::new(375.0, 375.0));
    }

    #[test]
    fn test_origin_offset_applies() {
        let frame =
            CoordinateFrame::new(400.0, 320.0, 8, 8, PhysicalPosition::new(10.0, -5.0)).unwrap();
        let t = CoordinateTransformer::new(frame);
        let e4 = t.parse_cell_id("e4").unwrap();
        // pitch 50 x 40
        assert_eq!(t.to_physical(e4), PhysicalPosition::new(235.0, 135.0));
    }

    #[test]
    fn test_round_trip_every_cell() {
        let frame =
            CoordinateFrame::new(381.0, 381.0, 10, 10, PhysicalPosition::new(12.5, 3.25)).unwrap();
        let t = CoordinateTransformer::new(frame);
        for cell in t.cells() {
            assert_eq!(t.to_logical(t.to_physical(cell)), cell, "cell {}", cell);
        }
        assert_eq!(t.cells().count(), 100);
    }

    #[test]
    fn test_to_logical_clamps_off_board() {
        let t = standard();
        assert_eq!(t.to_logical(PhysicalPosition::new(-50.0, -1.0)).to_string(), "A1");
        assert_eq!(t.to_logical(PhysicalPosition::new(1e6, 1e6)).to_string(), "H8");
        assert_eq!(t.to_logical(PhysicalPosition::new(f64::NAN, 399.9)).to_string(), "A8");
        // Exactly on a boundary belongs to the upper cell
        assert_eq!(t.to_logical(PhysicalPosition::new(50.0, 0.0)).to_string(), "B1");
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let t = standard();
        assert_eq!(t.parse_cell_id("e4").unwrap(), t.parse_cell_id("E4").unwrap());
        assert_eq!(t.parse_cell_id(" c7 ").unwrap().to_string(), "C7");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let t = standard();
        for bad in ["", "A", "A10", "I1", "A0", "A9", "1A", "AA", "A-1", "A+1", "A01", "é1"] {
            assert!(
                matches!(t.parse_cell_id(bad), Err(ValidationError::InvalidCellId { .. })),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_two_digit_ranks() {
        let frame = CoordinateFrame::new(300.0, 600.0, 6, 12, PhysicalPosition::ORIGIN).unwrap();
        let t = CoordinateTransformer::new(frame);
        let f12 = t.parse_cell_id("F12").unwrap();
        assert_eq!(f12.rank_index(), 11);
        assert_eq!(t.to_physical(f12), PhysicalPosition::new(275.0, 575.0));
        assert!(t.parse_cell_id("F13").is_err());
        assert!(t.parse_cell_id("F123").is_err());
    }

    #[test]
    fn test_frame_validation() {
        let origin = PhysicalPosition::ORIGIN;
        assert!(CoordinateFrame::new(0.0, 400.0, 8, 8, origin).is_err());
        assert!(CoordinateFrame::new(400.0, f64::NAN, 8, 8, origin).is_err());
        assert!(CoordinateFrame::new(400.0, 400.0, 0, 8, origin).is_err());
        assert!(CoordinateFrame::new(400.0, 400.0, 27, 8, origin).is_err());
        assert!(CoordinateFrame::new(400.0, 400.0, 8, 100, origin).is_err());
        assert!(CoordinateFrame::new(400.0, 400.0, 8, 8, PhysicalPosition::new(f64::INFINITY, 0.0)).is_err());
    }

    #[test]
    fn test_cell_constructor_bounds() {
        let t = standard();
        assert_eq!(t.cell(7, 7).unwrap().to_string(), "H8");
        assert!(t.cell(8, 0).is_err());
    }
}
