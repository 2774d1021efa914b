//! Self-play game records: an in-memory accumulator plus a streaming text
//! writer in the format from SPEC_FULL.md §6 — a board-state line, a
//! policy line, a move line and a side line per ply, with the game
//! terminated by `"<result> WINNER!"`.
//!
//! Moves are serialized with `chess::ChessMove`'s own `Display` (UCI
//! notation, e.g. `e2e4`) rather than a bespoke textual format — see
//! DESIGN.md's Self-Play Driver entry.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chess::{ChessMove, Color};

use super::policy::NUM_PLANES;
use super::position::{BoardTensor, MetadataTensor};

pub type LegalMask = [[[u8; NUM_PLANES]; 8]; 8];
pub type PolicyTensor = [[[f32; NUM_PLANES]; 8]; 8];

pub struct RecordWriter {
    out: BufWriter<File>,
}

impl RecordWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(RecordWriter { out: BufWriter::new(File::create(path)?) })
    }

    pub fn write_move(
        &mut self,
        board: &BoardTensor,
        metadata: &MetadataTensor,
        legal_mask: &LegalMask,
        policy: &PolicyTensor,
        mv: ChessMove,
        side: Color,
    ) -> io::Result<()> {
        for row in board {
            for cell in row {
                write!(self.out, "{},", cell)?;
            }
        }
        for m in metadata {
            write!(self.out, "{},", m)?;
        }
        writeln!(self.out)?;

        for rank in 0..8 {
            for file in 0..8 {
                for plane in 0..NUM_PLANES {
                    if legal_mask[rank][file][plane] != 0 {
                        write!(self.out, "{},{},{},{},", rank, file, plane, policy[rank][file][plane])?;
                    }
                }
            }
        }
        writeln!(self.out)?;

        writeln!(self.out, "{}", mv)?;
        writeln!(self.out, "{}", if side == Color::White { 0 } else { 1 })?;
        Ok(())
    }

    pub fn write_winner(&mut self, result: i32) -> io::Result<()> {
        writeln!(self.out, "{} WINNER!", result)?;
        self.out.flush()
    }
}

/// In-memory accumulation of the current game's history, for hosts that
/// want the record without re-parsing the text output.
pub struct GameRecord {
    pub boards: Vec<BoardTensor>,
    pub metadata: Vec<MetadataTensor>,
    pub moves: Vec<ChessMove>,
    pub sides: Vec<Color>,
    pub winner: Option<i32>,
}

impl GameRecord {
    pub fn new() -> Self {
        GameRecord { boards: Vec::new(), metadata: Vec::new(), moves: Vec::new(), sides: Vec::new(), winner: None }
    }

    pub fn push(&mut self, board: BoardTensor, metadata: MetadataTensor, mv: ChessMove, side: Color) {
        self.boards.push(board);
        self.metadata.push(metadata);
        self.moves.push(mv);
        self.sides.push(side);
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

impl Default for GameRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess::{File, Rank, Square};
    use std::env;

    #[test]
    fn game_record_tracks_pushed_plies() {
        let mut record = GameRecord::new();
        assert!(record.is_empty());
        let board = [[14; 8]; 8];
        let mv = ChessMove::new(Square::make_square(Rank::Second, File::E), Square::make_square(Rank::Fourth, File::E), None);
        record.push(board, [0, 0, 0, 0, 64], mv, Color::White);
        assert_eq!(record.len(), 1);
        assert_eq!(record.sides[0], Color::White);
    }

    #[test]
    fn writer_emits_winner_line() {
        let path = env::temp_dir().join("chess_mcts_record_writer_test.txt");
        {
            let mut writer = RecordWriter::create(&path).unwrap();
            writer.write_winner(1).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.trim_end().ends_with("1 WINNER!"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn writer_emits_one_entry_per_legal_move() {
        let path = env::temp_dir().join("chess_mcts_record_writer_policy_test.txt");
        let board = [[14; 8]; 8];
        let metadata = [1, 1, 1, 1, 64];
        let mut legal_mask: LegalMask = [[[0u8; NUM_PLANES]; 8]; 8];
        let mut policy: PolicyTensor = [[[0f32; NUM_PLANES]; 8]; 8];
        legal_mask[1][4][0] = 1;
        policy[1][4][0] = 1.0;
        let mv = ChessMove::new(Square::make_square(Rank::Second, File::E), Square::make_square(Rank::Third, File::E), None);
        {
            let mut writer = RecordWriter::create(&path).unwrap();
            writer.write_move(&board, &metadata, &legal_mask, &policy, mv, Color::White).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[1], "1,4,0,1,");
        assert_eq!(lines[2], "e2e3");
        assert_eq!(lines[3], "0");
        let _ = std::fs::remove_file(&path);
    }
}
