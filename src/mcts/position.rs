//! Wraps `chess::Board` with the one piece of state the crate needs beyond
//! it (the en-passant target square) and the board/metadata tensor encoding
//! consumed by the Tree Engine and Self-Play Driver.

use chess::{Board, ChessMove, Color, File, MoveGen, Piece, Rank, Square};

pub const NO_EP_SQUARE: i32 = 64;

pub type BoardTensor = [[i32; 8]; 8];
pub type MetadataTensor = [i32; 5];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    board: Board,
    ep_target: Option<Square>,
    history: Vec<(Board, Option<Square>)>,
}

impl Default for Position {
    fn default() -> Self {
        Position { board: Board::default(), ep_target: None, history: Vec::with_capacity(200) }
    }
}

impl Position {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fen(fen: &str) -> Result<Self, chess::Error> {
        let board: Board = fen.parse()?;
        Ok(Position { board, ep_target: None, history: Vec::with_capacity(200) })
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn turn(&self) -> Color {
        self.board.side_to_move()
    }

    pub fn legal_moves(&self, buf: &mut Vec<ChessMove>) {
        buf.clear();
        buf.extend(MoveGen::new_legal(&self.board));
    }

    /// `-1` if White has been checkmated, `1` if Black has, `0` otherwise.
    /// Only meaningful when `self` has no legal moves left to play.
    pub fn terminal_evaluation(&self) -> i32 {
        if self.board.checkers() != &chess::EMPTY {
            if self.board.side_to_move() == Color::White {
                -1
            } else {
                1
            }
        } else {
            0
        }
    }

    pub fn play(&mut self, mv: ChessMove) {
        self.history.push((self.board, self.ep_target));

        let src_piece = self.board.piece_on(mv.get_source());
        let src_rank = mv.get_source().get_rank().to_index() as i32;
        let dst_rank = mv.get_dest().get_rank().to_index() as i32;
        let is_double_push = matches!(src_piece, Some(Piece::Pawn)) && (src_rank - dst_rank).abs() == 2;

        self.ep_target = if is_double_push {
            let mid_rank = (src_rank + dst_rank) / 2;
            Some(Square::make_square(Rank::from_index(mid_rank as usize), mv.get_source().get_file()))
        } else {
            None
        };

        self.board = self.board.make_move_new(mv);
    }

    /// Restores the position to what it was before the most recent `play`.
    /// Panics if called with no outstanding move to undo (a tree engine
    /// invariant violation, not a recoverable condition).
    pub fn undo(&mut self) {
        let (board, ep_target) = self.history.pop().expect("undo called with no move to undo");
        self.board = board;
        self.ep_target = ep_target;
    }

    /// Writes the board/metadata tensors for the current position, relative
    /// to the side to move: own pieces 0-5, opponent 8-13, empty 14; board
    /// rotated 180° and piece identities inverted when Black is to move.
    pub fn encode(&self, board_out: &mut BoardTensor, metadata_out: &mut MetadataTensor) {
        let mover = self.turn();

        for r in 0..8 {
            for c in 0..8 {
                let sq = Square::make_square(Rank::from_index(r), File::from_index(c));
                let code = piece_code(&self.board, sq, mover);
                if mover == Color::Black {
                    board_out[7 - r][7 - c] = code;
                } else {
                    board_out[r][c] = code;
                }
            }
        }

        let (mover_color, opponent_color) = if mover == Color::White {
            (Color::White, Color::Black)
        } else {
            (Color::Black, Color::White)
        };
        let mover_rights = self.board.castle_rights(mover_color);
        let opponent_rights = self.board.castle_rights(opponent_color);
        metadata_out[0] = mover_rights.has_kingside() as i32;
        metadata_out[1] = mover_rights.has_queenside() as i32;
        metadata_out[2] = opponent_rights.has_kingside() as i32;
        metadata_out[3] = opponent_rights.has_queenside() as i32;

        let raw_ep = self.ep_target.map(|s| s.to_index() as i32);
        metadata_out[4] = match raw_ep {
            None => NO_EP_SQUARE,
            Some(idx) => {
                if mover == Color::Black {
                    63 - idx
                } else {
                    idx
                }
            }
        };
    }
}

fn piece_code(board: &Board, sq: Square, mover: Color) -> i32 {
    match board.piece_on(sq) {
        None => 14,
        Some(piece) => {
            let idx = match piece {
                Piece::Pawn => 0,
                Piece::Knight => 1,
                Piece::Bishop => 2,
                Piece::Rook => 3,
                Piece::Queen => 4,
                Piece::King => 5,
            };
            let piece_color = board.color_on(sq).expect("piece_on returned Some but color_on returned None");
            if piece_color == mover {
                idx
            } else {
                idx + 8
            }
        }
    }
}
