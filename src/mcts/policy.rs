//! Move ⇄ (rank, file, plane) mapping for the 8×8×73 policy tensor, and the
//! quantized-prior byte encoding stored in each leaf record.
//!
//! Plane layout (ported arithmetic-for-arithmetic from the original's
//! `move2index_initializer`, computed directly here instead of through a
//! precomputed cache — see DESIGN.md):
//!
//! - planes 0-55: sliding moves, `plane = direction * 7 + (distance - 1)`,
//!   directions in order N, NE, E, SE, S, SW, W, NW (0..7).
//! - planes 56-63: the eight knight deltas.
//! - planes 64-72: underpromotions (bishop/knight/rook), three sub-
//!   directions each (NW-capture, push, NE-capture).
//!
//! Non-promoting pawn moves (including queen promotions) reuse the slider
//! planes; a double pawn push lands on plane 1 (the N direction, "distance"
//! 2).

use chess::{ChessMove, Color, Piece, Square};

pub const BOARD_SIZE: usize = 8;
pub const NUM_PLANES: usize = 73;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyIndex {
    pub rank: u8,
    pub file: u8,
    pub plane: u8,
}

/// `byte = floor(min(p * 256, 255))`.
pub fn quantize_prior(p: f32) -> u8 {
    (p * 256.0).min(255.0).floor() as u8
}

/// `(byte + 0.5) / 256`.
pub fn dequantize_prior(byte: u8) -> f32 {
    (byte as f32 + 0.5) / 256.0
}

/// Computes the policy-tensor index for `mv`, played by `mover` on `board`.
///
/// The origin square is mirrored (`63 - origin`) for Black before deriving
/// rank/file, matching the original's rotated board convention.
pub fn policy_index(board: &chess::Board, mv: ChessMove, mover: Color) -> PolicyIndex {
    let piece = board
        .piece_on(mv.get_source())
        .expect("policy_index called with a move whose source square is empty");

    let mut origin = mv.get_source().to_index() as i32;
    if mover == Color::Black {
        origin = 63 - origin;
    }
    let rank = (origin / 8) as u8;
    let file = (origin % 8) as u8;
    let plane = plane_index(piece, mv, mover);
    PolicyIndex { rank, file, plane }
}

fn signed_diff(src: Square, dst: Square, mover: Color) -> i32 {
    let s = src.to_index() as i32;
    let d = dst.to_index() as i32;
    if mover == Color::White {
        d - s
    } else {
        s - d
    }
}

fn plane_index(piece: Piece, mv: ChessMove, mover: Color) -> u8 {
    match piece {
        Piece::Pawn => pawn_plane(mv, mover),
        Piece::Knight => knight_plane(mv, mover),
        Piece::Bishop | Piece::Rook | Piece::Queen | Piece::King => slider_plane(mv, mover),
    }
}

fn slider_plane(mv: ChessMove, mover: Color) -> u8 {
    let src = mv.get_source();
    let dst = mv.get_dest();
    let diff = signed_diff(src, dst, mover);

    let (dir, num) = if diff % 8 == 0 {
        (if diff > 0 { 0 } else { 4 }, diff / 8)
    } else if diff % 9 == 0 {
        (if diff > 0 { 1 } else { 5 }, diff / 9)
    } else if diff % 7 == 0 && src.get_rank() != dst.get_rank() {
        (if diff > 0 { 7 } else { 3 }, diff / 7)
    } else {
        (if diff > 0 { 2 } else { 6 }, diff)
    };

    (dir * 7 + (num.abs() - 1)) as u8
}

const KNIGHT_DELTAS: [(i32, u8); 8] = [
    (10, 0),
    (17, 1),
    (15, 2),
    (6, 3),
    (-10, 4),
    (-17, 5),
    (-15, 6),
    (-6, 7),
];

fn knight_plane(mv: ChessMove, mover: Color) -> u8 {
    let diff = signed_diff(mv.get_source(), mv.get_dest(), mover);
    let dir = KNIGHT_DELTAS
        .iter()
        .find(|(d, _)| *d == diff)
        .map(|(_, dir)| *dir)
        .expect("knight move with an impossible source/destination delta");
    56 + dir
}

fn pawn_plane(mv: ChessMove, mover: Color) -> u8 {
    let diff = signed_diff(mv.get_source(), mv.get_dest(), mover);

    if let Some(promo) = mv.get_promotion() {
        if promo != Piece::Queen {
            let base = match promo {
                Piece::Bishop => 64,
                Piece::Knight => 67,
                Piece::Rook => 70,
                _ => unreachable!("pawns only underpromote to bishop, knight or rook"),
            };
            let sub_dir = match diff {
                7 => 0,
                8 => 1,
                9 => 2,
                _ => unreachable!("illegal pawn underpromotion delta {diff}"),
            };
            return base + sub_dir;
        }
    }

    let dir = match diff {
        7 => 7,
        8 | 16 => 0,
        9 => 1,
        _ => unreachable!("illegal pawn move delta {diff}"),
    };
    let mut plane = dir * 7;
    if diff == 16 {
        plane += 1;
    }
    plane
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess::{Board, ChessMove, File, Rank};
    use std::str::FromStr;

    fn sq(rank: Rank, file: File) -> Square {
        Square::make_square(rank, file)
    }

    #[test]
    fn quantize_round_trip_stays_within_one_bucket() {
        for i in 0..=255u8 {
            let p = dequantize_prior(i);
            assert_eq!(quantize_prior(p), i);
        }
    }

    #[test]
    fn quantize_clamps_at_one() {
        assert_eq!(quantize_prior(1.0), 255);
        assert_eq!(quantize_prior(10.0), 255);
    }

    #[test]
    fn quantize_is_monotonic() {
        let mut prev = quantize_prior(0.0);
        let mut p = 0.001;
        while p < 1.0 {
            let cur = quantize_prior(p);
            assert!(cur >= prev);
            prev = cur;
            p += 0.001;
        }
    }

    #[test]
    fn white_north_push_is_plane_zero() {
        let board = Board::from_str("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1").unwrap();
        let mv = ChessMove::new(sq(Rank::Second, File::E), sq(Rank::Third, File::E), None);
        let idx = policy_index(&board, mv, Color::White);
        assert_eq!(idx.plane, 0);
        assert_eq!(idx.rank, 1);
        assert_eq!(idx.file, 4);
    }

    #[test]
    fn white_double_push_lands_on_plane_one() {
        let board = Board::from_str("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1").unwrap();
        let mv = ChessMove::new(sq(Rank::Second, File::E), sq(Rank::Fourth, File::E), None);
        let idx = policy_index(&board, mv, Color::White);
        assert_eq!(idx.plane, 1);
    }

    #[test]
    fn black_origin_is_mirrored() {
        let board = Board::from_str("rnbqkbnr/pppp1ppp/8/4p3/8/8/PPPPPPPP/RNBQKBNR b KQkq - 0 1").unwrap();
        // Black g8f6: origin g8 = index 62, mirrored to 63-62=1 -> rank 0 file 1.
        let mv = ChessMove::new(sq(Rank::Eighth, File::G), sq(Rank::Sixth, File::F), None);
        let idx = policy_index(&board, mv, Color::Black);
        assert_eq!((idx.rank, idx.file), (0, 1));
    }

    #[test]
    fn horizontal_rook_move_is_not_confused_with_diagonal() {
        let board = Board::from_str("4k3/8/8/8/8/8/8/R3K3 w Q - 0 1").unwrap();
        let mv = ChessMove::new(sq(Rank::First, File::A), sq(Rank::First, File::H), None);
        let idx = policy_index(&board, mv, Color::White);
        // diff = 7 but same rank: must resolve to the E (dir=2) plane at distance 7, not SW/NW.
        assert_eq!(idx.plane, 2 * 7 + 6);
    }

    #[test]
    fn knight_plane_matches_delta_table() {
        let board = Board::from_str("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1").unwrap();
        let mv = ChessMove::new(sq(Rank::First, File::G), sq(Rank::Third, File::F), None);
        let idx = policy_index(&board, mv, Color::White);
        // g1f3: signed_diff = 21 - 6 = +15, which KNIGHT_DELTAS maps to dir 2.
        assert_eq!(idx.plane, 56 + 2);
    }

    #[test]
    fn underpromotion_planes_are_distinct_from_queen_promotion() {
        let board = Board::from_str("8/4P1k1/8/8/8/8/6K1/8 w - - 0 1").unwrap();
        let push = ChessMove::new(sq(Rank::Seventh, File::E), sq(Rank::Eighth, File::E), Some(Piece::Rook));
        let idx = policy_index(&board, push, Color::White);
        assert_eq!(idx.plane, 70 + 1);

        let queen_push = ChessMove::new(sq(Rank::Seventh, File::E), sq(Rank::Eighth, File::E), Some(Piece::Queen));
        let idx_q = policy_index(&board, queen_push, Color::White);
        assert_eq!(idx_q.plane, 0);
    }
}
