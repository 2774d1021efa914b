//! Packed per-node PUCT statistics and the arena that owns them.
//!
//! Materialized children are referenced by `u32` index into a flat
//! `Vec<PackedNode>` rather than embedded inline with the node that owns
//! them (the indexed-arena redesign from SPEC_FULL.md §9); the Block
//! Allocator backs only each node's leaf-record byte array (3 bytes per
//! record: a 16-bit move code plus an 8-bit quantized prior).

use crate::allocator::BlockAllocator;
use chess::{ChessMove, Color, Piece, Square, ALL_SQUARES};

use super::policy::{dequantize_prior, quantize_prior};

const RECORD_SIZE: usize = 3;

/// A reference-like error-avoidance placeholder: callers must check the
/// accompanying `Option<NodeRef>` before using a returned move.
pub fn null_move() -> ChessMove {
    ChessMove::new(ALL_SQUARES[0], ALL_SQUARES[0], None)
}

fn encode_move(mv: ChessMove) -> u16 {
    let src = mv.get_source().to_index() as u16;
    let dst = mv.get_dest().to_index() as u16;
    let promo = match mv.get_promotion() {
        None => 0u16,
        Some(Piece::Knight) => 1,
        Some(Piece::Bishop) => 2,
        Some(Piece::Rook) => 3,
        Some(Piece::Queen) => 4,
        Some(_) => 0,
    };
    src | (dst << 6) | (promo << 12)
}

fn decode_move(code: u16) -> ChessMove {
    let src = (code & 0x3f) as usize;
    let dst = ((code >> 6) & 0x3f) as usize;
    let promo = match (code >> 12) & 0xf {
        1 => Some(Piece::Knight),
        2 => Some(Piece::Bishop),
        3 => Some(Piece::Rook),
        4 => Some(Piece::Queen),
        _ => None,
    };
    ChessMove::new(ALL_SQUARES[src], ALL_SQUARES[dst], promo)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(pub u32);

/// Sentinel passed to `teardown_except` to mean "keep nothing", i.e. tear
/// down the whole subtree including its root. Never matches a real
/// allocated node (the arena cannot reach `u32::MAX` entries).
pub const NIL_NODE: NodeRef = NodeRef(u32::MAX);

pub struct PackedNode {
    color: Color,
    terminal: bool,
    num_children: u8,
    num_expanded: u8,
    q: f32,
    num_times_selected: u32,
    records: Option<usize>,
    children: Vec<NodeRef>,
}

impl PackedNode {
    fn new(color: Color) -> Self {
        PackedNode {
            color,
            terminal: false,
            num_children: 0,
            num_expanded: 0,
            q: 0.0,
            num_times_selected: 0,
            records: None,
            children: Vec::new(),
        }
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn is_leaf(&self) -> bool {
        self.num_children == 0
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn mark_terminal(&mut self) {
        self.terminal = true;
    }

    pub fn num_children(&self) -> u8 {
        self.num_children
    }

    pub fn num_expanded(&self) -> u8 {
        self.num_expanded
    }

    pub fn num_times_selected(&self) -> u32 {
        self.num_times_selected
    }

    pub fn mean_q(&self) -> f32 {
        if self.num_times_selected > 0 {
            self.q / self.num_times_selected as f32
        } else {
            0.0
        }
    }

    fn backup(&mut self, q: f32) {
        self.num_times_selected += 1;
        self.q += q;
    }

    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }
}

/// Avoid div-by-zero in the visit-count distributions below; matches the
/// original's own `EPSILON` constant rather than `f32::EPSILON`.
const EPSILON: f32 = 1e-20;

pub struct NodeArena {
    allocator: BlockAllocator,
    nodes: Vec<PackedNode>,
    expand_scratch: Vec<(ChessMove, f32)>,
}

impl NodeArena {
    pub fn new(block_size: usize, unit: usize, capacity: usize) -> Self {
        NodeArena {
            allocator: BlockAllocator::new(block_size, unit),
            nodes: Vec::with_capacity(capacity),
            expand_scratch: Vec::new(),
        }
    }

    pub fn alloc_node(&mut self, color: Color) -> NodeRef {
        self.nodes.push(PackedNode::new(color));
        NodeRef((self.nodes.len() - 1) as u32)
    }

    pub fn get(&self, r: NodeRef) -> &PackedNode {
        &self.nodes[r.0 as usize]
    }

    pub fn get_mut(&mut self, r: NodeRef) -> &mut PackedNode {
        &mut self.nodes[r.0 as usize]
    }

    pub fn reset(&mut self) {
        self.allocator.reset();
        self.nodes.clear();
    }

    fn move_at(&self, offset: usize, i: usize) -> ChessMove {
        let base = offset + i * RECORD_SIZE;
        let bytes = self.allocator.bytes();
        let code = u16::from_le_bytes([bytes[base], bytes[base + 1]]);
        decode_move(code)
    }

    fn prior_at(&self, offset: usize, i: usize) -> f32 {
        let base = offset + i * RECORD_SIZE;
        dequantize_prior(self.allocator.bytes()[base + 2])
    }

    fn write_record(&mut self, offset: usize, i: usize, mv: ChessMove, prior: f32) {
        let base = offset + i * RECORD_SIZE;
        let code = encode_move(mv).to_le_bytes();
        let bytes = self.allocator.bytes_mut();
        bytes[base] = code[0];
        bytes[base + 1] = code[1];
        bytes[base + 2] = quantize_prior(prior);
    }

    /// Expands a leaf with `legal_moves`, softmax-normalizing `raw_logits`
    /// (parallel to `legal_moves`) into quantized priors, sorted descending
    /// so the highest-prior record is always first.
    pub fn expand(&mut self, node: NodeRef, legal_moves: &[ChessMove], raw_logits: &[f32]) {
        assert_eq!(legal_moves.len(), raw_logits.len());
        assert!(!legal_moves.is_empty(), "expand called with no legal moves");
        {
            let n = &self.nodes[node.0 as usize];
            assert!(n.is_leaf() && !n.terminal, "expand called on a non-leaf or terminal node");
        }

        self.expand_scratch.clear();
        let mut total = 0f32;
        for (&mv, &logit) in legal_moves.iter().zip(raw_logits) {
            assert!(logit.is_finite(), "non-finite policy logit during expand");
            let p = logit.exp();
            total += p;
            self.expand_scratch.push((mv, p));
        }
        for entry in self.expand_scratch.iter_mut() {
            entry.1 /= total;
        }
        self.expand_scratch.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("NaN prior"));

        let n_children = self.expand_scratch.len();
        let offset = self.allocator.alloc(n_children * RECORD_SIZE).expect("block allocator exhausted");
        for i in 0..n_children {
            let (mv, p) = self.expand_scratch[i];
            self.write_record(offset, i, mv, p);
        }

        let n = &mut self.nodes[node.0 as usize];
        n.num_children = n_children as u8;
        n.records = Some(offset);
    }

    /// PUCT selection ("newer" formula variant only, per SPEC_FULL.md §9):
    /// materializes a new leaf the first time an unexpanded record wins.
    pub fn select_best_child(&mut self, node: NodeRef, cpuct: f32) -> (Option<NodeRef>, ChessMove) {
        let idx = node.0 as usize;
        let num_children = self.nodes[idx].num_children as usize;
        if num_children == 0 {
            return (None, null_move());
        }
        let num_expanded = self.nodes[idx].num_expanded as usize;
        let num_times_selected = self.nodes[idx].num_times_selected;
        let offset = self.nodes[idx].records.expect("expanded node missing its record array");
        let start = cpuct * (num_times_selected as f32).sqrt();

        let mut best_u;
        let mut best_move;
        let mut leaf_is_best;
        if num_expanded < num_children {
            best_u = start * self.prior_at(offset, num_expanded);
            best_move = self.move_at(offset, num_expanded);
            leaf_is_best = true;
        } else {
            best_u = f32::MIN;
            best_move = null_move();
            leaf_is_best = false;
        }

        let mut best_existing: Option<NodeRef> = None;
        for i in 0..num_expanded {
            let child_ref = self.nodes[idx].children[i];
            let child_idx = child_ref.0 as usize;
            let n_i = self.nodes[child_idx].num_times_selected;
            let q_i = self.nodes[child_idx].mean_q();
            let p_i = self.prior_at(offset, i);
            let u = start * p_i / (1.0 + n_i as f32) - q_i;
            if u > best_u {
                best_u = u;
                best_existing = Some(child_ref);
                best_move = self.move_at(offset, i);
                leaf_is_best = false;
            }
        }

        if let Some(child_ref) = best_existing {
            (Some(child_ref), best_move)
        } else {
            debug_assert!(leaf_is_best, "a node with children must have an unexpanded leaf when no child wins");
            let child_color = !self.nodes[idx].color;
            let new_ref = self.alloc_node(child_color);
            self.nodes[idx].children.push(new_ref);
            self.nodes[idx].num_expanded += 1;
            (Some(new_ref), best_move)
        }
    }

    pub fn backup(&mut self, node: NodeRef, q: f32) {
        self.nodes[node.0 as usize].backup(q);
    }

    /// Visit-count distribution over expanded children, temperature-scaled.
    pub fn policy(&self, node: NodeRef, temperature: f32) -> Vec<(ChessMove, f32)> {
        let idx = node.0 as usize;
        let num_expanded = self.nodes[idx].num_expanded as usize;
        if num_expanded == 0 {
            return Vec::new();
        }
        let offset = self.nodes[idx].records.expect("expanded node missing its record array");
        let n = self.nodes[idx].num_times_selected as f32;

        let weights: Vec<f32> = (0..num_expanded)
            .map(|i| {
                let child_ref = self.nodes[idx].children[i];
                let ni = self.nodes[child_ref.0 as usize].num_times_selected as f32;
                (ni / n).powf(1.0 / temperature)
            })
            .collect();
        let total: f32 = weights.iter().sum::<f32>() + EPSILON;

        (0..num_expanded).map(|i| (self.move_at(offset, i), weights[i] / total)).collect()
    }

    /// Samples a child proportional to its temperature-scaled visit count,
    /// using a single caller-supplied uniform draw in `[0, 1)`.
    pub fn select_best_child_by_count(
        &self,
        node: NodeRef,
        temperature: f32,
        rand_unit: f32,
    ) -> Option<(NodeRef, ChessMove)> {
        let idx = node.0 as usize;
        let num_expanded = self.nodes[idx].num_expanded as usize;
        if num_expanded == 0 {
            return None;
        }
        let offset = self.nodes[idx].records.expect("expanded node missing its record array");
        let n = self.nodes[idx].num_times_selected as f32;

        let mut cumsum = Vec::with_capacity(num_expanded);
        let mut running = 0f32;
        for i in 0..num_expanded {
            let child_ref = self.nodes[idx].children[i];
            let ni = self.nodes[child_ref.0 as usize].num_times_selected as f32;
            running += (ni / n).powf(1.0 / temperature);
            cumsum.push(running);
        }
        let total = cumsum[num_expanded - 1] + EPSILON;
        let threshold = rand_unit * total;

        for i in 0..num_expanded {
            if cumsum[i] >= threshold {
                return Some((self.nodes[idx].children[i], self.move_at(offset, i)));
            }
        }
        let last = num_expanded - 1;
        Some((self.nodes[idx].children[last], self.move_at(offset, last)))
    }

    /// Recursively minimaxes from `node`'s perspective. Reproduces the
    /// original's degenerate case verbatim: an expanded node all of whose
    /// children are unvisited, non-terminal leaves returns `-f32::MAX`.
    pub fn minimax_evaluation(&self, node: NodeRef) -> f32 {
        let idx = node.0 as usize;
        let num_expanded = self.nodes[idx].num_expanded as usize;
        if num_expanded == 0 {
            return self.nodes[idx].mean_q();
        }
        let mut min_eval = f32::MAX;
        for i in 0..num_expanded {
            let child_ref = self.nodes[idx].children[i];
            let child = &self.nodes[child_ref.0 as usize];
            if !child.is_leaf() || child.is_terminal() {
                min_eval = min_eval.min(self.minimax_evaluation(child_ref));
            }
        }
        -min_eval
    }

    pub fn size(&self, node: NodeRef) -> usize {
        let idx = node.0 as usize;
        let n = &self.nodes[idx];
        let mut total = 1 + (n.num_children as usize - n.num_expanded as usize);
        for i in 0..n.num_expanded as usize {
            total += self.size(n.children[i]);
        }
        total
    }

    /// Frees record bytes for every node in `node`'s subtree except `keep`
    /// (and whatever lies beneath it). Used when replacing the root so the
    /// discarded branches don't leak allocator storage.
    pub fn teardown_except(&mut self, node: NodeRef, keep: NodeRef) {
        if node == keep {
            return;
        }
        let idx = node.0 as usize;
        let (num_children, records, children) = {
            let n = &self.nodes[idx];
            (n.num_children, n.records, n.children.clone())
        };
        for child in children {
            self.teardown_except(child, keep);
        }
        if let Some(offset) = records {
            self.allocator.free(offset, num_children as usize * RECORD_SIZE);
        }
    }
}
