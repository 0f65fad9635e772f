/*
  Copyright© 2023 Raúl Wolters(1)

  This file is part of rustronomy-graphcut.

  rustronomy is free software: you can redistribute it and/or modify it under
  the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  rustronomy is distributed in the hope that it will be useful, but WITHOUT ANY
  WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
  A PARTICULAR PURPOSE. See the European Union Public License for more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with rustronomy.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

//! Spatial decomposition of the grid into macro-cells, the blocks that own
//! them and the boundary edges between blocks.
//!
//! A block is the unit of parallel ownership: the max-flow solver only reads
//! and writes nodes inside the macro-cells its block owns. As long as no two
//! live blocks own the same macro-cell, solvers on different blocks never touch
//! the same node.

use std::ops::Range;

use rayon::prelude::*;

use crate::grid::{Direction, Grid};
use crate::state::INITIAL_TIME;

////////////////////////////////////////////////////////////////////////////////
//                                CELL LAYOUT                                 //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
/// Partition of a grid into fixed-size rectangular macro-cells. The cells at
/// the far end of each axis are cut short if the grid size is not a multiple
/// of the cell size.
pub struct CellLayout {
  shape: Vec<usize>,
  cell_shape: Vec<usize>,
  cells: Grid,
  cell_of: Vec<u32>,
}

impl CellLayout {
  /// `block_size` needs at least one entry per grid dimension; surplus entries
  /// are ignored. Zero-sized cells are treated as one node wide.
  pub fn new(grid: &Grid, block_size: &[usize]) -> Self {
    debug_assert!(block_size.len() >= grid.ndim());
    let cell_shape: Vec<usize> = block_size.iter().take(grid.ndim()).map(|&size| size.max(1)).collect();
    let cells_per_dim: Vec<usize> =
      grid.shape().iter().zip(&cell_shape).map(|(&size, &cell)| (size + cell - 1) / cell).collect();
    let cells = Grid::new(&cells_per_dim);

    //Macro-cell index of every node
    let cell_of = (0..grid.len())
      .into_par_iter()
      .map(|node| {
        let cell_coord: Vec<usize> =
          (0..grid.ndim()).map(|dim| grid.coord_along(node, dim) / cell_shape[dim]).collect();
        cells.offset(&cell_coord) as u32
      })
      .collect();

    CellLayout { shape: grid.shape().to_vec(), cell_shape, cells, cell_of }
  }

  pub fn num_cells(&self) -> usize {
    self.cells.len()
  }

  pub fn cells_per_dim(&self) -> &[usize] {
    self.cells.shape()
  }

  pub fn cell_shape(&self) -> &[usize] {
    &self.cell_shape
  }

  #[inline(always)]
  pub fn cell_of(&self, node: usize) -> usize {
    self.cell_of[node] as usize
  }

  /// Coordinate ranges (one per dimension) covered by macro-cell `cell`
  pub fn cell_ranges(&self, cell: usize) -> Vec<Range<usize>> {
    self
      .cells
      .coord(cell)
      .into_iter()
      .enumerate()
      .map(|(dim, c)| {
        let start = c * self.cell_shape[dim];
        start..usize::min(start + self.cell_shape[dim], self.shape[dim])
      })
      .collect()
  }

  /// Number of axis-adjacent macro-cell pairs, i.e. the number of candidate
  /// boundary edges of a uniform partition.
  pub fn count_adjacent_pairs(&self) -> usize {
    let per_dim = self.cells.shape();
    (0..per_dim.len())
      .map(|dim| {
        per_dim
          .iter()
          .enumerate()
          .map(|(other, &n)| if other == dim { n.saturating_sub(1) } else { n })
          .product::<usize>()
      })
      .sum()
  }

  /// One boundary edge per pair of axis-adjacent macro-cells. `block_id` maps
  /// a macro-cell onto the id of the block that owns it. Faces on the outer
  /// boundary of the grid have no cell beyond them and get no edge.
  pub fn boundary_edges(&self, block_id: impl Fn(usize) -> usize) -> Vec<BoundaryEdge> {
    let mut edges = Vec::with_capacity(self.count_adjacent_pairs());
    for cell in 0..self.num_cells() {
      for dim in 0..self.cells.ndim() {
        let Some(next) = self.cells.neighbour(cell, Direction::new(dim, true)) else {
          continue;
        };
        //The boundary is the last layer of `cell` along `dim`
        let mut ranges = self.cell_ranges(cell);
        let end = ranges[dim].end;
        ranges[dim] = end.saturating_sub(1)..end;
        edges.push(BoundaryEdge { blocks: (block_id(cell), block_id(next)), dim, ranges, score: 0 });
      }
    }
    edges
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                  BLOCKS                                    //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Default)]
/// Source of monotonically increasing block ids. Owned by whoever creates the
/// blocks and reset at the start of every run.
pub struct BlockIds {
  next: usize,
}

impl BlockIds {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn next_id(&mut self) -> usize {
    let id = self.next;
    self.next += 1;
    id
  }

  /// Id the next block will get, equal to the number of ids handed out so far
  pub fn peek(&self) -> usize {
    self.next
  }

  pub fn reset(&mut self) {
    self.next = 0;
  }
}

#[derive(Debug, Clone)]
/// Ownership mask over the macro-cells of a `CellLayout`.
///
/// Blocks are immutable once created, apart from their lock flag and their
/// solver clock. Joining two blocks creates a third one; the inputs are meant
/// to be retired.
pub struct Block {
  id: usize,
  owned: Vec<bool>,
  timestamp: u64,
  locked: bool,
}

impl Block {
  fn from_mask(ids: &mut BlockIds, owned: Vec<bool>, timestamp: u64) -> Self {
    Block { id: ids.next_id(), owned, timestamp, locked: false }
  }

  /// Block owning a single macro-cell
  pub fn single(ids: &mut BlockIds, layout: &CellLayout, cell: usize) -> Self {
    let mut owned = vec![false; layout.num_cells()];
    owned[cell] = true;
    Self::from_mask(ids, owned, INITIAL_TIME)
  }

  /// Block owning the whole grid
  pub fn whole(ids: &mut BlockIds, layout: &CellLayout) -> Self {
    Self::from_mask(ids, vec![true; layout.num_cells()], INITIAL_TIME)
  }

  /// Union of two blocks under a fresh id. The new block starts unlocked and
  /// continues from the later of the two solver clocks. No node state is
  /// touched.
  pub fn join(&self, other: &Block, ids: &mut BlockIds) -> Block {
    debug_assert_eq!(self.owned.len(), other.owned.len());
    let owned = self.owned.iter().zip(&other.owned).map(|(&a, &b)| a || b).collect();
    Self::from_mask(ids, owned, self.timestamp.max(other.timestamp))
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn timestamp(&self) -> u64 {
    self.timestamp
  }

  pub fn set_timestamp(&mut self, timestamp: u64) {
    self.timestamp = timestamp;
  }

  pub fn is_locked(&self) -> bool {
    self.locked
  }

  pub fn lock(&mut self) {
    self.locked = true;
  }

  pub fn unlock(&mut self) {
    self.locked = false;
  }

  #[inline(always)]
  pub fn owns_cell(&self, cell: usize) -> bool {
    self.owned[cell]
  }

  #[inline(always)]
  pub fn owns_node(&self, layout: &CellLayout, node: usize) -> bool {
    self.owned[layout.cell_of(node)]
  }

  /// A coordinate is valid for the block if it lies inside the grid and its
  /// macro-cell is owned by the block.
  pub fn is_valid(&self, layout: &CellLayout, grid: &Grid, coord: &[usize]) -> bool {
    match grid.checked_offset(coord) {
      Some(node) => self.owns_node(layout, node),
      None => false,
    }
  }

  pub fn owned_cells(&self) -> impl Iterator<Item = usize> + '_ {
    self.owned.iter().enumerate().filter_map(|(cell, &owned)| if owned { Some(cell) } else { None })
  }
}

////////////////////////////////////////////////////////////////////////////////
//                              BOUNDARY EDGES                                //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Eq)]
/// Shared face between two blocks. `ranges` spans the last node layer on the
/// lower side of the face; every node `p` in it pairs with its successor
/// `p + e_dim` on the other side.
pub struct BoundaryEdge {
  pub(crate) blocks: (usize, usize),
  pub(crate) dim: usize,
  pub(crate) ranges: Vec<Range<usize>>,
  pub(crate) score: usize,
}

impl BoundaryEdge {
  pub fn blocks(&self) -> (usize, usize) {
    self.blocks
  }

  pub fn score(&self) -> usize {
    self.score
  }

  /// True if the edge runs between blocks `a` and `b`, in either order
  pub fn connects(&self, a: usize, b: usize) -> bool {
    self.blocks == (a, b) || self.blocks == (b, a)
  }

  pub fn touches(&self, id: usize) -> bool {
    self.blocks.0 == id || self.blocks.1 == id
  }

  /// Points every end that referenced block `old` at block `new`
  pub fn relabel(&mut self, old: usize, new: usize) {
    if self.blocks.0 == old {
      self.blocks.0 = new;
    }
    if self.blocks.1 == old {
      self.blocks.1 = new;
    }
  }

  /// The node pairs straddling the face
  pub fn pairs(&self, grid: &Grid) -> Vec<(usize, usize)> {
    let across = Direction::new(self.dim, true);
    grid
      .offsets_in(&self.ranges)
      .into_iter()
      .filter_map(|node| grid.neighbour(node, across).map(|other| (node, other)))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cells_round_up() {
    let grid = Grid::new(&[10, 4]);
    let layout = CellLayout::new(&grid, &[4, 4, 16, 8]);
    assert_eq!(layout.cells_per_dim(), &[3, 1]);
    assert_eq!(layout.cell_shape(), &[4, 4]);
    assert_eq!(layout.cell_ranges(2), vec![8..10, 0..4]);
    assert_eq!(layout.cell_of(grid.offset(&[9, 3])), 2);
    assert_eq!(layout.cell_of(grid.offset(&[3, 3])), 0);
  }

  #[test]
  fn adjacent_pair_count_matches_edges() {
    let grid = Grid::new(&[8, 8, 3]);
    let layout = CellLayout::new(&grid, &[2, 4, 2]);
    //4x2x2 cells: 3*2*2 + 4*1*2 + 4*2*1 = 28
    assert_eq!(layout.count_adjacent_pairs(), 28);
    let edges = layout.boundary_edges(|cell| cell);
    assert_eq!(edges.len(), 28);
  }

  #[test]
  fn boundary_pairs_straddle_the_face() {
    let grid = Grid::new(&[4, 4]);
    let layout = CellLayout::new(&grid, &[2, 2]);
    let edges = layout.boundary_edges(|cell| cell);
    let edge = edges.iter().find(|e| e.blocks() == (0, 1)).unwrap();
    assert_eq!(edge.dim, 1);
    let pairs = edge.pairs(&grid);
    assert_eq!(pairs, vec![(grid.offset(&[0, 1]), grid.offset(&[0, 2])), (grid.offset(&[1, 1]), grid.offset(&[1, 2]))]);
  }

  #[test]
  fn outer_faces_get_no_edges() {
    //Uneven split: the last cell along axis 0 is a single layer thick
    let grid = Grid::new(&[5, 4]);
    let layout = CellLayout::new(&grid, &[2, 4]);
    let edges = layout.boundary_edges(|cell| cell);
    assert_eq!(edges.len(), 2);
    assert!(edges.iter().all(|e| e.pairs(&grid).len() == 4));
    assert!(edges.iter().all(|e| e.ranges[0].end < 5));

    //A face on the last layer has nothing beyond it
    let outer = BoundaryEdge { blocks: (2, 2), dim: 0, ranges: vec![4..5, 0..4], score: 0 };
    assert!(outer.pairs(&grid).is_empty());
  }

  #[test]
  fn ids_are_monotonic_and_resettable() {
    let grid = Grid::new(&[4, 4]);
    let layout = CellLayout::new(&grid, &[2, 2]);
    let mut ids = BlockIds::new();
    let blocks: Vec<Block> = (0..layout.num_cells()).map(|c| Block::single(&mut ids, &layout, c)).collect();
    let joined = blocks[0].join(&blocks[1], &mut ids);
    let joined_again = joined.join(&blocks[3], &mut ids);
    let seen: Vec<usize> = blocks.iter().chain([&joined, &joined_again]).map(|b| b.id()).collect();
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ids.peek(), 6);
    ids.reset();
    assert_eq!(ids.next_id(), 0);
  }

  #[test]
  fn join_is_a_union() {
    let grid = Grid::new(&[4, 4]);
    let layout = CellLayout::new(&grid, &[2, 2]);
    let mut ids = BlockIds::new();
    let mut left = Block::single(&mut ids, &layout, 0);
    let right = Block::single(&mut ids, &layout, 3);
    left.set_timestamp(7);
    left.lock();
    let joined = left.join(&right, &mut ids);
    assert_eq!(joined.owned_cells().collect::<Vec<_>>(), vec![0, 3]);
    assert_eq!(joined.timestamp(), 7);
    assert!(!joined.is_locked());
    assert!(joined.is_valid(&layout, &grid, &[3, 3]));
    assert!(!joined.is_valid(&layout, &grid, &[0, 3]));
    assert!(!joined.is_valid(&layout, &grid, &[4, 0]));
  }

  #[test]
  fn relabel_rewrites_both_ends() {
    let mut edge = BoundaryEdge { blocks: (2, 5), dim: 0, ranges: vec![0..1], score: 3 };
    edge.relabel(5, 9);
    assert!(edge.connects(9, 2));
    assert!(edge.touches(2));
    assert!(!edge.touches(5));
  }
}
