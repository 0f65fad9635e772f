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

//! Addressing of nodes on an N-dimensional regular grid.
//!
//! Nodes are never materialised as objects. They are referred to by their
//! linear offset into dense, row-major (C-order) storage, which is the same
//! memory order `ndarray` uses by default. This means that a `Vec` indexed by
//! node offset can be turned into an `ndarray::ArrayD` of the grid's shape
//! without any copying or transposing.

use std::ops::Range;

/// Largest number of grid dimensions supported by the packed node flags.
pub const MAX_DIMS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// One of the `2D` axis-aligned directed edges leaving a node.
///
/// Direction `2d` points towards the predecessor along axis `d`, direction
/// `2d + 1` points towards the successor along axis `d`. Enumerating directions
/// by index therefore enumerates them dimension-first, then predecessor before
/// successor.
pub struct Direction(u8);

impl Direction {
  /// Direction along axis `dim`, towards the successor if `forward` is true.
  pub const fn new(dim: usize, forward: bool) -> Self {
    Direction(((dim as u8) << 1) | forward as u8)
  }

  pub const fn from_index(index: usize) -> Self {
    Direction(index as u8)
  }

  #[inline(always)]
  pub const fn index(self) -> usize {
    self.0 as usize
  }

  #[inline(always)]
  pub const fn dim(self) -> usize {
    (self.0 >> 1) as usize
  }

  #[inline(always)]
  pub const fn is_forward(self) -> bool {
    self.0 & 1 == 1
  }

  /// The direction pointing back along the same edge
  #[inline(always)]
  pub const fn opposite(self) -> Self {
    Direction(self.0 ^ 1)
  }

  /// All `2 * ndim` directions in enumeration order
  pub fn all(ndim: usize) -> impl Iterator<Item = Direction> {
    (0..2 * ndim).map(Direction::from_index)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Shape of an N-dimensional grid plus the strides needed to move between
/// linear offsets and coordinates.
pub struct Grid {
  shape: Vec<usize>,
  strides: Vec<usize>,
  len: usize,
}

impl Grid {
  /// # Panics
  /// Panics if the number of nodes does not fit in a `usize`, see
  /// `Grid::node_count`.
  pub fn new(shape: &[usize]) -> Self {
    let mut strides = vec![0; shape.len()];
    let mut acc = 1usize;
    for dim in (0..shape.len()).rev() {
      strides[dim] = acc;
      acc = match acc.checked_mul(shape[dim]) {
        Some(acc) => acc,
        None => panic!("grid of shape {shape:?} has more nodes than fit in a usize"),
      };
    }
    let len = if shape.is_empty() { 0 } else { acc };
    Grid { shape: shape.to_vec(), strides, len }
  }

  /// Number of nodes in a grid of the given shape, `None` if it overflows
  pub fn node_count(shape: &[usize]) -> Option<usize> {
    let count = shape.iter().rev().try_fold(1usize, |acc, &size| acc.checked_mul(size))?;
    Some(if shape.is_empty() { 0 } else { count })
  }

  #[inline(always)]
  pub fn ndim(&self) -> usize {
    self.shape.len()
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn strides(&self) -> &[usize] {
    &self.strides
  }

  /// Total number of nodes
  #[inline(always)]
  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// A grid without dimensions, or with a zero-length dimension, cannot hold
  /// a segmentation.
  pub fn is_degenerate(&self) -> bool {
    self.shape.is_empty() || self.shape.iter().any(|&size| size == 0)
  }

  pub fn contains(&self, coord: &[usize]) -> bool {
    coord.len() == self.ndim() && coord.iter().zip(&self.shape).all(|(&c, &size)| c < size)
  }

  /// Linear offset of `coord`. Out-of-range coordinates are a caller bug,
  /// they are only caught in debug builds. Use `checked_offset` for untrusted
  /// input.
  #[inline]
  pub fn offset(&self, coord: &[usize]) -> usize {
    debug_assert!(
      self.contains(coord),
      "coordinate {coord:?} is out of bounds for grid of shape {:?}",
      self.shape
    );
    coord.iter().zip(&self.strides).map(|(&c, &stride)| c * stride).sum()
  }

  pub fn checked_offset(&self, coord: &[usize]) -> Option<usize> {
    if self.contains(coord) {
      Some(self.offset(coord))
    } else {
      None
    }
  }

  /// Coordinate vector of the node at `offset`
  pub fn coord(&self, offset: usize) -> Vec<usize> {
    (0..self.ndim()).map(|dim| self.coord_along(offset, dim)).collect()
  }

  /// Single component of the coordinate of the node at `offset`
  #[inline(always)]
  pub fn coord_along(&self, offset: usize, dim: usize) -> usize {
    (offset / self.strides[dim]) % self.shape[dim]
  }

  /// Offset of the axis-neighbour of `offset` in direction `dir`, or `None` if
  /// that neighbour lies outside the grid.
  #[inline]
  pub fn neighbour(&self, offset: usize, dir: Direction) -> Option<usize> {
    let dim = dir.dim();
    let c = self.coord_along(offset, dim);
    if dir.is_forward() {
      if c + 1 < self.shape[dim] {
        Some(offset + self.strides[dim])
      } else {
        None
      }
    } else if c > 0 {
      Some(offset - self.strides[dim])
    } else {
      None
    }
  }

  /// Iterator over all in-grid axis-neighbours of `offset`, in direction
  /// enumeration order.
  pub fn neighbours(&self, offset: usize) -> impl Iterator<Item = (Direction, usize)> + '_ {
    Direction::all(self.ndim())
      .filter_map(move |dir| self.neighbour(offset, dir).map(|nb| (dir, nb)))
  }

  /// Offsets of all nodes inside the box spanned by `ranges` (one range per
  /// dimension), in row-major order.
  pub fn offsets_in(&self, ranges: &[Range<usize>]) -> Vec<usize> {
    debug_assert_eq!(ranges.len(), self.ndim());
    if ranges.is_empty() || ranges.iter().any(|r| r.is_empty()) {
      return Vec::new();
    }

    let count = ranges.iter().map(|r| r.len()).product();
    let mut out = Vec::with_capacity(count);
    let mut cursor: Vec<usize> = ranges.iter().map(|r| r.start).collect();
    'odometer: loop {
      out.push(self.offset(&cursor));
      //Advance the last axis first and carry into the earlier ones
      let mut dim = ranges.len();
      loop {
        if dim == 0 {
          break 'odometer;
        }
        dim -= 1;
        cursor[dim] += 1;
        if cursor[dim] < ranges[dim].end {
          break;
        }
        cursor[dim] = ranges[dim].start;
      }
    }
    out
  }
}
