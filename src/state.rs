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

//! The graph state container: static edge capacities, per-node solver state
//! and the two terminal lists.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ndarray as nd;
use rayon::prelude::*;

use crate::flags::{NodeFlags, Tree};
use crate::grid::{Direction, Grid, MAX_DIMS};
use crate::GraphCutError;

/// Distance sentinel for nodes whose distance to a terminal is unknown
pub(crate) const INVALID_DISTANCE: u32 = u32::MAX;

/// Logical clock value of freshly seeded terminals and freshly created blocks
pub(crate) const INITIAL_TIME: u64 = 1;

////////////////////////////////////////////////////////////////////////////////
//                                NODE CELLS                                  //
////////////////////////////////////////////////////////////////////////////////

/*
  Per-node state is mutated from several threads at once during the parallel
  phases, each thread only touching the nodes owned by the block it is solving.
  Storing the state in relaxed atomics lets all threads share a plain `&GraphState`
  without any unsafe code. On the platforms we care about a relaxed load/store
  compiles to an ordinary load/store, so the single-threaded hot loops do not
  pay for it. Ordering between phases comes from rayon joins and the merge lock.
*/
pub(crate) trait CellValue: Copy {
  type Atomic: Send + Sync;
  fn new_atomic(self) -> Self::Atomic;
  fn load(atomic: &Self::Atomic) -> Self;
  fn store(atomic: &Self::Atomic, value: Self);
}

impl CellValue for f64 {
  type Atomic = AtomicU64;
  fn new_atomic(self) -> AtomicU64 {
    AtomicU64::new(self.to_bits())
  }
  #[inline(always)]
  fn load(atomic: &AtomicU64) -> f64 {
    f64::from_bits(atomic.load(Ordering::Relaxed))
  }
  #[inline(always)]
  fn store(atomic: &AtomicU64, value: f64) {
    atomic.store(value.to_bits(), Ordering::Relaxed)
  }
}

impl CellValue for u32 {
  type Atomic = AtomicU32;
  fn new_atomic(self) -> AtomicU32 {
    AtomicU32::new(self)
  }
  #[inline(always)]
  fn load(atomic: &AtomicU32) -> u32 {
    atomic.load(Ordering::Relaxed)
  }
  #[inline(always)]
  fn store(atomic: &AtomicU32, value: u32) {
    atomic.store(value, Ordering::Relaxed)
  }
}

impl CellValue for u64 {
  type Atomic = AtomicU64;
  fn new_atomic(self) -> AtomicU64 {
    AtomicU64::new(self)
  }
  #[inline(always)]
  fn load(atomic: &AtomicU64) -> u64 {
    atomic.load(Ordering::Relaxed)
  }
  #[inline(always)]
  fn store(atomic: &AtomicU64, value: u64) {
    atomic.store(value, Ordering::Relaxed)
  }
}

impl CellValue for NodeFlags {
  type Atomic = AtomicU32;
  fn new_atomic(self) -> AtomicU32 {
    AtomicU32::new(self.bits())
  }
  #[inline(always)]
  fn load(atomic: &AtomicU32) -> NodeFlags {
    NodeFlags::from_bits(atomic.load(Ordering::Relaxed))
  }
  #[inline(always)]
  fn store(atomic: &AtomicU32, value: NodeFlags) {
    atomic.store(value.bits(), Ordering::Relaxed)
  }
}

pub(crate) struct NodeCells<T: CellValue> {
  data: Vec<T::Atomic>,
}

impl<T: CellValue> NodeCells<T> {
  pub fn from_fill(value: T, len: usize) -> Self {
    NodeCells { data: (0..len).map(|_| value.new_atomic()).collect() }
  }

  #[inline(always)]
  pub fn get(&self, idx: usize) -> T {
    T::load(&self.data[idx])
  }

  #[inline(always)]
  pub fn set(&self, idx: usize, value: T) {
    T::store(&self.data[idx], value)
  }
}

impl<T: CellValue> Default for NodeCells<T> {
  fn default() -> Self {
    NodeCells { data: Vec::new() }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                GRAPH STATE                                 //
////////////////////////////////////////////////////////////////////////////////

/// Terminal nodes of a run, as validated linear offsets
#[derive(Debug, Clone, Default)]
pub(crate) struct Terminals {
  pub sources: Vec<usize>,
  pub sinks: Vec<usize>,
}

impl Terminals {
  pub fn all(&self) -> impl Iterator<Item = usize> + '_ {
    self.sources.iter().chain(self.sinks.iter()).copied()
  }
}

#[derive(Default)]
/// State of the grid graph shared by all solvers.
///
/// Every node has `2D` directed edges to its axis-neighbours. The static
/// capacity of the (undirected) edge between a node and its successor along
/// axis `d` is stored once; the residual capacities of both directed halves are
/// kept per node. Pushing flow one way frees exactly the same amount of
/// capacity the other way.
///
/// The container is allocated once per grid size with one of the `init_*`
/// methods and reset at the start of every run.
pub struct GraphState {
  grid: Grid,
  capacity: Vec<f64>,
  residual: NodeCells<f64>,
  distance: NodeCells<u32>,
  timestamp: NodeCells<u64>,
  flags: NodeCells<NodeFlags>,
  sources: Vec<Vec<usize>>,
  sinks: Vec<Vec<usize>>,
  flow: f64,
  up_to_date: bool,
}

impl std::fmt::Debug for GraphState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("GraphState")
      .field("shape", &self.grid.shape())
      .field("sources", &self.sources.len())
      .field("sinks", &self.sinks.len())
      .field("flow", &self.flow)
      .field("up_to_date", &self.up_to_date)
      .field("data", &"Omitted...")
      .finish()
  }
}

#[inline]
fn sanitise_weight(weight: f64) -> f64 {
  if weight.is_nan() || weight <= 0.0 {
    0.0
  } else if weight.is_infinite() {
    f64::MAX
  } else {
    weight
  }
}

impl GraphState {
  pub fn new() -> Self {
    Self::default()
  }

  /// Allocates all per-node storage for a grid of the given `shape` and fills
  /// the static edge capacities by calling `weight(coord, dim)` once for every
  /// node that has a successor along axis `dim`. The returned value is the
  /// capacity of the undirected edge between `coord` and that successor.
  ///
  /// NaN and negative weights are stored as zero capacity, positive infinity
  /// as `f64::MAX`. The weight function is called from several threads.
  ///
  /// Terminal lists are kept if the shape did not change, so the same seeds can
  /// be reused with different weights. Otherwise they are cleared.
  pub fn init_from_weight_function<F>(&mut self, shape: &[usize], weight: F) -> Result<(), GraphCutError>
  where
    F: Fn(&[usize], usize) -> f64 + Sync,
  {
    if shape.len() > MAX_DIMS {
      return Err(GraphCutError::TooManyDimensions { ndim: shape.len() });
    }
    //Residuals need two entries per node and dimension
    if Grid::node_count(shape).and_then(|n| n.checked_mul(2 * shape.len())).is_none() {
      return Err(GraphCutError::GridTooLarge { shape: shape.to_vec() });
    }

    let grid = Grid::new(shape);
    let ndim = grid.ndim();

    //(1) static capacities, one per forward edge
    let mut capacity = vec![0.0f64; grid.len() * ndim];
    if ndim > 0 {
      capacity.par_chunks_mut(ndim).enumerate().for_each(|(offset, caps)| {
        let coord = grid.coord(offset);
        for (dim, cap) in caps.iter_mut().enumerate() {
          if coord[dim] + 1 < grid.shape()[dim] {
            *cap = sanitise_weight(weight(&coord, dim));
          }
        }
      });
    }

    //(2) per-node storage
    if grid.shape() != self.grid.shape() {
      self.sources.clear();
      self.sinks.clear();
    }
    self.residual = NodeCells::from_fill(0.0, grid.len() * 2 * ndim);
    self.distance = NodeCells::from_fill(INVALID_DISTANCE, grid.len());
    self.timestamp = NodeCells::from_fill(0, grid.len());
    self.flags = NodeCells::from_fill(NodeFlags::free(), grid.len());
    self.capacity = capacity;
    self.grid = grid;

    //(3) mirror capacities into the residuals and mark everything free
    self.reset();
    Ok(())
  }

  /// Same as `init_from_weight_function`, but with precomputed weights. The
  /// slice holds one array per dimension, all with the shape of the grid;
  /// `weights[d][p]` is the capacity of the edge between `p` and its successor
  /// along axis `d` (the last layer along each axis is ignored).
  pub fn init_from_weights<D>(&mut self, weights: &[nd::ArrayView<f64, D>]) -> Result<(), GraphCutError>
  where
    D: nd::Dimension,
  {
    let weights: Vec<nd::ArrayViewD<f64>> = weights.iter().map(|w| w.view().into_dyn()).collect();
    let shape = match weights.first() {
      Some(w) => w.shape().to_vec(),
      None => return Err(GraphCutError::DegenerateGrid { shape: Vec::new() }),
    };
    if weights.len() != shape.len() {
      return Err(GraphCutError::ShapeMismatch {
        expected: vec![shape.len()],
        found: vec![weights.len()],
      });
    }
    if let Some(bad) = weights.iter().find(|w| w.shape() != shape.as_slice()) {
      return Err(GraphCutError::ShapeMismatch { expected: shape, found: bad.shape().to_vec() });
    }
    self.init_from_weight_function(&shape, |coord, dim| weights[dim][coord])
  }

  /// Registers a source-connected node. The node's flags are only touched by
  /// the next run; registering a node invalidates the previous result.
  pub fn add_source_node(&mut self, coord: &[usize]) -> Result<(), GraphCutError> {
    self.check_bounds(coord)?;
    self.sources.push(coord.to_vec());
    self.up_to_date = false;
    Ok(())
  }

  /// Registers a sink-connected node, see `add_source_node`.
  pub fn add_sink_node(&mut self, coord: &[usize]) -> Result<(), GraphCutError> {
    self.check_bounds(coord)?;
    self.sinks.push(coord.to_vec());
    self.up_to_date = false;
    Ok(())
  }

  pub fn clear_terminals(&mut self) {
    self.sources.clear();
    self.sinks.clear();
    self.up_to_date = false;
  }

  fn check_bounds(&self, coord: &[usize]) -> Result<(), GraphCutError> {
    if self.grid.contains(coord) {
      Ok(())
    } else {
      Err(GraphCutError::OutOfBounds { coord: coord.to_vec(), shape: self.grid.shape().to_vec() })
    }
  }

  /// Restores all residual capacities from the static capacity table, which
  /// undoes any flow pushed by a previous run, and puts every node back in the
  /// free set with an invalid distance and a zero timestamp.
  pub fn reset(&mut self) {
    let ndim = self.grid.ndim();
    let this = &*self;
    (0..this.grid.len()).into_par_iter().for_each(|node| {
      let mut flags = NodeFlags::free();
      for dir in Direction::all(ndim) {
        let cap = this.static_capacity(node, dir);
        this.residual.set(node * 2 * ndim + dir.index(), cap);
        flags.set_saturated(dir, cap == 0.0);
      }
      this.flags.set(node, flags);
      this.distance.set(node, INVALID_DISTANCE);
      this.timestamp.set(node, 0);
    });
    self.flow = 0.0;
    self.up_to_date = false;
  }

  /// True iff the node at `coord` ended up in the source set. Only meaningful
  /// after a successful run.
  ///
  /// # Panics
  /// Panics if `coord` lies outside the grid.
  pub fn is_in_segmentation(&self, coord: &[usize]) -> bool {
    self.tree_of(coord) == Some(Tree::Source)
  }

  /// Tree (terminal set) the node at `coord` belongs to, `None` if it is free.
  ///
  /// # Panics
  /// Panics if `coord` lies outside the grid.
  pub fn tree_of(&self, coord: &[usize]) -> Option<Tree> {
    self.flags.get(self.offset_or_panic(coord)).tree()
  }

  /// Boolean source-set mask with the shape of the grid
  pub fn segmentation(&self) -> nd::ArrayD<bool> {
    let mask: Vec<bool> =
      (0..self.grid.len()).into_par_iter().map(|node| self.flags.get(node).tree() == Some(Tree::Source)).collect();
    //Storage is row-major, just like a default ndarray
    nd::ArrayD::from_shape_vec(nd::IxDyn(self.grid.shape()), mask)
      .unwrap_or_else(|_| nd::ArrayD::from_elem(nd::IxDyn(&[0]), false))
  }

  /// Residual capacity of the directed edge leaving `coord` in direction
  /// `dir`. Edges leaving the grid have zero capacity.
  ///
  /// # Panics
  /// Panics if `coord` lies outside the grid.
  pub fn residual(&self, coord: &[usize], dir: Direction) -> f64 {
    let node = self.offset_or_panic(coord);
    if self.grid.neighbour(node, dir).is_some() {
      self.residual_of(node, dir)
    } else {
      0.0
    }
  }

  /// Static capacity of the edge leaving `coord` in direction `dir`.
  ///
  /// # Panics
  /// Panics if `coord` lies outside the grid.
  pub fn capacity(&self, coord: &[usize], dir: Direction) -> f64 {
    self.static_capacity(self.offset_or_panic(coord), dir)
  }

  pub fn shape(&self) -> &[usize] {
    self.grid.shape()
  }

  /// Total flow pushed from the source to the sink by the last run
  pub fn flow(&self) -> f64 {
    self.flow
  }

  pub fn is_up_to_date(&self) -> bool {
    self.up_to_date
  }

  pub fn source_nodes(&self) -> &[Vec<usize>] {
    &self.sources
  }

  pub fn sink_nodes(&self) -> &[Vec<usize>] {
    &self.sinks
  }

  fn offset_or_panic(&self, coord: &[usize]) -> usize {
    match self.grid.checked_offset(coord) {
      Some(offset) => offset,
      None => panic!("coordinate {coord:?} is out of bounds for grid of shape {:?}", self.grid.shape()),
    }
  }

  fn static_capacity(&self, node: usize, dir: Direction) -> f64 {
    let ndim = self.grid.ndim();
    if dir.is_forward() {
      match self.grid.neighbour(node, dir) {
        Some(_) => self.capacity[node * ndim + dir.dim()],
        None => 0.0,
      }
    } else {
      match self.grid.neighbour(node, dir) {
        Some(pred) => self.capacity[pred * ndim + dir.dim()],
        None => 0.0,
      }
    }
  }

  //////////////////////////////////////////////////////////////////////////////
  //                        RUN LIFECYCLE (crate-only)                        //
  //////////////////////////////////////////////////////////////////////////////

  /// Checks the run preconditions without touching any state and returns the
  /// de-duplicated terminal offsets.
  pub(crate) fn validate(&self) -> Result<Terminals, GraphCutError> {
    if self.grid.is_degenerate() {
      return Err(GraphCutError::DegenerateGrid { shape: self.grid.shape().to_vec() });
    }
    if self.sources.is_empty() {
      return Err(GraphCutError::NoSourceNodes);
    }
    if self.sinks.is_empty() {
      return Err(GraphCutError::NoSinkNodes);
    }

    let to_offsets = |coords: &[Vec<usize>]| -> Result<Vec<usize>, GraphCutError> {
      let mut offsets = coords
        .iter()
        .map(|coord| {
          self.grid.checked_offset(coord).ok_or_else(|| GraphCutError::OutOfBounds {
            coord: coord.clone(),
            shape: self.grid.shape().to_vec(),
          })
        })
        .collect::<Result<Vec<usize>, _>>()?;
      offsets.sort_unstable();
      offsets.dedup();
      Ok(offsets)
    };
    let sources = to_offsets(&self.sources)?;
    let sinks = to_offsets(&self.sinks)?;

    let source_set: HashSet<usize> = sources.iter().copied().collect();
    if let Some(&both) = sinks.iter().find(|node| source_set.contains(node)) {
      return Err(GraphCutError::OverlappingTerminals { coord: self.grid.coord(both) });
    }

    Ok(Terminals { sources, sinks })
  }

  /// Makes every terminal the active root of its tree
  pub(crate) fn seed_terminals(&self, terminals: &Terminals) {
    let seed = |node: usize, tree: Tree| {
      self.update_flags(node, |flags| {
        flags.join_tree(tree);
        flags.clear_parent();
        flags.set_root(true);
        flags.set_active(true);
      });
      self.set_distance(node, 0);
      self.set_timestamp(node, INITIAL_TIME);
    };
    terminals.sources.iter().for_each(|&node| seed(node, Tree::Source));
    terminals.sinks.iter().for_each(|&node| seed(node, Tree::Sink));
  }

  /// Restamps the final set membership of every terminal and marks the result
  /// as up to date.
  pub(crate) fn finalise(&mut self, terminals: &Terminals, flow: f64) {
    let stamp = |node: usize, tree: Tree| {
      self.update_flags(node, |flags| {
        flags.join_tree(tree);
        flags.clear_parent();
        flags.set_orphan(false);
        flags.set_root(true);
      })
    };
    terminals.sources.iter().for_each(|&node| stamp(node, Tree::Source));
    terminals.sinks.iter().for_each(|&node| stamp(node, Tree::Sink));
    self.flow = flow;
    self.up_to_date = true;
  }

  //////////////////////////////////////////////////////////////////////////////
  //                        NODE ACCESS (crate-only)                          //
  //////////////////////////////////////////////////////////////////////////////

  #[inline(always)]
  pub(crate) fn grid(&self) -> &Grid {
    &self.grid
  }

  #[inline(always)]
  pub(crate) fn node_flags(&self, node: usize) -> NodeFlags {
    self.flags.get(node)
  }

  #[inline(always)]
  pub(crate) fn update_flags(&self, node: usize, update: impl FnOnce(&mut NodeFlags)) {
    let mut flags = self.flags.get(node);
    update(&mut flags);
    self.flags.set(node, flags);
  }

  #[inline(always)]
  pub(crate) fn residual_of(&self, node: usize, dir: Direction) -> f64 {
    self.residual.get(node * 2 * self.grid.ndim() + dir.index())
  }

  /// Stores a residual capacity and keeps the cached saturation bit in sync
  #[inline(always)]
  pub(crate) fn set_residual_of(&self, node: usize, dir: Direction, value: f64) {
    self.residual.set(node * 2 * self.grid.ndim() + dir.index(), value);
    self.update_flags(node, |flags| flags.set_saturated(dir, value == 0.0));
  }

  #[inline(always)]
  pub(crate) fn distance(&self, node: usize) -> u32 {
    self.distance.get(node)
  }

  #[inline(always)]
  pub(crate) fn set_distance(&self, node: usize, distance: u32) {
    self.distance.set(node, distance)
  }

  #[inline(always)]
  pub(crate) fn timestamp(&self, node: usize) -> u64 {
    self.timestamp.get(node)
  }

  #[inline(always)]
  pub(crate) fn set_timestamp(&self, node: usize, timestamp: u64) {
    self.timestamp.set(node, timestamp)
  }
}
