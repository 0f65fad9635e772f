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

//! Incremental augmenting-path max-flow (grow / augment / adopt) on the nodes
//! owned by a single block.
//!
//! The solver keeps two search trees, one hanging off the source terminals and
//! one off the sink terminals. Active nodes grow their tree into free
//! neighbours until the two trees touch, the path through the contact point is
//! saturated and the nodes cut off by the saturated edges are re-attached or
//! released. Trees persist in the graph state between runs, so a later run on
//! a larger block picks up exactly where the smaller blocks stopped.

use std::collections::VecDeque;

use crate::block::{Block, CellLayout};
use crate::flags::Tree;
use crate::grid::Direction;
use crate::state::{GraphState, INVALID_DISTANCE};

/// Contact point between the two trees: `source_side` and `sink_side` are
/// neighbours, `dir` points from the former to the latter.
#[derive(Debug, Clone, Copy)]
struct Bridge {
  source_side: usize,
  sink_side: usize,
  dir: Direction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct SolverReport {
  pub flow: f64,
  pub augmentations: usize,
  /// Value of the block clock after the run
  pub time: u64,
}

pub(crate) struct Solver<'g> {
  state: &'g GraphState,
  layout: &'g CellLayout,
  block: &'g Block,
  active: VecDeque<usize>,
  orphans: VecDeque<usize>,
  time: u64,
  flow: f64,
  augmentations: usize,
}

impl<'g> Solver<'g> {
  pub fn new(state: &'g GraphState, layout: &'g CellLayout, block: &'g Block) -> Self {
    Solver {
      state,
      layout,
      block,
      active: VecDeque::new(),
      orphans: VecDeque::new(),
      time: block.timestamp(),
      flow: 0.0,
      augmentations: 0,
    }
  }

  /// Queues the nodes the search starts from. Only tree nodes owned by the
  /// block that carry the active flag are taken.
  pub fn resume(mut self, seeds: impl IntoIterator<Item = usize>) -> Self {
    for node in seeds {
      let flags = self.state.node_flags(node);
      if self.is_valid(node) && flags.is_active() && flags.tree().is_some() {
        self.active.push_back(node);
      }
    }
    self
  }

  pub fn run(mut self) -> SolverReport {
    while let Some(bridge) = self.grow() {
      if self.augment(bridge) {
        self.adopt();
      } else {
        break;
      }
    }
    SolverReport { flow: self.flow, augmentations: self.augmentations, time: self.time }
  }

  #[inline(always)]
  fn is_valid(&self, node: usize) -> bool {
    self.block.owns_node(self.layout, node)
  }

  fn activate(&mut self, node: usize) {
    if !self.state.node_flags(node).is_active() {
      self.state.update_flags(node, |f| f.set_active(true));
      self.active.push_back(node);
    }
  }

  fn make_orphan(&mut self, node: usize) {
    self.state.update_flags(node, |f| {
      f.clear_parent();
      f.set_orphan(true);
    });
    self.orphans.push_back(node);
  }

  /// True if the tree `tree` may use the edge between `from` (a tree node) and
  /// its neighbour `to` in direction `dir`. Source trees push flow outwards,
  /// sink trees pull it inwards.
  #[inline(always)]
  fn is_open(&self, tree: Tree, from: usize, to: usize, dir: Direction) -> bool {
    match tree {
      Tree::Source => self.state.residual_of(from, dir) > 0.0,
      Tree::Sink => self.state.residual_of(to, dir.opposite()) > 0.0,
    }
  }

  ////////////////////////////////////////////////////////////////////////////
  //                                  GROW                                  //
  ////////////////////////////////////////////////////////////////////////////

  fn grow(&mut self) -> Option<Bridge> {
    let state = self.state;
    let grid = state.grid();

    while let Some(p) = self.active.pop_front() {
      let flags_p = state.node_flags(p);
      if !flags_p.is_active() {
        continue;
      }
      let Some(tree) = flags_p.tree() else {
        state.update_flags(p, |f| f.set_active(false));
        continue;
      };

      for dir in Direction::all(grid.ndim()) {
        let Some(q) = grid.neighbour(p, dir) else { continue };
        if !self.is_valid(q) {
          continue;
        }
        let flags_q = state.node_flags(q);
        let open = match tree {
          Tree::Source => !flags_p.is_saturated(dir),
          Tree::Sink => !flags_q.is_saturated(dir.opposite()),
        };
        if !open {
          continue;
        }

        match flags_q.tree() {
          None => {
            //Claim the free neighbour
            state.update_flags(q, |f| {
              f.join_tree(tree);
              f.set_parent(dir.opposite());
            });
            state.set_distance(q, state.distance(p).saturating_add(1));
            state.set_timestamp(q, state.timestamp(p));
            self.activate(q);
          }
          Some(other) if other != tree => {
            //The trees touch: keep p around for the next round
            self.active.push_front(p);
            return Some(match tree {
              Tree::Source => Bridge { source_side: p, sink_side: q, dir },
              Tree::Sink => Bridge { source_side: q, sink_side: p, dir: dir.opposite() },
            });
          }
          Some(_) => {
            //Shortcut q through p if that brings it closer to its terminal
            if !flags_q.is_root()
              && flags_q.is_connected()
              && state.timestamp(q) <= state.timestamp(p)
              && state.distance(q) > state.distance(p)
            {
              state.update_flags(q, |f| f.set_parent(dir.opposite()));
              state.set_timestamp(q, state.timestamp(p));
              state.set_distance(q, state.distance(p).saturating_add(1));
            }
          }
        }
      }
      state.update_flags(p, |f| f.set_active(false));
    }
    None
  }

  ////////////////////////////////////////////////////////////////////////////
  //                                AUGMENT                                 //
  ////////////////////////////////////////////////////////////////////////////

  /// Smallest residual capacity along the tree path from `node` to its root.
  /// `None` if the walk does not end at a root.
  fn path_bottleneck(&self, mut node: usize, tree: Tree, mut bottleneck: f64) -> Option<f64> {
    let state = self.state;
    loop {
      let flags = state.node_flags(node);
      if flags.is_root() {
        return Some(bottleneck);
      }
      let dir = flags.parent()?;
      let parent = state.grid().neighbour(node, dir)?;
      let residual = match tree {
        Tree::Source => state.residual_of(parent, dir.opposite()),
        Tree::Sink => state.residual_of(node, dir),
      };
      bottleneck = bottleneck.min(residual);
      node = parent;
    }
  }

  /// Moves `amount` of flow over the edge leaving `from` in direction `dir`
  /// and returns the residual left in that direction.
  #[inline(always)]
  fn push(&self, from: usize, to: usize, dir: Direction, amount: f64) -> f64 {
    let state = self.state;
    let left = state.residual_of(from, dir) - amount;
    let left = if left > 0.0 { left } else { 0.0 };
    state.set_residual_of(from, dir, left);
    state.set_residual_of(to, dir.opposite(), state.residual_of(to, dir.opposite()) + amount);
    left
  }

  fn augment(&mut self, bridge: Bridge) -> bool {
    let state = self.state;
    let grid = state.grid();
    let Bridge { source_side, sink_side, dir } = bridge;

    //(1) bottleneck over the whole path
    let middle = state.residual_of(source_side, dir);
    let bottleneck = self
      .path_bottleneck(source_side, Tree::Source, middle)
      .and_then(|b| self.path_bottleneck(sink_side, Tree::Sink, b));
    let amount = match bottleneck {
      Some(amount) if amount > 0.0 => amount,
      _ => return false,
    };

    //(2) push it through
    self.push(source_side, sink_side, dir, amount);

    let mut node = source_side;
    while let Some(up) = state.node_flags(node).parent() {
      let Some(parent) = grid.neighbour(node, up) else { break };
      if self.push(parent, node, up.opposite(), amount) == 0.0 {
        self.make_orphan(node);
      }
      node = parent;
    }

    let mut node = sink_side;
    while let Some(up) = state.node_flags(node).parent() {
      let Some(parent) = grid.neighbour(node, up) else { break };
      if self.push(node, parent, up, amount) == 0.0 {
        self.make_orphan(node);
      }
      node = parent;
    }

    self.flow += amount;
    self.augmentations += 1;
    true
  }

  ////////////////////////////////////////////////////////////////////////////
  //                                 ADOPT                                  //
  ////////////////////////////////////////////////////////////////////////////

  /// Distance from `start` to the root of its tree, or `None` if the walk runs
  /// into an orphan. Every node on a successful walk is stamped with the current
  /// time, so later walks can stop early.
  fn origin_distance(&self, start: usize) -> Option<u32> {
    let state = self.state;
    let grid = state.grid();

    let mut node = start;
    let mut steps = 0u32;
    let total = loop {
      if state.timestamp(node) == self.time {
        break steps.saturating_add(state.distance(node));
      }
      let flags = state.node_flags(node);
      if flags.is_root() {
        state.set_timestamp(node, self.time);
        state.set_distance(node, 0);
        break steps;
      }
      if flags.is_orphan() {
        return None;
      }
      node = grid.neighbour(node, flags.parent()?)?;
      steps += 1;
    };

    //Cache the distances along the path we just verified
    let mut node = start;
    let mut dist = total;
    while state.timestamp(node) != self.time {
      state.set_timestamp(node, self.time);
      state.set_distance(node, dist);
      dist = dist.saturating_sub(1);
      let Some(next) = state.node_flags(node).parent().and_then(|dir| grid.neighbour(node, dir)) else {
        break;
      };
      node = next;
    }
    Some(total)
  }

  fn adopt(&mut self) {
    let state = self.state;
    let grid = state.grid();
    self.time += 1;

    while let Some(orphan) = self.orphans.pop_front() {
      let Some(tree) = state.node_flags(orphan).tree() else { continue };

      //(1) look for the closest connected neighbour that can take the orphan
      let mut best: Option<(Direction, u32)> = None;
      for dir in Direction::all(grid.ndim()) {
        let Some(j) = grid.neighbour(orphan, dir) else { continue };
        if !self.is_valid(j) {
          continue;
        }
        let flags_j = state.node_flags(j);
        if flags_j.tree() != Some(tree) || !flags_j.is_connected() {
          continue;
        }
        if !self.is_open(tree, j, orphan, dir.opposite()) {
          continue;
        }
        if let Some(dist) = self.origin_distance(j) {
          if best.map_or(true, |(_, d)| dist < d) {
            best = Some((dir, dist));
          }
        }
      }

      if let Some((dir, dist)) = best {
        state.update_flags(orphan, |f| {
          f.set_parent(dir);
          f.set_orphan(false);
        });
        state.set_timestamp(orphan, self.time);
        state.set_distance(orphan, dist.saturating_add(1));
        continue;
      }

      //(2) nobody can: release the orphan and everything hanging off it
      for dir in Direction::all(grid.ndim()) {
        let Some(j) = grid.neighbour(orphan, dir) else { continue };
        if !self.is_valid(j) {
          continue;
        }
        let flags_j = state.node_flags(j);
        if flags_j.tree() != Some(tree) || !flags_j.is_connected() {
          continue;
        }
        if self.is_open(tree, j, orphan, dir.opposite()) {
          self.activate(j);
        }
        if flags_j.parent() == Some(dir.opposite()) {
          self.make_orphan(j);
        }
      }
      state.update_flags(orphan, |f| f.make_free());
      state.set_distance(orphan, INVALID_DISTANCE);
    }
  }
}
