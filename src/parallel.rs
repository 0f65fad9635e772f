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

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rayon::prelude::*;

use crate::block::{Block, BlockIds, BoundaryEdge, CellLayout};
use crate::solver::{Solver, SolverReport};
use crate::state::GraphState;
use crate::{GraphCut, GraphCutError, RunSummary, BLOCK_SIZE, NUM_THREADS};

/// Block-parallel graph cut.
///
/// The grid is split into macro-cells of a fixed size, each of which starts out
/// as its own block. Running the graph cut happens in four phases:
/// 1. **setup**: the terminal lists are validated and every terminal becomes
/// the active root of its tree.
/// 2. **partition**: the max-flow solver runs on every block independently and
/// in parallel. Augmenting paths that cross a block boundary cannot be found
/// yet.
/// 3. **scoring**: every boundary between two blocks gets a score equal to the
/// number of node pairs across it that sit in different, non-free trees. The
/// boundaries are sorted by score, highest first.
/// 4. **merging**: a pool of worker threads repeatedly picks the first boundary
/// whose two blocks are both idle, merges the two blocks into one locked block,
/// re-activates the tree nodes along the boundary and resumes the solver on the
/// merged block. Merging stops once no boundaries are left, at which point a
/// single block owns the whole grid.
///
/// The segmentation is identical to that of a single solver run over the whole
/// grid (see `SequentialGraphCut`), the order of the merges only changes how
/// the work is spread over the threads.
///
/// # Memory usage
/// Apart from the graph state itself, the orchestrator allocates one
/// macro-cell index per node and one ownership mask (one `bool` per macro-cell)
/// per live block.
#[derive(Debug)]
pub struct ParallelGraphCut {
  graph: GraphState,
  block_size: Vec<usize>,
  num_threads: usize,
  ids: BlockIds,
  summary: Option<RunSummary>,
  #[cfg(feature = "plots")]
  pub(crate) plot_path: Option<std::path::PathBuf>,
}

impl Default for ParallelGraphCut {
  fn default() -> Self {
    Self::new()
  }
}

impl ParallelGraphCut {
  /// Creates a graph cut with the default `BLOCK_SIZE` and `NUM_THREADS`
  pub fn new() -> Self {
    Self::with_config(&BLOCK_SIZE, NUM_THREADS)
  }

  /// Creates a graph cut with a custom macro-cell size and worker count. Missing
  /// block size entries fall back to `BLOCK_SIZE`, zeros are treated as one.
  pub fn with_config(block_size: &[usize], num_threads: usize) -> Self {
    ParallelGraphCut {
      graph: GraphState::new(),
      block_size: block_size.to_vec(),
      num_threads: num_threads.max(1),
      ids: BlockIds::new(),
      summary: None,
      #[cfg(feature = "plots")]
      plot_path: None,
    }
  }

  /// Id the next block will be created with. Equal to the number of blocks the
  /// last run created, and zero after a reset.
  pub fn next_block_id(&self) -> usize {
    self.ids.peek()
  }

  fn cell_shape(&self, ndim: usize) -> Vec<usize> {
    (0..ndim).map(|dim| self.block_size.get(dim).copied().unwrap_or(BLOCK_SIZE[dim])).collect()
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                MERGE QUEUE                                 //
////////////////////////////////////////////////////////////////////////////////

/// Work item of the merging phase: a freshly merged (and locked) block plus the
/// boundaries that were merged away.
struct Job {
  block: Block,
  seams: Vec<BoundaryEdge>,
}

enum Claim {
  Work(Job),
  /// Every remaining boundary touches a block that is being solved
  Busy,
  Done,
}

/// Everything the merging workers share. Guarded by a single mutex.
struct MergeQueue {
  edges: Vec<BoundaryEdge>,
  blocks: HashMap<usize, Block>,
  ids: BlockIds,
  merges: usize,
  flow: f64,
  augmentations: usize,
  /// Set when a worker died, the remaining workers stop claiming
  aborted: bool,
}

impl MergeQueue {
  fn is_idle(&self, id: usize) -> bool {
    self.blocks.get(&id).map_or(false, |block| !block.is_locked())
  }

  fn claim(&mut self) -> Claim {
    if self.aborted || self.edges.is_empty() {
      return Claim::Done;
    }

    //(1) highest scoring boundary between two idle blocks
    let Some(pos) = self.edges.iter().position(|e| self.is_idle(e.blocks.0) && self.is_idle(e.blocks.1)) else {
      return Claim::Busy;
    };
    let (a, b) = self.edges[pos].blocks;

    //(2) every boundary between the pair disappears with the merge
    let (seams, rest): (Vec<BoundaryEdge>, Vec<BoundaryEdge>) =
      std::mem::take(&mut self.edges).into_iter().partition(|e| e.connects(a, b));
    self.edges = rest;

    //(3) retire the pair, the merged block stays locked until released
    let (Some(left), Some(right)) = (self.blocks.remove(&a), self.blocks.remove(&b)) else {
      return Claim::Done;
    };
    let mut merged = left.join(&right, &mut self.ids);
    merged.lock();
    let id = merged.id();
    self.edges.iter_mut().for_each(|e| {
      e.relabel(a, id);
      e.relabel(b, id);
    });
    self.blocks.insert(id, merged.clone());
    self.merges += 1;

    Claim::Work(Job { block: merged, seams })
  }

  fn release(&mut self, id: usize, report: SolverReport) {
    if let Some(block) = self.blocks.get_mut(&id) {
      block.set_timestamp(report.time);
      block.unlock();
    }
    self.flow += report.flow;
    self.augmentations += report.augmentations;
  }
}

fn lock(queue: &Mutex<MergeQueue>) -> MutexGuard<'_, MergeQueue> {
  queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held by every merging worker. A worker that panics halfway through a merge
/// leaves its block locked, so the queue is shut down for everyone else.
struct AbortOnPanic<'q>(&'q Mutex<MergeQueue>);

impl Drop for AbortOnPanic<'_> {
  fn drop(&mut self) {
    if std::thread::panicking() {
      lock(self.0).aborted = true;
    }
  }
}

/// Number of node pairs across `edge` that sit in two different trees
fn score(state: &GraphState, edge: &BoundaryEdge) -> usize {
  edge
    .pairs(state.grid())
    .into_iter()
    .filter(|&(p, q)| {
      let (tp, tq) = (state.node_flags(p).tree(), state.node_flags(q).tree());
      tp.is_some() && tq.is_some() && tp != tq
    })
    .count()
}

/// Marks the tree nodes along merged boundaries active again wherever the two
/// sides disagree, and returns them as solver seeds.
fn reactivate(state: &GraphState, seams: &[BoundaryEdge]) -> Vec<usize> {
  seams
    .par_iter()
    .flat_map_iter(|seam| seam.pairs(state.grid()))
    .flat_map_iter(|(p, q)| {
      let (tp, tq) = (state.node_flags(p).tree(), state.node_flags(q).tree());
      let disagree = tp != tq;
      [(p, tp), (q, tq)].into_iter().filter_map(move |(node, tree)| {
        if disagree && tree.is_some() {
          state.update_flags(node, |f| f.set_active(true));
          Some(node)
        } else {
          None
        }
      })
    })
    .collect()
}

////////////////////////////////////////////////////////////////////////////////
//                                 GRAPH CUT                                  //
////////////////////////////////////////////////////////////////////////////////

impl GraphCut for ParallelGraphCut {
  fn graph(&self) -> &GraphState {
    &self.graph
  }

  fn graph_mut(&mut self) -> &mut GraphState {
    self.summary = None;
    &mut self.graph
  }

  fn on_reset(&mut self) {
    self.ids.reset();
    self.summary = None;
  }

  fn run(&mut self) -> Result<RunSummary, GraphCutError> {
    if let (true, Some(summary)) = (self.graph.is_up_to_date(), self.summary) {
      return Ok(summary);
    }

    //(logging) make a new perfreport
    #[cfg(feature = "debug")]
    let mut perf = crate::performance_monitoring::PerfReport::default();
    #[cfg(feature = "debug")]
    let run_start = std::time::Instant::now();

    /*(0) Setup
      Preconditions are checked before anything is reset, a failed run leaves
      the result of the previous run alone.
    */
    let terminals = match self.graph.validate() {
      Ok(terminals) => terminals,
      Err(err) => {
        #[cfg(feature = "debug")]
        println!("graph cut aborted: {err}");
        return Err(err);
      }
    };
    self.reset();
    self.graph.seed_terminals(&terminals);
    let cell_shape = self.cell_shape(self.graph.grid().ndim());
    let layout = CellLayout::new(self.graph.grid(), &cell_shape);
    let mut ids = std::mem::take(&mut self.ids);

    #[cfg(feature = "debug")]
    {
      perf.setup_ms = run_start.elapsed().as_millis() as usize;
      println!(
        "partitioning grid {:?} into {:?} macro-cells of {:?} ({} candidate boundaries)",
        self.graph.shape(),
        layout.cells_per_dim(),
        layout.cell_shape(),
        layout.count_adjacent_pairs()
      );
    }

    /*(1) Partition
      One block per macro-cell. Blocks own disjoint node sets, so all solvers
      can run at the same time.
    */
    #[cfg(feature = "debug")]
    let phase_start = std::time::Instant::now();

    let mut blocks: Vec<Block> = (0..layout.num_cells()).map(|cell| Block::single(&mut ids, &layout, cell)).collect();
    let mut seeds: Vec<Vec<usize>> = vec![Vec::new(); layout.num_cells()];
    terminals.all().for_each(|node| seeds[layout.cell_of(node)].push(node));

    let state = &self.graph;
    let reports: Vec<SolverReport> = blocks
      .par_iter()
      .zip(seeds.into_par_iter())
      .map(|(block, seeds)| Solver::new(state, &layout, block).resume(seeds).run())
      .collect();

    let mut flow = 0.0;
    let mut augmentations = 0;
    for (block, report) in blocks.iter_mut().zip(&reports) {
      block.set_timestamp(report.time);
      flow += report.flow;
      augmentations += report.augmentations;
    }

    #[cfg(feature = "debug")]
    {
      perf.partition_ms = phase_start.elapsed().as_millis() as usize;
      perf.partition_flow = flow;
    }

    //(2) Scoring
    #[cfg(feature = "debug")]
    let phase_start = std::time::Instant::now();

    let mut edges = layout.boundary_edges(|cell| blocks[cell].id());
    edges.par_iter_mut().for_each(|edge| edge.score = score(state, edge));
    edges.sort_by(|a, b| b.score.cmp(&a.score));
    let boundary_edges = edges.len();

    #[cfg(feature = "debug")]
    {
      perf.scoring_ms = phase_start.elapsed().as_millis() as usize;
      perf.boundary_edges = boundary_edges;
      perf.scored_pairs = edges.iter().map(|e| e.score).sum();
    }

    /*(3) Merging
      Workers take turns at the queue. Whoever claims a boundary owns the merged
      block until it releases it, nobody else can merge into it meanwhile.
    */
    #[cfg(feature = "debug")]
    let phase_start = std::time::Instant::now();

    #[cfg(feature = "progress")]
    let bar = crate::set_up_bar(boundary_edges as u64);

    let queue = Mutex::new(MergeQueue {
      edges,
      blocks: blocks.into_iter().map(|block| (block.id(), block)).collect(),
      ids,
      merges: 0,
      flow: 0.0,
      augmentations: 0,
      aborted: false,
    });

    std::thread::scope(|scope| {
      let workers: Vec<_> = (0..self.num_threads)
        .map(|_| {
          let (queue, layout) = (&queue, &layout);
          #[cfg(feature = "progress")]
          let bar = bar.clone();
          scope.spawn(move || {
            let _abort = AbortOnPanic(queue);
            loop {
              let claim = lock(queue).claim();
              match claim {
                Claim::Done => break,
                Claim::Busy => std::thread::yield_now(),
                Claim::Work(job) => {
                  let seeds = reactivate(state, &job.seams);
                  let report = Solver::new(state, layout, &job.block).resume(seeds).run();
                  lock(queue).release(job.block.id(), report);
                  #[cfg(feature = "progress")]
                  bar.inc(job.seams.len() as u64);
                }
              }
            }
          })
        })
        .collect();
      for worker in workers {
        if let Err(panic) = worker.join() {
          std::panic::resume_unwind(panic);
        }
      }
    });

    let queue = queue.into_inner().unwrap_or_else(PoisonError::into_inner);
    flow += queue.flow;
    augmentations += queue.augmentations;
    self.ids = queue.ids;

    #[cfg(feature = "progress")]
    bar.finish_and_clear();

    #[cfg(feature = "debug")]
    {
      perf.merge_ms = phase_start.elapsed().as_millis() as usize;
      perf.merges = queue.merges;
      perf.blocks_created = self.ids.peek();
    }

    //(4) Finalise
    self.graph.finalise(&terminals, flow);
    let summary = RunSummary {
      flow,
      augmentations,
      blocks_created: self.ids.peek(),
      merges: queue.merges,
      boundary_edges,
    };
    self.summary = Some(summary);

    #[cfg(feature = "plots")]
    if let Some(ref path) = self.plot_path {
      crate::plotting::plot_segmentation(&self.graph, &path.join("segmentation.png"));
    }

    //(logging) print performance report
    #[cfg(feature = "debug")]
    {
      perf.flow = flow;
      perf.total_ms = run_start.elapsed().as_millis() as usize;
      println!("{perf}");
    }

    Ok(summary)
  }
}
