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

#![doc(
  html_logo_url = "https://raw.githubusercontent.com/smups/rustronomy/main/logos/Rustronomy_ferris.png?raw=true"
)]
//! Rustronomy-graphcut is a pure-rust, block-parallel implementation of the
//! min-cut/max-flow image segmentation algorithm of Boykov & Kolmogorov[^1] for
//! images (or other regular grids) with up to four dimensions.
//!
//! # Features
//! The image is treated as a grid graph: every pixel is a node, and every pair
//! of axis-neighbouring pixels is connected by an edge whose capacity is
//! usually derived from the intensity difference between the two pixels. Some
//! pixels are marked as belonging to the foreground (the *source*) and some as
//! belonging to the background (the *sink*). The graph cut then finds the
//! cheapest set of edges that separates the two, and returns the foreground
//! segment as a boolean mask.
//!
//! Two versions of the algorithm are included in this crate.
//! 1. The *parallel* graph cut splits the grid in blocks, solves all blocks at
//! the same time and then merges neighbouring blocks until the whole grid is
//! solved. This is the version you want for large images.
//! 2. The *sequential* graph cut solves the whole grid in one go. It produces
//! the exact same segmentation and is mostly useful as a reference.
//!
//! In addition, `rustronomy-graphcut` provides extra functionality which can be
//! accessed via cargo feature gates. A list of all additional features [can be found
//! below](#cargo-feature-gates).
//!
//! # Quickstart
//! To use the latest release of rustronomy-graphcut in a cargo project, add
//! the rustronomy-graphcut crate as a dependency to your `Cargo.toml` file:
//! ```toml
//! [dependencies]
//! rustronomy-graphcut = "0.1.0"
//! ```
//! If you want to use the latest (unstable) development version of
//! rustronomy-graphcut, you can do so by using the `git` field (which fetches
//! the latest version from the repo) rather than the `version` field
//! (which downloads the latest released version from crates.io).
//! ```toml
//! {git = "https://github.com/smups/rustronomy-graphcut"}
//! ```
//!
//! ## Short example: segmenting a random field
//! `rustronomy-graphcut` uses the commonly used "builder pattern" to configure
//! the graph cut before executing it. To configure a graph cut, create an instance
//! of the `GraphCutBuilder` struct. Once you are done specifying options, call the
//! `build()` function to generate a (`Sync`&`Send`) graph cut object.
//! ```rust
//! use rustronomy_graphcut::prelude::*;
//! use ndarray_rand::{rand_distr::Uniform, RandomExt};
//!
//! //Create a random uniform distribution
//! let rf = nd::Array2::<f64>::random((128, 128), Uniform::new(0.0, 1.0));
//! //Set-up the graph cut
//! let mut cut = GraphCutBuilder::new_parallel().build().unwrap();
//! let range = cut.intensity_range(rf.view()).unwrap();
//! cut.init_from_image(rf.view(), range, exponential_decay(10.0)).unwrap();
//! //Mark a foreground and a background pixel
//! cut.add_source_node(&[64, 64]).unwrap();
//! cut.add_sink_node(&[0, 0]).unwrap();
//! //Execute the graph cut
//! let summary = cut.run().unwrap();
//! let foreground = cut.segmentation();
//! assert!(foreground[[64, 64].as_slice()]);
//! println!("cut capacity: {}", summary.flow);
//! ```
//! [^1]: Y. Boykov and V. Kolmogorov. **An experimental comparison of min-cut/max-flow algorithms for energy minimization in vision.** *IEEE Transactions on Pattern Analysis and Machine Intelligence*, 26(9):1124-1137, September 2004.
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! From the jemalloc website: *"jemalloc is a general purpose `malloc`(3)
//! implementation that emphasizes fragmentation avoidance and scalable concurrency
//! support."*. Jemalloc is enabled though usage of the `jemalloc` crate, which
//! increases compile times considerably. To compile `rustronomy-graphcut` with the
//! `jemalloc` feature, jemalloc must be installed on the host system.
//! - `plots`: with this feature enabled, `rustronomy-graphcut` will write a plot
//! of the segmentation of 2D grids after each run. Plotting support adds the
//! `plotters` crate as a dependency, which increases compile times and requires
//! the installation of some packages on linux systems,
//! [see the `plotters` documentation for details](https://docs.rs/plotters/).
//! - `progress`: this feature enables a progress bar for the block merging phase
//! of the parallel graph cut. Enabling this feature adds the `indicatif` crate as
//! a dependency, which should not considerably slow down compile times.
//! - `debug`: this feature enables debug and performance monitoring output. This
//! can negatively impact performance. Enabling this feature does not add additional
//! dependencies.
//!
//! ## `plots` feature gate
//! Enabling the `plots` feature gate adds the `set_plot_folder` method to the
//! `GraphCutBuilder` struct, which can be used to specify the folder where the
//! generated images should be placed. If no output folder is specified when the
//! `plots` feature is enabled, no plots will be generated (code will still compile).

//Unconditional imports
use ndarray as nd;
use num_traits::ToPrimitive;

use crate::block::{Block, BlockIds, CellLayout};
use crate::solver::Solver;
use crate::state::GraphState;

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

pub mod block;
pub mod flags;
pub mod grid;
mod parallel;
mod solver;
pub mod state;

pub use parallel::ParallelGraphCut;

/// Default macro-cell size of the parallel graph cut, per dimension
pub const BLOCK_SIZE: [usize; grid::MAX_DIMS] = [64, 64, 16, 8];

/// Default number of worker threads used to merge blocks
pub const NUM_THREADS: usize = 8;

//Utility prelude for batch import
pub mod prelude {
  pub use crate::{
    exponential_decay, GraphCut, GraphCutBuilder, GraphCutError, GraphCutUtils, ParallelGraphCut,
    RunSummary, SequentialGraphCut,
  };
  pub use crate::flags::Tree;
  pub use crate::grid::Direction;
  pub use ndarray as nd;
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "progress")]
fn set_up_bar(boundaries: u64) -> indicatif::ProgressBar {
  const TEMPLATE: &str = "{spinner}[{elapsed}/{duration}] merged boundaries {pos}/{len}{bar:60}";
  let bar = indicatif::ProgressBar::new(boundaries);
  if let Ok(style) = indicatif::ProgressStyle::with_template(TEMPLATE) {
    bar.set_style(style);
  }
  bar
}

/// Weight function for `GraphCutUtils::init_from_image`: the capacity of an
/// edge decays exponentially with the (normalised) intensity difference across
/// it. Larger tolerances make the cut follow weaker edges in the image.
pub fn exponential_decay(tolerance: f64) -> impl Fn(f64) -> f64 + Copy + Send + Sync {
  move |delta: f64| (-tolerance * delta.abs()).exp()
}

////////////////////////////////////////////////////////////////////////////////
//                             OPTIONAL MODULES                               //
////////////////////////////////////////////////////////////////////////////////
#[cfg(feature = "debug")]
mod performance_monitoring {

  #[derive(Clone, Debug, Default)]
  pub struct PerfReport {
    pub setup_ms: usize,
    pub partition_ms: usize,
    pub partition_flow: f64,
    pub scoring_ms: usize,
    pub boundary_edges: usize,
    pub scored_pairs: usize,
    pub merge_ms: usize,
    pub merges: usize,
    pub blocks_created: usize,
    pub flow: f64,
    pub total_ms: usize,
  }

  impl PerfReport {
    pub fn phase_total(&self) -> usize {
      self.setup_ms + self.partition_ms + self.scoring_ms + self.merge_ms
    }
  }

  impl std::fmt::Display for PerfReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      writeln!(f, ">---------[Performance Summary]---------")?;
      writeln!(f, ">  Setup: {}ms", self.setup_ms)?;
      writeln!(f, ">  Partition: {}ms; flow {:.3}", self.partition_ms, self.partition_flow)?;
      writeln!(
        f,
        ">  Scoring: {}ms; {} boundaries, {} crossing pairs",
        self.scoring_ms, self.boundary_edges, self.scored_pairs
      )?;
      writeln!(f, ">  Merging: {}ms; {} merges, {} blocks", self.merge_ms, self.merges, self.blocks_created)?;
      writeln!(f, ">--------------------------------+ total")?;
      writeln!(
        f,
        ">  {}ms with {}ms overhead (Δt); total flow {:.3}",
        self.total_ms,
        self.total_ms.saturating_sub(self.phase_total()),
        self.flow
      )
    }
  }
}

#[cfg(feature = "plots")]
/// This module contains the code required to generate images of segmentations
pub mod plotting {
  use crate::flags::Tree;
  use ndarray as nd;
  use plotters::prelude::*;
  use std::{error::Error, path::Path};

  /// Writes one pixel per node, coloured by the tree the node ended up in
  pub fn plot_trees(
    trees: nd::ArrayView2<'_, Option<Tree>>,
    file_name: &Path,
    colour: fn(Option<Tree>) -> RGBColor,
  ) -> Result<(), Box<dyn Error>> {
    let (width, height) = (trees.shape()[0] as u32, trees.shape()[1] as u32);

    //Blank canvas without axes
    let root = BitMapBackend::new(file_name, (width, height)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root).build_cartesian_2d(0..width, 0..height)?;
    chart.configure_mesh().disable_mesh().disable_axes().draw()?;
    let area = chart.plotting_area();

    for ((x, y), tree) in trees.indexed_iter() {
      area.draw_pixel((x as u32, y as u32), &colour(*tree))?
    }
    root.present()?;

    #[cfg(feature = "debug")]
    println!("tree map saved as png: {file_name:?}");
    Ok(())
  }

  /// Source tree white, sink tree grey, free nodes black
  #[inline(always)]
  pub fn tree_colour(tree: Option<Tree>) -> RGBColor {
    match tree {
      Some(Tree::Source) => WHITE,
      Some(Tree::Sink) => RGBColor(96, 96, 96),
      None => BLACK,
    }
  }

  /// Plots the trees of a 2D graph. Grids of any other dimensionality are
  /// skipped.
  pub(crate) fn plot_segmentation(graph: &crate::state::GraphState, file_name: &Path) {
    let &[width, height] = graph.shape() else {
      #[cfg(feature = "debug")]
      println!("skipping segmentation plot of {}D grid", graph.shape().len());
      return;
    };
    let trees = nd::Array2::from_shape_fn((width, height), |(x, y)| graph.tree_of(&[x, y]));
    if let Err(err) = plot_trees(trees.view(), file_name, tree_colour) {
      println!("Could not make segmentation plot. Error: {err}")
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                  ERRORS                                    //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq)]
/// Everything that can go wrong when setting up or running a graph cut. A run
/// that returns an error has not touched the graph state.
pub enum GraphCutError {
  /// The grid has no dimensions, or a dimension of size zero
  DegenerateGrid { shape: Vec<usize> },
  /// `run` was called without any source-connected node
  NoSourceNodes,
  /// `run` was called without any sink-connected node
  NoSinkNodes,
  OutOfBounds { coord: Vec<usize>, shape: Vec<usize> },
  /// The packed node flags support at most `grid::MAX_DIMS` dimensions
  TooManyDimensions { ndim: usize },
  /// The per-node storage of the grid cannot be addressed with a `usize`
  GridTooLarge { shape: Vec<usize> },
  /// A node was registered as both a source and a sink
  OverlappingTerminals { coord: Vec<usize> },
  ShapeMismatch { expected: Vec<usize>, found: Vec<usize> },
  /// Invalid builder configuration
  Config(String),
}

impl std::fmt::Display for GraphCutError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    use GraphCutError::*;
    match self {
      DegenerateGrid { shape } => write!(f, "cannot cut a grid of shape {shape:?}"),
      NoSourceNodes => write!(f, "no source nodes were specified"),
      NoSinkNodes => write!(f, "no sink nodes were specified"),
      OutOfBounds { coord, shape } => {
        write!(f, "coordinate {coord:?} is out of bounds for grid of shape {shape:?}")
      }
      TooManyDimensions { ndim } => write!(
        f,
        "grids with {ndim} dimensions are not supported (at most {} dimensions)",
        grid::MAX_DIMS
      ),
      GridTooLarge { shape } => write!(f, "grid of shape {shape:?} is too large to address"),
      OverlappingTerminals { coord } => {
        write!(f, "node {coord:?} was registered as both a source and a sink")
      }
      ShapeMismatch { expected, found } => {
        write!(f, "shape mismatch: expected {expected:?}, found {found:?}")
      }
      Config(msg) => write!(f, "invalid graph cut configuration: {msg}"),
    }
  }
}

impl std::error::Error for GraphCutError {}

////////////////////////////////////////////////////////////////////////////////
//                                GRAPH CUTS                                  //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Default)]
/// Builder for configuring a graph cut.
///
/// Use the `new_parallel()` associated function to start configuring a
/// block-parallel graph cut. Use the `new_sequential()` associated function
/// to start configuring a single-threaded reference graph cut. Once you have
/// enabled the desired functionality, a graph cut object can be generated with
/// the `build()` associated function. This returns a trait object of the type
/// `Box<dyn GraphCut + Send + Sync>`, which can be shared between threads.
///
/// Enabling the `plots` feature gate adds the `set_plot_folder` method, which can
/// be used to specify the folder where the generated images should be placed.
pub struct GraphCutBuilder {
  //Plotting options
  #[cfg(feature = "plots")]
  plot_path: Option<std::path::PathBuf>,

  //Basic options
  parallel: bool,
  block_size: Vec<usize>,
  num_threads: usize,
}

impl GraphCutBuilder {
  /// creates a new `GraphCutBuilder` configured for a block-parallel graph cut
  pub fn new_parallel() -> Self {
    GraphCutBuilder {
      #[cfg(feature = "plots")]
      plot_path: None,
      parallel: true,
      block_size: BLOCK_SIZE.to_vec(),
      num_threads: NUM_THREADS,
    }
  }

  /// creates a new `GraphCutBuilder` configured for a sequential graph cut. The
  /// block size and thread count are ignored by the sequential graph cut.
  pub fn new_sequential() -> Self {
    GraphCutBuilder { parallel: false, ..Self::new_parallel() }
  }

  /// Set the size of the macro-cells the grid is split into, one entry per
  /// dimension. Dimensions without an entry use the default `BLOCK_SIZE`.
  pub fn set_block_size(mut self, block_size: &[usize]) -> Self {
    self.block_size = block_size.to_vec();
    self
  }

  /// Set the number of threads that merge blocks concurrently
  pub fn set_num_threads(mut self, num_threads: usize) -> Self {
    self.num_threads = num_threads;
    self
  }

  #[cfg(feature = "plots")]
  /// Set output folder for the images generated by the graph cut. If no output
  /// folder is specified, no images will be generated, even with the `plots`
  /// feature gate enabled.
  pub fn set_plot_folder(mut self, path: &std::path::Path) -> Self {
    self.plot_path = Some(path.to_path_buf());
    self
  }

  /// Build a `Box<dyn GraphCut + Send + Sync>` from the current builder
  /// configuration. This function returns an `Err` result if the block size or
  /// the thread count is unusable.
  #[cfg_attr(not(feature = "plots"), allow(unused_mut))]
  pub fn build(self) -> Result<Box<dyn GraphCut + Send + Sync>, GraphCutError> {
    if self.block_size.len() > grid::MAX_DIMS {
      Err(GraphCutError::Config(format!(
        "block size has {} entries, but at most {} dimensions are supported",
        self.block_size.len(),
        grid::MAX_DIMS
      )))?
    }
    if self.block_size.iter().any(|&size| size == 0) {
      Err(GraphCutError::Config(format!("block size {:?} contains a zero", self.block_size)))?
    }
    if self.num_threads == 0 {
      Err(GraphCutError::Config("number of threads must be at least one".to_string()))?
    }

    if self.parallel {
      let mut cut = ParallelGraphCut::with_config(&self.block_size, self.num_threads);
      #[cfg(feature = "plots")]
      {
        cut.plot_path = self.plot_path;
      }
      Ok(Box::new(cut))
    } else {
      let mut cut = SequentialGraphCut::new();
      #[cfg(feature = "plots")]
      {
        cut.plot_path = self.plot_path;
      }
      Ok(Box::new(cut))
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
/// Statistics of a completed graph cut
pub struct RunSummary {
  /// Total flow from source to sink, equal to the capacity of the cut
  pub flow: f64,
  pub augmentations: usize,
  /// Number of blocks created, including merged ones
  pub blocks_created: usize,
  pub merges: usize,
  /// Number of block boundaries considered for merging
  pub boundary_edges: usize,
}

/// Actual trait for performing the graph cut. It is implemented in different
/// ways by different versions of the algorithm. This trait is dyn-safe, which
/// means that trait objects may be constructed from it.
pub trait GraphCut {
  /// Read access to the graph state
  fn graph(&self) -> &GraphState;

  /// Write access to the graph state. Invalidates the result of the last run.
  fn graph_mut(&mut self) -> &mut GraphState;

  /// Computes the minimum cut between the source and sink nodes. Calling `run`
  /// again without changing the weights or the terminals returns the previous
  /// result without doing any work.
  fn run(&mut self) -> Result<RunSummary, GraphCutError>;

  /// Called after the graph state has been reset, so implementations can clear
  /// their own per-run bookkeeping.
  fn on_reset(&mut self) {}

  /// Undoes the last run: all flow is removed and every node is free again.
  /// Weights and terminals are kept.
  fn reset(&mut self) {
    self.graph_mut().reset();
    self.on_reset();
  }

  /// (Re)allocates the graph for a grid of the given shape, see
  /// `GraphState::init_from_weight_function`.
  fn init_from_weight_function(
    &mut self,
    shape: &[usize],
    weight: &(dyn Fn(&[usize], usize) -> f64 + Sync),
  ) -> Result<(), GraphCutError> {
    self.graph_mut().init_from_weight_function(shape, weight)?;
    self.on_reset();
    Ok(())
  }

  /// (Re)allocates the graph from precomputed weights, see
  /// `GraphState::init_from_weights`.
  fn init_from_weights(&mut self, weights: &[nd::ArrayViewD<f64>]) -> Result<(), GraphCutError> {
    self.graph_mut().init_from_weights(weights)?;
    self.on_reset();
    Ok(())
  }

  fn add_source_node(&mut self, coord: &[usize]) -> Result<(), GraphCutError> {
    self.graph_mut().add_source_node(coord)
  }

  fn add_sink_node(&mut self, coord: &[usize]) -> Result<(), GraphCutError> {
    self.graph_mut().add_sink_node(coord)
  }

  /// True iff the node at `coord` ended up on the source side of the cut.
  ///
  /// # Panics
  /// Panics if `coord` lies outside the grid.
  fn is_in_segmentation(&self, coord: &[usize]) -> bool {
    self.graph().is_in_segmentation(coord)
  }

  /// Boolean mask of the source side of the cut, with the shape of the grid
  fn segmentation(&self) -> nd::ArrayD<bool> {
    self.graph().segmentation()
  }
}

/// This trait contains useful functions for preparing images to be used as input
/// for a graph cut. It is implemented for every `GraphCut`.
pub trait GraphCutUtils: GraphCut {
  /// Returns the smallest and largest finite value in `img`, or `None` if it
  /// holds no finite values at all.
  fn intensity_range<T, D>(&self, img: nd::ArrayView<T, D>) -> Option<(f64, f64)>
  where
    T: ToPrimitive + Copy,
    D: nd::Dimension,
  {
    img
      .iter()
      .filter_map(|x| x.to_f64())
      .filter(|x| x.is_finite())
      .fold(None, |acc, x| match acc {
        None => Some((x, x)),
        Some((min, max)) => Some((f64::min(min, x), f64::max(max, x))),
      })
  }

  /// Sets up the graph for segmenting `img`. Pixel values are first mapped onto
  /// `[0, 1]` using `range` (values outside the range are clamped), then the
  /// capacity of every edge is set to `weight(|ΔI|)` where `ΔI` is the normalised
  /// intensity difference across the edge. Every edge that touches a NaN or
  /// infinite pixel gets zero capacity, whatever `weight` returns.
  fn init_from_image<T, D, W>(
    &mut self,
    img: nd::ArrayView<T, D>,
    range: (f64, f64),
    weight: W,
  ) -> Result<(), GraphCutError>
  where
    T: ToPrimitive + Copy,
    D: nd::Dimension,
    W: Fn(f64) -> f64 + Sync,
  {
    let (min, max) = range;
    let span = max - min;
    let normal: nd::ArrayD<f64> = img.into_dyn().mapv(|x| {
      let x = x.to_f64().filter(|x| x.is_finite()).unwrap_or(f64::NAN);
      if span > 0.0 {
        ((x - min) / span).clamp(0.0, 1.0)
      } else if x.is_nan() {
        x
      } else {
        0.0
      }
    });

    let shape = normal.shape().to_vec();
    let normal = &normal;
    let weight = &weight;
    self.init_from_weight_function(&shape, &move |coord: &[usize], dim: usize| {
      let mut next = coord.to_vec();
      next[dim] += 1;
      let delta = (normal[next.as_slice()] - normal[coord]).abs();
      if delta.is_nan() {
        0.0
      } else {
        weight(delta)
      }
    })
  }

  /// Registers every `true` pixel of `mask` as a source node
  fn add_source_mask<D>(&mut self, mask: nd::ArrayView<bool, D>) -> Result<(), GraphCutError>
  where
    D: nd::Dimension,
  {
    for (idx, _) in mask.into_dyn().indexed_iter().filter(|(_, &px)| px) {
      self.add_source_node(nd::Dimension::slice(&idx))?;
    }
    Ok(())
  }

  /// Registers every `true` pixel of `mask` as a sink node
  fn add_sink_mask<D>(&mut self, mask: nd::ArrayView<bool, D>) -> Result<(), GraphCutError>
  where
    D: nd::Dimension,
  {
    for (idx, _) in mask.into_dyn().indexed_iter().filter(|(_, &px)| px) {
      self.add_sink_node(nd::Dimension::slice(&idx))?;
    }
    Ok(())
  }
}

impl<G: GraphCut + ?Sized> GraphCutUtils for G {}

/// Single-threaded graph cut that solves the whole grid as one block.
///
/// This is the textbook version of the algorithm. It produces the same
/// segmentation as the `ParallelGraphCut` and exists mostly to check the latter
/// against. For small grids it can be faster, since it skips the block
/// bookkeeping altogether.
#[derive(Debug, Default)]
pub struct SequentialGraphCut {
  graph: GraphState,
  summary: Option<RunSummary>,
  #[cfg(feature = "plots")]
  plot_path: Option<std::path::PathBuf>,
}

impl SequentialGraphCut {
  pub fn new() -> Self {
    Self::default()
  }
}

impl GraphCut for SequentialGraphCut {
  fn graph(&self) -> &GraphState {
    &self.graph
  }

  fn graph_mut(&mut self) -> &mut GraphState {
    self.summary = None;
    &mut self.graph
  }

  fn on_reset(&mut self) {
    self.summary = None;
  }

  fn run(&mut self) -> Result<RunSummary, GraphCutError> {
    if let (true, Some(summary)) = (self.graph.is_up_to_date(), self.summary) {
      return Ok(summary);
    }

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

    //A single macro-cell spanning the whole grid
    let layout = CellLayout::new(self.graph.grid(), self.graph.shape());
    let block = Block::whole(&mut BlockIds::new(), &layout);
    let report = Solver::new(&self.graph, &layout, &block).resume(terminals.all()).run();

    self.graph.finalise(&terminals, report.flow);
    let summary = RunSummary {
      flow: report.flow,
      augmentations: report.augmentations,
      blocks_created: 1,
      merges: 0,
      boundary_edges: 0,
    };
    self.summary = Some(summary);

    #[cfg(feature = "plots")]
    if let Some(ref path) = self.plot_path {
      plotting::plot_segmentation(&self.graph, &path.join("segmentation.png"));
    }

    #[cfg(feature = "debug")]
    println!("sequential graph cut: flow {:.3} in {} augmentations", report.flow, report.augmentations);

    Ok(summary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::grid::Direction;

  #[test]
  fn builder_rejects_bad_config() {
    assert!(matches!(
      GraphCutBuilder::new_parallel().set_block_size(&[4, 0]).build(),
      Err(GraphCutError::Config(_))
    ));
    assert!(matches!(
      GraphCutBuilder::new_parallel().set_block_size(&[2; 5]).build(),
      Err(GraphCutError::Config(_))
    ));
    assert!(matches!(
      GraphCutBuilder::new_sequential().set_num_threads(0).build(),
      Err(GraphCutError::Config(_))
    ));
    assert!(GraphCutBuilder::new_parallel().set_block_size(&[8]).set_num_threads(2).build().is_ok());
  }

  #[test]
  fn exponential_decay_is_symmetric() {
    let decay = exponential_decay(2.0);
    assert_eq!(decay(0.0), 1.0);
    assert_eq!(decay(0.5), decay(-0.5));
    assert!(decay(0.1) > decay(0.2));
  }

  #[test]
  fn intensity_range_skips_non_finite_pixels() {
    let cut = SequentialGraphCut::new();
    let img = nd::arr1(&[3.0, f64::NAN, -1.0, f64::INFINITY, 7.5]);
    assert_eq!(cut.intensity_range(img.view()), Some((-1.0, 7.5)));
    let empty = nd::arr1(&[f64::NAN]);
    assert_eq!(cut.intensity_range(empty.view()), None);
  }

  #[test]
  fn image_weights_follow_intensity_steps() {
    let mut cut = SequentialGraphCut::new();
    let img = nd::arr2(&[[0u8, 0, 200], [0, 100, 250]]);
    cut.init_from_image(img.view(), (0.0, 200.0), |delta| 1.0 - delta).unwrap();
    let right = Direction::new(1, true);
    let down = Direction::new(0, true);
    assert_eq!(cut.graph().capacity(&[0, 0], right), 1.0);
    //200 -> 1.0 and 250 is clamped to 1.0
    assert_eq!(cut.graph().capacity(&[0, 1], right), 0.0);
    assert_eq!(cut.graph().capacity(&[0, 2], down), 1.0);
    assert_eq!(cut.graph().capacity(&[0, 1], down), 0.5);
  }

  #[test]
  fn non_finite_pixels_cut_their_edges() {
    let mut cut = SequentialGraphCut::new();
    let img = nd::arr1(&[0.0, 0.25, f64::INFINITY, 0.5, f64::NEG_INFINITY, f64::NAN, 1.0]);
    let along = Direction::new(0, true);
    let caps = |cut: &SequentialGraphCut| -> Vec<f64> { (0..6).map(|i| cut.graph().capacity(&[i], along)).collect() };

    cut.init_from_image(img.view(), (0.0, 1.0), exponential_decay(1.0)).unwrap();
    assert_eq!(caps(&cut), vec![(-0.25f64).exp(), 0.0, 0.0, 0.0, 0.0, 0.0]);

    //Flat range: every finite pixel maps onto zero
    cut.init_from_image(img.view(), (0.5, 0.5), exponential_decay(1.0)).unwrap();
    assert_eq!(caps(&cut), vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);

    //A weight function that ignores NaN still cannot open those edges
    cut.init_from_image(img.view(), (0.0, 1.0), |_| 2.0).unwrap();
    assert_eq!(caps(&cut), vec![2.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
  }

  #[test]
  fn masks_register_terminals() {
    let mut cut = SequentialGraphCut::new();
    cut.init_from_weight_function(&[3, 3], &|_, _| 1.0).unwrap();
    let mut mask = nd::Array2::from_elem((3, 3), false);
    mask[[0, 0]] = true;
    mask[[0, 1]] = true;
    cut.add_source_mask(mask.view()).unwrap();
    cut.add_sink_mask(mask.t()).unwrap();
    assert_eq!(cut.graph().source_nodes(), &[vec![0, 0], vec![0, 1]]);
    assert_eq!(cut.graph().sink_nodes(), &[vec![0, 0], vec![1, 0]]);
    assert_eq!(cut.run(), Err(GraphCutError::OverlappingTerminals { coord: vec![0, 0] }));
  }
}
