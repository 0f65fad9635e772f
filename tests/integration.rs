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

use ndarray::Dimension;
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use rustronomy_graphcut::prelude::*;

//Size of the randomly weighted grids
const RF_SIZE: (usize, usize) = (8, 8);

/// Random integer-valued weights, so flows add up exactly
fn random_weights(shape: (usize, usize)) -> [nd::Array2<f64>; 2] {
  let draw = || nd::Array2::<u8>::random(shape, Uniform::new(0, 6)).mapv(f64::from);
  [draw(), draw()]
}

fn unit_square(cut: &mut (dyn GraphCut + Send + Sync)) {
  cut.init_from_weight_function(&[4, 4], &|_, _| 1.0).unwrap();
  cut.add_source_node(&[0, 0]).unwrap();
  cut.add_sink_node(&[3, 3]).unwrap();
}

fn load_weights(cut: &mut (dyn GraphCut + Send + Sync), weights: &[nd::Array2<f64>; 2]) {
  let views: Vec<nd::ArrayViewD<f64>> = weights.iter().map(|w| w.view().into_dyn()).collect();
  cut.init_from_weights(&views).unwrap();
}

/// Asserts that no capacity went missing: flow into every non-terminal node
/// equals flow out of it, and every directed pair still sums to twice the
/// static capacity.
fn assert_flow_conserved(graph: &rustronomy_graphcut::state::GraphState) {
  let shape = graph.shape().to_vec();
  let terminals: Vec<&Vec<usize>> = graph.source_nodes().iter().chain(graph.sink_nodes()).collect();
  for coord in nd::indices(shape.as_slice()) {
    let coord = coord.slice().to_vec();
    let mut net = 0.0;
    for dir in (0..2 * shape.len()).map(Direction::from_index) {
      let pushed = graph.capacity(&coord, dir) - graph.residual(&coord, dir);
      net += pushed;
      let mut other = coord.clone();
      if dir.is_forward() {
        other[dir.dim()] += 1;
      } else if other[dir.dim()] > 0 {
        other[dir.dim()] -= 1;
      } else {
        continue;
      }
      if other[dir.dim()] >= shape[dir.dim()] {
        continue;
      }
      let both_ways = graph.residual(&coord, dir) + graph.residual(&other, dir.opposite());
      assert_eq!(both_ways, 2.0 * graph.capacity(&coord, dir), "at {coord:?} in {dir:?}");
    }
    if !terminals.contains(&&coord) {
      assert_eq!(net, 0.0, "flow is not conserved at {coord:?}");
    }
  }
}

/// Asserts that no edge leaves the source set with capacity to spare
fn assert_cut_is_saturated(graph: &rustronomy_graphcut::state::GraphState) {
  let shape = graph.shape().to_vec();
  for coord in nd::indices(shape.as_slice()) {
    let coord = coord.slice().to_vec();
    if graph.tree_of(&coord) != Some(Tree::Source) {
      continue;
    }
    for dir in (0..2 * shape.len()).map(Direction::from_index) {
      let mut other = coord.clone();
      if dir.is_forward() {
        other[dir.dim()] += 1;
        if other[dir.dim()] >= shape[dir.dim()] {
          continue;
        }
      } else if other[dir.dim()] > 0 {
        other[dir.dim()] -= 1;
      } else {
        continue;
      }
      if graph.tree_of(&other) != Some(Tree::Source) {
        assert_eq!(graph.residual(&coord, dir), 0.0, "open edge {coord:?} -> {other:?}");
      }
    }
  }
}

#[test]
fn unit_square_parallel() {
  let mut cut = GraphCutBuilder::new_parallel().build().unwrap();
  unit_square(cut.as_mut());
  let summary = cut.run().unwrap();

  //Two vertex-disjoint paths saturate both edges around each corner
  assert_eq!(summary.flow, 2.0);
  assert!(cut.is_in_segmentation(&[0, 0]));
  assert!(!cut.is_in_segmentation(&[0, 1]));
  assert!(!cut.is_in_segmentation(&[1, 0]));
  assert!(!cut.is_in_segmentation(&[3, 3]));
  assert_eq!(cut.graph().tree_of(&[3, 3]), Some(Tree::Sink));
  assert_eq!(cut.segmentation().iter().filter(|&&px| px).count(), 1);
  assert!(cut.graph().is_up_to_date());
}

#[test]
fn unit_square_small_blocks() {
  let mut cut = GraphCutBuilder::new_parallel().set_block_size(&[2, 2]).set_num_threads(3).build().unwrap();
  unit_square(cut.as_mut());
  let summary = cut.run().unwrap();
  assert_eq!(summary.flow, 2.0);
  //2x2 macro-cells have 4 boundaries between them, all merged away
  assert_eq!(summary.boundary_edges, 4);
  assert_eq!(summary.merges, 3);
  assert!(cut.is_in_segmentation(&[0, 0]));
  assert_eq!(cut.segmentation().iter().filter(|&&px| px).count(), 1);
  assert_flow_conserved(cut.graph());
  assert_cut_is_saturated(cut.graph());
}

#[test]
fn single_node_without_terminals() {
  let mut cut = GraphCutBuilder::new_parallel().build().unwrap();
  cut.init_from_weight_function(&[1], &|_, _| 1.0).unwrap();
  assert_eq!(cut.run(), Err(GraphCutError::NoSourceNodes));
  assert!(!cut.is_in_segmentation(&[0]));
  assert!(!cut.graph().is_up_to_date());
  assert_eq!(cut.graph().flow(), 0.0);
}

#[test]
fn failed_run_keeps_previous_result() {
  let mut cut = GraphCutBuilder::new_parallel().set_block_size(&[2, 2]).build().unwrap();
  unit_square(cut.as_mut());
  cut.run().unwrap();
  cut.add_sink_node(&[0, 0]).unwrap();
  assert_eq!(cut.run(), Err(GraphCutError::OverlappingTerminals { coord: vec![0, 0] }));
  assert!(cut.is_in_segmentation(&[0, 0]));
  assert_eq!(cut.graph().flow(), 2.0);
}

#[test]
fn repeated_runs_are_cached() {
  let weights = random_weights(RF_SIZE);
  let mut cut = GraphCutBuilder::new_parallel().set_block_size(&[2, 2]).build().unwrap();
  load_weights(cut.as_mut(), &weights);
  cut.add_source_node(&[1, 1]).unwrap();
  cut.add_sink_node(&[6, 6]).unwrap();

  let first = cut.run().unwrap();
  let segmentation = cut.segmentation();
  let second = cut.run().unwrap();
  assert_eq!(first, second);
  assert_eq!(segmentation, cut.segmentation());

  //A reset forces a full recomputation with the same outcome
  cut.reset();
  assert!(!cut.graph().is_up_to_date());
  let third = cut.run().unwrap();
  assert_eq!(first.flow, third.flow);
  assert_eq!(segmentation, cut.segmentation());
}

#[test]
fn parallel_matches_sequential() {
  for round in 0..5 {
    let weights = random_weights(RF_SIZE);

    let mut sequential = GraphCutBuilder::new_sequential().build().unwrap();
    let mut parallel = GraphCutBuilder::new_parallel().set_block_size(&[2, 2]).set_num_threads(4).build().unwrap();
    for cut in [&mut sequential, &mut parallel] {
      load_weights(cut.as_mut(), &weights);
      cut.add_source_node(&[0, 0]).unwrap();
      cut.add_source_node(&[2, 5]).unwrap();
      cut.add_sink_node(&[7, 7]).unwrap();
      cut.add_sink_node(&[5, 1]).unwrap();
    }

    let expected = sequential.run().unwrap();
    let found = parallel.run().unwrap();
    assert_eq!(expected.flow, found.flow, "round {round}");
    assert_eq!(sequential.segmentation(), parallel.segmentation(), "round {round}");
    assert_flow_conserved(parallel.graph());
    assert_cut_is_saturated(parallel.graph());
  }
}

#[test]
fn block_ids_count_up_and_reset() {
  let mut cut = ParallelGraphCut::with_config(&[2, 2], 2);
  let weights = random_weights(RF_SIZE);
  load_weights(&mut cut, &weights);
  cut.add_source_node(&[0, 0]).unwrap();
  cut.add_sink_node(&[7, 7]).unwrap();

  let summary = cut.run().unwrap();
  //16 macro-cells, merged pairwise until a single block is left
  assert_eq!(summary.merges, 15);
  assert_eq!(summary.blocks_created, 16 + 15);
  assert_eq!(cut.next_block_id(), summary.blocks_created);
  cut.reset();
  assert_eq!(cut.next_block_id(), 0);
}

/// Edge weights that are exact binary fractions, so flows sum up exactly
fn step_weight(delta: f64) -> f64 {
  if delta > 0.75 {
    0.25
  } else if delta > 0.25 {
    0.5
  } else {
    4.0
  }
}

#[test]
fn cut_through_a_volume() {
  //Two bright cubes in a dark volume, connected by a thin dim bridge
  let mut img = nd::Array3::<f64>::zeros((6, 10, 4));
  img.slice_mut(nd::s![1..5, 0..4, ..]).fill(1.0);
  img.slice_mut(nd::s![1..5, 6..10, ..]).fill(1.0);
  img.slice_mut(nd::s![2..3, 4..6, 1..2]).fill(0.5);

  let mut cut = GraphCutBuilder::new_parallel().set_block_size(&[3, 3, 2]).build().unwrap();
  let range = cut.intensity_range(img.view()).unwrap();
  assert_eq!(range, (0.0, 1.0));
  cut.init_from_image(img.view(), range, step_weight).unwrap();
  cut.add_source_node(&[2, 1, 2]).unwrap();
  cut.add_sink_node(&[0, 0, 0]).unwrap();
  cut.add_sink_node(&[2, 8, 2]).unwrap();
  let summary = cut.run().unwrap();

  assert!(summary.flow > 0.0);
  assert!(cut.is_in_segmentation(&[2, 1, 2]));
  assert!(!cut.is_in_segmentation(&[2, 8, 2]));
  assert_eq!(cut.segmentation().shape(), &[6, 10, 4]);
  assert_flow_conserved(cut.graph());
  assert_cut_is_saturated(cut.graph());

  let mut reference = GraphCutBuilder::new_sequential().build().unwrap();
  reference.init_from_image(img.view(), range, step_weight).unwrap();
  for coord in cut.graph().source_nodes().to_vec() {
    reference.add_source_node(&coord).unwrap();
  }
  for coord in cut.graph().sink_nodes().to_vec() {
    reference.add_sink_node(&coord).unwrap();
  }
  reference.run().unwrap();
  assert_eq!(reference.segmentation(), cut.segmentation());
}

#[test]
fn mask_seeded_segmentation() {
  //A bright disc on a dark background
  let img = nd::Array2::from_shape_fn((24, 24), |(x, y)| {
    let (dx, dy) = (x as f64 - 12.0, y as f64 - 12.0);
    if dx * dx + dy * dy < 36.0 {
      200u8
    } else {
      10u8
    }
  });
  let mut sources = nd::Array2::from_elem((24, 24), false);
  sources[[12, 12]] = true;
  let mut sinks = nd::Array2::from_elem((24, 24), false);
  sinks.row_mut(0).fill(true);

  let mut cut = GraphCutBuilder::new_parallel().set_block_size(&[5, 7]).build().unwrap();
  let range = cut.intensity_range(img.view()).unwrap();
  cut.init_from_image(img.view(), range, exponential_decay(12.0)).unwrap();
  cut.add_source_mask(sources.view()).unwrap();
  cut.add_sink_mask(sinks.view()).unwrap();
  cut.run().unwrap();

  let segmentation = cut.segmentation();
  assert!(segmentation[[12, 12].as_slice()]);
  assert!(segmentation[[12, 16].as_slice()]);
  assert!(!segmentation[[12, 20].as_slice()]);
  assert!(!segmentation[[2, 2].as_slice()]);
}

#[test]
fn terminals_outside_the_grid_are_rejected() {
  let mut cut = GraphCutBuilder::new_sequential().build().unwrap();
  cut.init_from_weight_function(&[4, 4], &|_, _| 1.0).unwrap();
  assert_eq!(
    cut.add_source_node(&[4, 1]),
    Err(GraphCutError::OutOfBounds { coord: vec![4, 1], shape: vec![4, 4] })
  );
  assert!(cut.graph().source_nodes().is_empty());
}

#[test]
fn degenerate_grid_is_a_no_op() {
  for mut cut in [GraphCutBuilder::new_sequential().build().unwrap(), GraphCutBuilder::new_parallel().build().unwrap()] {
    cut.init_from_weight_function(&[0, 4], &|_, _| 1.0).unwrap();
    assert_eq!(cut.run(), Err(GraphCutError::DegenerateGrid { shape: vec![0, 4] }));
    assert!(!cut.graph().is_up_to_date());
    assert_eq!(cut.graph().flow(), 0.0);
    assert!(cut.graph().segmentation().is_empty());
  }
}

#[test]
fn mismatched_weights_are_rejected() {
  let mut cut = GraphCutBuilder::new_sequential().build().unwrap();
  let square = nd::Array2::<f64>::ones((3, 3)).into_dyn();
  let wide = nd::Array2::<f64>::ones((3, 4)).into_dyn();

  //One weight array per dimension
  assert_eq!(
    cut.init_from_weights(&[square.view()]),
    Err(GraphCutError::ShapeMismatch { expected: vec![2], found: vec![1] })
  );

  //All weight arrays share the grid shape
  assert_eq!(
    cut.init_from_weights(&[square.view(), wide.view()]),
    Err(GraphCutError::ShapeMismatch { expected: vec![3, 3], found: vec![3, 4] })
  );
  assert!(cut.graph().shape().is_empty());

  cut.init_from_weights(&[square.view(), square.view()]).unwrap();
  assert_eq!(cut.graph().shape(), &[3, 3]);
}
