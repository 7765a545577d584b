// Two-pass defect acceptance.
//
// Pass one accepts only high-confidence defect predictions. Defects often run
// past a tile border and the partially covered neighbors score lower, so pass
// two re-classifies the 8-connected neighbors of every accepted tile and
// accepts those predicted as the *same* class under a lower threshold.

use crate::pipeline::classifier::{classify_checked, ClassifyError, DefectClassifier};
use crate::pipeline::geometry::PatchGrid;
use crate::pipeline::types::{AcceptedDefect, DefectClass, GridCell, Pass, Patch};
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Strict lower bound for primary acceptance (τ1)
    pub primary: f32,
    /// Strict lower bound for neighbor acceptance (τ2)
    pub neighbor: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            primary: 0.999,
            neighbor: 0.5,
        }
    }
}

/// Accepted defects of one frame in discovery order: primary hits in tiling
/// order, then each class's neighbor hits in row-major cell order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameDefects {
    pub defects: Vec<AcceptedDefect>,
    pub primary_count: usize,
    pub neighbor_batches: usize,
}

impl FrameDefects {
    pub fn neighbor_count(&self) -> usize {
        self.defects.len() - self.primary_count
    }
}

/// Per-class candidate cells: the union of neighbors of that class's accepted
/// tiles, minus every tile already accepted in the frame.
pub fn neighbor_candidates(
    grid: &PatchGrid,
    accepted: &[AcceptedDefect],
) -> BTreeMap<DefectClass, BTreeSet<GridCell>> {
    let accepted_cells: HashSet<GridCell> = accepted.iter().map(|d| d.cell).collect();

    let mut candidates: BTreeMap<DefectClass, BTreeSet<GridCell>> = BTreeMap::new();
    for defect in accepted {
        let set = candidates.entry(defect.class).or_default();
        set.extend(
            grid.neighbors(defect.cell)
                .into_iter()
                .filter(|c| !accepted_cells.contains(c)),
        );
    }
    candidates.retain(|_, cells| !cells.is_empty());
    candidates
}

pub struct TwoPassDetector {
    thresholds: Thresholds,
}

impl TwoPassDetector {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    /// Run both passes over a tiled frame.
    ///
    /// `patches` must be the tiler output for `grid` (row-major, one per cell).
    /// Any classifier error aborts the whole frame: nothing is accepted.
    pub fn detect(
        &self,
        classifier: &mut dyn DefectClassifier,
        grid: &PatchGrid,
        patches: &[Patch],
    ) -> Result<FrameDefects, ClassifyError> {
        // Primary scan
        let predictions = classify_checked(classifier, patches)?;
        let mut defects: Vec<AcceptedDefect> = patches
            .iter()
            .zip(predictions)
            .filter(|(_, (class, confidence))| {
                class.is_defect() && *confidence > self.thresholds.primary
            })
            .map(|(patch, (class, confidence))| AcceptedDefect {
                cell: patch.cell,
                coords: patch.coords,
                class,
                confidence,
                pass: Pass::Primary,
            })
            .collect();
        let primary_count = defects.len();

        let candidates = neighbor_candidates(grid, &defects);
        tracing::debug!(
            "Primary pass accepted {} of {} patches, {} classes to expand",
            primary_count,
            patches.len(),
            candidates.len()
        );

        // Neighbor scan. A tile accepted for one class is not re-tested for another.
        let mut accepted_cells: HashSet<GridCell> = defects.iter().map(|d| d.cell).collect();
        let mut neighbor_batches = 0;
        for (class, cells) in candidates {
            let batch: Vec<Patch> = cells
                .into_iter()
                .filter(|c| !accepted_cells.contains(c))
                .filter_map(|c| grid.index_of(c).and_then(|i| patches.get(i)))
                .cloned()
                .collect();
            if batch.is_empty() {
                continue;
            }

            neighbor_batches += 1;
            let predictions = classify_checked(classifier, &batch)?;
            for (patch, (predicted, confidence)) in batch.iter().zip(predictions) {
                if predicted == class && confidence > self.thresholds.neighbor {
                    accepted_cells.insert(patch.cell);
                    defects.push(AcceptedDefect {
                        cell: patch.cell,
                        coords: patch.coords,
                        class,
                        confidence,
                        pass: Pass::Neighbor,
                    });
                }
            }
        }

        Ok(FrameDefects {
            defects,
            primary_count,
            neighbor_batches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classifier::testing::{background, predict, ScriptedClassifier};
    use crate::pipeline::slicing::generate_patches;
    use opencv::core::{Mat, Scalar, CV_8UC3};

    fn tiled(width: i32, height: i32) -> (PatchGrid, Vec<Patch>) {
        let image =
            Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::all(0.0)).unwrap();
        generate_patches(&image, 64).unwrap()
    }

    fn primary(cell: GridCell, class: DefectClass, grid: &PatchGrid) -> AcceptedDefect {
        AcceptedDefect {
            cell,
            coords: grid.coords(cell),
            class,
            confidence: 1.0,
            pass: Pass::Primary,
        }
    }

    #[test]
    fn test_candidates_exclude_accepted_cells_and_dedup() {
        let (grid, _) = tiled(768, 512);
        let a = GridCell::new(3, 3);
        let b = GridCell::new(4, 3);
        let accepted = vec![
            primary(a, DefectClass::Hole, &grid),
            primary(b, DefectClass::Hole, &grid),
        ];

        let candidates = neighbor_candidates(&grid, &accepted);
        let holes = &candidates[&DefectClass::Hole];

        // Two adjacent interior tiles: 3x4 block minus the two tiles themselves.
        assert_eq!(holes.len(), 10);
        assert!(!holes.contains(&a));
        assert!(!holes.contains(&b));
    }

    #[test]
    fn test_candidates_exclude_cells_accepted_for_other_classes() {
        let (grid, _) = tiled(768, 512);
        let hole = GridCell::new(2, 2);
        let oil = GridCell::new(3, 2);
        let accepted = vec![
            primary(hole, DefectClass::Hole, &grid),
            primary(oil, DefectClass::OilSpot, &grid),
        ];

        let candidates = neighbor_candidates(&grid, &accepted);
        for cells in candidates.values() {
            assert!(!cells.contains(&hole));
            assert!(!cells.contains(&oil));
        }
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_no_primary_hits_means_single_batch() {
        let (grid, patches) = tiled(768, 512);
        let mut classifier = ScriptedClassifier::new(|_, _| predict(DefectClass::Hole, 0.99));

        let result = TwoPassDetector::new(Thresholds::default())
            .detect(&mut classifier, &grid, &patches)
            .unwrap();

        assert!(result.defects.is_empty());
        assert_eq!(classifier.batches, vec![96]);
    }

    #[test]
    fn test_corner_defect_expands_into_same_class_neighbors() {
        let (grid, patches) = tiled(768, 512);
        let seed = GridCell::new(0, 0);
        let mut classifier = ScriptedClassifier::new(move |call, patch| match call {
            0 if patch.cell == seed => predict(DefectClass::Hole, 0.9995),
            0 => background(0.99),
            _ => predict(DefectClass::Hole, 0.6),
        });

        let result = TwoPassDetector::new(Thresholds::default())
            .detect(&mut classifier, &grid, &patches)
            .unwrap();

        assert_eq!(result.defects.len(), 4);
        assert_eq!(result.primary_count, 1);
        assert_eq!(result.neighbor_count(), 3);
        assert_eq!(classifier.batches, vec![96, 3]);
        assert_eq!(result.defects[0].pass, Pass::Primary);
        assert!(result.defects.iter().all(|d| d.class == DefectClass::Hole));

        let neighbor_cells: Vec<_> = result.defects[1..].iter().map(|d| d.cell).collect();
        assert_eq!(
            neighbor_cells,
            vec![GridCell::new(1, 0), GridCell::new(0, 1), GridCell::new(1, 1)]
        );
    }

    #[test]
    fn test_neighbors_need_same_class_and_strict_threshold() {
        let (grid, patches) = tiled(768, 512);
        let seed = GridCell::new(5, 4);
        let mut classifier = ScriptedClassifier::new(move |call, patch| {
            if call == 0 {
                return if patch.cell == seed {
                    predict(DefectClass::Objects, 1.0)
                } else {
                    background(0.9)
                };
            }
            match (patch.cell.col, patch.cell.row) {
                (4, 3) => predict(DefectClass::Objects, 0.5), // not strictly above τ2
                (5, 3) => predict(DefectClass::Hole, 0.95),   // wrong class
                (6, 3) => predict(DefectClass::Objects, 0.51),
                _ => background(0.8),
            }
        });

        let result = TwoPassDetector::new(Thresholds::default())
            .detect(&mut classifier, &grid, &patches)
            .unwrap();

        assert_eq!(classifier.batches, vec![96, 8]);
        assert_eq!(result.defects.len(), 2);
        assert_eq!(result.defects[1].cell, GridCell::new(6, 3));
        assert_eq!(result.defects[1].pass, Pass::Neighbor);
    }

    #[test]
    fn test_first_accepted_class_wins_for_shared_neighbors() {
        let (grid, patches) = tiled(768, 512);
        // Hole at (2,2) and thread error at (4,2) share the neighbor column 3.
        let mut classifier = ScriptedClassifier::new(move |call, patch| {
            let cell = patch.cell;
            if call == 0 {
                return match (cell.col, cell.row) {
                    (2, 2) => predict(DefectClass::Hole, 1.0),
                    (4, 2) => predict(DefectClass::ThreadError, 1.0),
                    _ => background(0.9),
                };
            }
            if cell == GridCell::new(3, 2) {
                // Ambiguous tile that looks like both, depending on who asks.
                return if call == 1 {
                    predict(DefectClass::Hole, 0.7)
                } else {
                    predict(DefectClass::ThreadError, 0.7)
                };
            }
            background(0.9)
        });

        let result = TwoPassDetector::new(Thresholds::default())
            .detect(&mut classifier, &grid, &patches)
            .unwrap();

        let shared: Vec<_> = result
            .defects
            .iter()
            .filter(|d| d.cell == GridCell::new(3, 2))
            .collect();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].class, DefectClass::Hole);
        // Hole batch: 8 neighbors; thread error batch loses the shared tile.
        assert_eq!(classifier.batches, vec![96, 8, 7]);
    }

    #[test]
    fn test_classifier_failure_aborts_frame() {
        let (grid, patches) = tiled(128, 128);
        let mut classifier = ScriptedClassifier::failing();
        let result =
            TwoPassDetector::new(Thresholds::default()).detect(&mut classifier, &grid, &patches);
        assert!(result.is_err());
    }
}
