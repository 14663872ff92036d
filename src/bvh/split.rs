//! Spatial splits (SBVH).
//!
//! When the best object split leaves children that overlap heavily, the node
//! bounds are cut into equal-width bins along the longest axis and every
//! reference is clipped into the bins it covers. A reference straddling the
//! chosen plane goes to both children with clipped bounds and the same
//! primitive id. Duplicates are drawn from a global budget of
//! `extra_node_budget * primitive_count`.

use super::sah::{bin_index, Reference};
use super::{BuildSettings, BuilderKind};
use crate::util::{BBox, Error, Result};

/// Global duplicate budget for one build.
#[derive(Debug)]
pub(crate) struct SplitBudget {
    enabled: bool,
    remaining: usize,
    used: usize,
}

impl SplitBudget {
    pub fn new(settings: &BuildSettings, prim_count: usize) -> Self {
        Self {
            enabled: settings.use_splits && settings.builder == BuilderKind::Sah,
            remaining: (settings.extra_node_budget.max(0.0) * prim_count as f32) as usize,
            used: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Take `n` duplicates from the budget.
    pub fn reserve(&mut self, n: usize) -> Result<()> {
        if n > self.remaining {
            return Err(Error::BuildAborted);
        }
        self.remaining -= n;
        self.used += n;
        Ok(())
    }

    /// Turn spatial splits off for the rest of the build.
    pub fn disable(&mut self) {
        self.enabled = false;
    }
}

/// Whether the object split's children overlap enough to look for a
/// spatial split. Overlap is relative to the root, so small nodes deep in
/// the tree rarely qualify.
pub(crate) fn overlap_triggers(left: &BBox, right: &BBox, root_area: f32, min_overlap: f32) -> bool {
    root_area > 0.0 && left.intersection(right).surface_area() / root_area > min_overlap
}

/// Best spatial split candidate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpatialSplit {
    pub axis: usize,
    /// References entering below this bin go left; exiting at or above go right.
    pub bin: usize,
    pub plane: f32,
    pub cost: f32,
    pub left_count: usize,
    pub right_count: usize,
}

impl SpatialSplit {
    /// References that would exist twice after the split.
    pub fn duplicates(&self, count: usize) -> usize {
        (self.left_count + self.right_count).saturating_sub(count)
    }
}

struct Binning {
    axis: usize,
    min: f32,
    max: f32,
    scale: f32,
    bins: usize,
}

impl Binning {
    fn plane(&self, i: usize) -> f32 {
        if i >= self.bins {
            self.max
        } else {
            self.min + (self.max - self.min) * i as f32 / self.bins as f32
        }
    }

    /// First and last bin a box touches.
    fn range(&self, b: &BBox) -> (usize, usize) {
        let lo = bin_index(b.min[self.axis], self.min, self.scale, self.bins);
        let hi = bin_index(b.max[self.axis], self.min, self.scale, self.bins);
        (lo, hi.max(lo))
    }
}

fn binning(node_bounds: &BBox, settings: &BuildSettings) -> Option<Binning> {
    let axis = node_bounds.longest_axis();
    let extent = node_bounds.size()[axis];
    if !(extent > 1e-8) {
        return None;
    }
    let bins = settings.bin_count();
    Some(Binning {
        axis,
        min: node_bounds.min[axis],
        max: node_bounds.max[axis],
        scale: bins as f32 / extent,
        bins,
    })
}

/// Chopped-reference SAH sweep over the node bounds.
pub(crate) fn find_spatial_split(
    refs: &[Reference],
    node_bounds: &BBox,
    settings: &BuildSettings,
) -> Option<SpatialSplit> {
    let binning = binning(node_bounds, settings)?;
    let k = binning.bins;

    let mut bin_bounds = vec![BBox::EMPTY; k];
    let mut entries = vec![0usize; k];
    let mut exits = vec![0usize; k];

    for r in refs {
        let (lo, hi) = binning.range(&r.bounds);
        entries[lo] += 1;
        exits[hi] += 1;
        for b in lo..=hi {
            let piece = r.bounds.clip(binning.axis, binning.plane(b), binning.plane(b + 1));
            bin_bounds[b].expand_by_box(&piece);
        }
    }

    let mut left_box = vec![BBox::EMPTY; k];
    let mut left_count = vec![0usize; k];
    let mut sweep = BBox::EMPTY;
    let mut count = 0;
    for i in 1..k {
        sweep.expand_by_box(&bin_bounds[i - 1]);
        count += entries[i - 1];
        left_box[i] = sweep;
        left_count[i] = count;
    }

    let parent_area = node_bounds.surface_area();
    let inv_parent = if parent_area > 0.0 { 1.0 / parent_area } else { 0.0 };

    let mut best: Option<SpatialSplit> = None;
    sweep = BBox::EMPTY;
    count = 0;
    for i in (1..k).rev() {
        sweep.expand_by_box(&bin_bounds[i]);
        count += exits[i];
        let (nl, nr) = (left_count[i], count);
        if nl == 0 || nr == 0 {
            continue;
        }
        let cost = settings.traversal_cost
            + (left_box[i].surface_area() * nl as f32 + sweep.surface_area() * nr as f32) * inv_parent;
        // `<=` while sweeping down keeps the lowest bin on ties
        if best.map_or(true, |b| cost <= b.cost) {
            best = Some(SpatialSplit {
                axis: binning.axis,
                bin: i,
                plane: binning.plane(i),
                cost,
                left_count: nl,
                right_count: nr,
            });
        }
    }
    best
}

/// Distribute references over the two sides of `split`.
pub(crate) fn apply(
    refs: Vec<Reference>,
    split: &SpatialSplit,
    node_bounds: &BBox,
    settings: &BuildSettings,
) -> (Vec<Reference>, Vec<Reference>) {
    let mut left = Vec::with_capacity(split.left_count);
    let mut right = Vec::with_capacity(split.right_count);

    let Some(binning) = binning(node_bounds, settings) else {
        let mid = refs.len() / 2;
        let mut refs = refs;
        let tail = refs.split_off(mid);
        return (refs, tail);
    };
    let axis = split.axis;

    for r in refs {
        let (lo, hi) = binning.range(&r.bounds);
        if hi < split.bin {
            left.push(r);
        } else if lo >= split.bin {
            right.push(r);
        } else {
            let plane = split.plane.clamp(r.bounds.min[axis], r.bounds.max[axis]);
            let mut l = r;
            l.bounds.max[axis] = plane;
            let mut rr = r;
            rr.bounds.min[axis] = plane;
            left.push(l);
            right.push(rr);
        }
    }

    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::{Bvh, NodeKind};
    use crate::util::Vec3;

    fn sbvh(budget: f32) -> BuildSettings {
        BuildSettings {
            builder: BuilderKind::Sah,
            use_splits: true,
            extra_node_budget: budget,
            traversal_cost: 1.0,
            min_overlap: 0.0,
            ..Default::default()
        }
    }

    /// Long thin slivers crossing a grid of small boxes: object splits overlap.
    fn sliver_scene() -> Vec<BBox> {
        let mut prims = Vec::new();
        for i in 0..8 {
            let y = i as f32 * 4.0;
            prims.push(BBox::new(Vec3::new(0.0, y, 0.0), Vec3::new(100.0, y + 0.1, 0.1)));
        }
        for i in 0..64 {
            let x = (i % 8) as f32 * 12.0;
            let y = (i / 8) as f32 * 4.0 + 1.0;
            prims.push(BBox::new(Vec3::new(x, y, 0.0), Vec3::new(x + 1.0, y + 1.0, 1.0)));
        }
        prims
    }

    #[test]
    fn test_budget() {
        let mut budget = SplitBudget::new(&sbvh(0.5), 10);
        assert!(budget.enabled());
        assert!(budget.reserve(3).is_ok());
        assert!(matches!(budget.reserve(3), Err(Error::BuildAborted)));
        assert_eq!(budget.used(), 3);
        budget.disable();
        assert!(!budget.enabled());

        let median = BuildSettings {
            use_splits: true,
            ..Default::default()
        };
        assert!(!SplitBudget::new(&median, 10).enabled());
    }

    #[test]
    fn test_straddling_reference_is_duplicated() {
        let node = BBox::new(Vec3::ZERO, Vec3::new(4.0, 1.0, 1.0));
        let refs = vec![
            Reference { bounds: BBox::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0)), prim: 0 },
            Reference { bounds: BBox::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(4.0, 0.1, 0.1)), prim: 1 },
            Reference { bounds: BBox::new(Vec3::new(3.0, 0.0, 0.0), Vec3::new(4.0, 1.0, 1.0)), prim: 2 },
        ];
        let settings = BuildSettings {
            num_bins: 4,
            ..sbvh(1.0)
        };
        let split = SpatialSplit {
            axis: 0,
            bin: 2,
            plane: 2.0,
            cost: 0.0,
            left_count: 2,
            right_count: 2,
        };
        let (left, right) = apply(refs, &split, &node, &settings);
        assert_eq!(left.iter().map(|r| r.prim).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(right.iter().map(|r| r.prim).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(left[1].bounds.max.x, 2.0);
        assert_eq!(right[0].bounds.min.x, 2.0);
        assert_eq!(split.duplicates(3), 1);
    }

    #[test]
    fn test_overlap_is_relative_to_root() {
        let left = BBox::new(Vec3::ZERO, Vec3::splat(2.0));
        let right = BBox::new(Vec3::ONE, Vec3::splat(3.0));
        // Unit-cube overlap: area 6 against a parent of area 54
        let parent = left.union(&right).surface_area();
        assert!(overlap_triggers(&left, &right, parent, 0.05));
        // The same pair deep inside a 100-unit scene
        let root = BBox::new(Vec3::ZERO, Vec3::splat(100.0)).surface_area();
        assert!(!overlap_triggers(&left, &right, root, 0.05));
        assert!(!overlap_triggers(&left, &right, 0.0, 0.05));

        let apart = BBox::new(Vec3::splat(5.0), Vec3::splat(6.0));
        assert!(!overlap_triggers(&left, &apart, parent, 0.05));
    }

    #[test]
    fn test_sbvh_duplicates_within_budget() {
        let prims = sliver_scene();
        let bvh = Bvh::build(&prims, &sbvh(0.5));
        assert!(bvh.duplicates <= prims.len() / 2);
        assert_eq!(bvh.num_indices(), prims.len() + bvh.duplicates);

        let mut seen = bvh.indices().to_vec();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), prims.len());

        for node in bvh.nodes() {
            if let NodeKind::Internal { left, right } = node.kind {
                assert!(node.bounds.contains_box(&bvh.nodes()[left as usize].bounds, 1e-5));
                assert!(node.bounds.contains_box(&bvh.nodes()[right as usize].bounds, 1e-5));
            }
        }
    }

    #[test]
    fn test_zero_budget_falls_back() {
        let prims = sliver_scene();
        let bvh = Bvh::build(&prims, &sbvh(0.0));
        assert_eq!(bvh.duplicates, 0);
        assert_eq!(bvh.num_indices(), prims.len());
    }

    #[test]
    fn test_leaves_cover_their_pieces() {
        // Every primitive is covered by the union of the leaves referencing it.
        let prims = sliver_scene();
        let bvh = Bvh::build(&prims, &sbvh(1.0));
        let mut cover = vec![BBox::EMPTY; prims.len()];
        for node in bvh.nodes() {
            if let NodeKind::Leaf { first, count } = node.kind {
                for &p in &bvh.indices()[first as usize..(first + count) as usize] {
                    cover[p as usize].expand_by_box(&node.bounds);
                }
            }
        }
        for (p, c) in prims.iter().zip(&cover) {
            assert!(c.contains_box(p, 1e-5));
        }
    }
}
