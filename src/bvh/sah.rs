//! Top-down BVH builder.
//!
//! One iterative driver serves both strategies: centroid median and binned
//! SAH (optionally with spatial splits from [`super::split`]). Nodes are
//! emitted in depth-first order: the task stack pops the left subtree before
//! the right, so the left child of node `i` is always `i + 1`.

use rayon::prelude::*;

use super::split::{self, SplitBudget};
use super::{BuildSettings, BuilderKind, Bvh, Node, NodeKind};
use crate::util::{BBox, Error, Vec3};

/// Below this many references bounds are reduced sequentially.
const PAR_THRESHOLD: usize = 4096;

/// A primitive (or a clipped piece of one) being sorted into the tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reference {
    pub bounds: BBox,
    pub prim: u32,
}

impl Reference {
    #[inline]
    pub fn centroid(&self) -> Vec3 {
        self.bounds.center()
    }
}

/// Pending subtree.
struct Task {
    refs: Vec<Reference>,
    depth: u32,
    /// Parent node and whether this is its right child.
    parent: Option<(usize, bool)>,
}

/// Best binned object split.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectSplit {
    pub axis: usize,
    /// References whose centroid bin is below this go left.
    pub bin: usize,
    pub cost: f32,
    pub left: BBox,
    pub right: BBox,
}

/// Build a BVH over primitive bounds.
#[tracing::instrument(skip_all, fields(prim_count = bounds.len(), builder = ?settings.builder))]
pub fn build(bounds: &[BBox], settings: &BuildSettings) -> Bvh {
    let n = bounds.len();
    if n == 0 {
        return Bvh::default();
    }

    let refs: Vec<Reference> = bounds
        .par_iter()
        .enumerate()
        .map(|(i, b)| Reference {
            bounds: *b,
            prim: i as u32,
        })
        .collect();

    let (root_bounds, _) = compute_bounds(&refs);
    let root_area = root_bounds.surface_area();
    let mut budget = SplitBudget::new(settings, n);

    let mut nodes: Vec<Node> = Vec::with_capacity(2 * n);
    let mut indices: Vec<u32> = Vec::with_capacity(n);
    let mut height = 0u32;

    let mut stack = vec![Task {
        refs,
        depth: 0,
        parent: None,
    }];

    while let Some(task) = stack.pop() {
        let node_idx = nodes.len();
        if let Some((parent, is_right)) = task.parent {
            link_child(&mut nodes[parent], node_idx as u32, is_right);
        }
        height = height.max(task.depth + 1);

        let (node_bounds, centroid_bounds) = compute_bounds(&task.refs);
        let count = task.refs.len();

        let children = if count <= settings.max_leaf_size {
            Err(task.refs)
        } else {
            match settings.builder {
                BuilderKind::Median => Ok(median_split(task.refs, &centroid_bounds)),
                BuilderKind::Sah => sah_split(
                    task.refs,
                    &node_bounds,
                    &centroid_bounds,
                    task.depth,
                    root_area,
                    settings,
                    &mut budget,
                ),
            }
        };

        match children {
            Err(refs) => {
                let first = indices.len() as u32;
                indices.extend(refs.iter().map(|r| r.prim));
                nodes.push(Node {
                    bounds: node_bounds,
                    kind: NodeKind::Leaf {
                        first,
                        count: refs.len() as u32,
                    },
                });
            }
            Ok((left, right)) => {
                nodes.push(Node {
                    bounds: node_bounds,
                    kind: NodeKind::Internal { left: 0, right: 0 },
                });
                // Right first so the left subtree is laid out next.
                stack.push(Task {
                    refs: right,
                    depth: task.depth + 1,
                    parent: Some((node_idx, true)),
                });
                stack.push(Task {
                    refs: left,
                    depth: task.depth + 1,
                    parent: Some((node_idx, false)),
                });
            }
        }
    }

    tracing::debug!(
        nodes = nodes.len(),
        indices = indices.len(),
        height,
        duplicates = budget.used(),
        "bvh built"
    );

    Bvh {
        nodes,
        indices,
        height,
        duplicates: budget.used(),
    }
}

fn link_child(parent: &mut Node, child: u32, is_right: bool) {
    if let NodeKind::Internal { left, right } = &mut parent.kind {
        if is_right {
            *right = child;
        } else {
            *left = child;
        }
    }
}

/// Union of reference bounds and of their centroids.
pub(crate) fn compute_bounds(refs: &[Reference]) -> (BBox, BBox) {
    let fold = |(mut b, mut c): (BBox, BBox), r: &Reference| {
        b.expand_by_box(&r.bounds);
        c.expand_by_point(r.centroid());
        (b, c)
    };
    if refs.len() < PAR_THRESHOLD {
        return refs.iter().fold((BBox::EMPTY, BBox::EMPTY), fold);
    }
    refs.par_iter()
        .fold(|| (BBox::EMPTY, BBox::EMPTY), fold)
        .reduce(
            || (BBox::EMPTY, BBox::EMPTY),
            |a, b| (a.0.union(&b.0), a.1.union(&b.1)),
        )
}

/// Split at the centroid median of the longest centroid axis.
fn median_split(mut refs: Vec<Reference>, centroid_bounds: &BBox) -> (Vec<Reference>, Vec<Reference>) {
    let axis = centroid_bounds.longest_axis();
    let mid = refs.len() / 2;
    refs.select_nth_unstable_by(mid, |a, b| a.centroid()[axis].total_cmp(&b.centroid()[axis]));
    let right = refs.split_off(mid);
    (refs, right)
}

/// SAH decision for one node. `Err` hands the references back for a leaf.
#[allow(clippy::too_many_arguments)]
fn sah_split(
    mut refs: Vec<Reference>,
    node_bounds: &BBox,
    centroid_bounds: &BBox,
    depth: u32,
    root_area: f32,
    settings: &BuildSettings,
    budget: &mut SplitBudget,
) -> Result<(Vec<Reference>, Vec<Reference>), Vec<Reference>> {
    let leaf_cost = refs.len() as f32;
    let Some(object) = find_object_split(&refs, node_bounds, centroid_bounds, settings) else {
        return Err(refs);
    };

    let search = budget.enabled()
        && depth <= settings.max_split_depth
        && split::overlap_triggers(&object.left, &object.right, root_area, settings.min_overlap);
    if search {
        if let Some(spatial) = split::find_spatial_split(&refs, node_bounds, settings) {
            if spatial.cost < object.cost && spatial.cost < leaf_cost {
                match budget.reserve(spatial.duplicates(refs.len())) {
                    Ok(()) => return Ok(split::apply(refs, &spatial, node_bounds, settings)),
                    Err(Error::BuildAborted) => {
                        tracing::warn!(
                            depth,
                            used = budget.used(),
                            "spatial split budget exhausted, continuing with object splits"
                        );
                        budget.disable();
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "spatial split rejected");
                        budget.disable();
                    }
                }
            }
        }
    }

    if leaf_cost <= object.cost {
        return Err(refs);
    }

    let bins = settings.bin_count();
    let scale = bins as f32 / centroid_bounds.size()[object.axis];
    let min = centroid_bounds.min[object.axis];
    let mid = partition(&mut refs, |r| {
        bin_index(r.centroid()[object.axis], min, scale, bins) < object.bin
    });

    // Fallback: if partition is degenerate, split in middle
    let mid = if mid == 0 || mid == refs.len() {
        refs.len() / 2
    } else {
        mid
    };
    let right = refs.split_off(mid);
    Ok((refs, right))
}

#[inline]
pub(crate) fn bin_index(value: f32, min: f32, scale: f32, bins: usize) -> usize {
    let b = ((value - min) * scale) as isize;
    b.clamp(0, bins as isize - 1) as usize
}

/// Binned SAH sweep along the longest centroid axis.
/// Returns `None` when the centroids are coincident on that axis.
pub(crate) fn find_object_split(
    refs: &[Reference],
    node_bounds: &BBox,
    centroid_bounds: &BBox,
    settings: &BuildSettings,
) -> Option<ObjectSplit> {
    let axis = centroid_bounds.longest_axis();
    let extent = centroid_bounds.size()[axis];
    if !(extent > 1e-8) {
        return None;
    }

    let k = settings.bin_count();
    let scale = k as f32 / extent;
    let min = centroid_bounds.min[axis];

    let mut bin_bounds = vec![BBox::EMPTY; k];
    let mut bin_count = vec![0usize; k];
    for r in refs {
        let b = bin_index(r.centroid()[axis], min, scale, k);
        bin_bounds[b].expand_by_box(&r.bounds);
        bin_count[b] += 1;
    }

    // Sweep from left: prefix bounds and counts for planes 1..k
    let mut left_box = vec![BBox::EMPTY; k];
    let mut left_count = vec![0usize; k];
    let mut sweep = BBox::EMPTY;
    let mut sweep_count = 0;
    for i in 1..k {
        sweep.expand_by_box(&bin_bounds[i - 1]);
        sweep_count += bin_count[i - 1];
        left_box[i] = sweep;
        left_count[i] = sweep_count;
    }

    let parent_area = node_bounds.surface_area();
    let inv_parent = if parent_area > 0.0 { 1.0 / parent_area } else { 0.0 };

    // Sweep from right and evaluate cost
    let mut right_box = vec![BBox::EMPTY; k];
    let mut right_count = vec![0usize; k];
    sweep = BBox::EMPTY;
    sweep_count = 0;
    for i in (1..k).rev() {
        sweep.expand_by_box(&bin_bounds[i]);
        sweep_count += bin_count[i];
        right_box[i] = sweep;
        right_count[i] = sweep_count;
    }

    let mut best: Option<ObjectSplit> = None;
    for i in 1..k {
        if left_count[i] == 0 || right_count[i] == 0 {
            continue;
        }
        let cost = settings.traversal_cost
            + (left_box[i].surface_area() * left_count[i] as f32
                + right_box[i].surface_area() * right_count[i] as f32)
                * inv_parent;
        if best.map_or(true, |b| cost < b.cost) {
            best = Some(ObjectSplit {
                axis,
                bin: i,
                cost,
                left: left_box[i],
                right: right_box[i],
            });
        }
    }
    best
}

/// Partition slice in-place. Returns count of elements where predicate is true.
pub(crate) fn partition<T, F>(slice: &mut [T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}
