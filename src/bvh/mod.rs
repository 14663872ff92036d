//! Bounding volume hierarchy over primitive bounds.
//!
//! The builder consumes one world-space [`BBox`] per primitive and produces a
//! node arena in depth-first order (root at index 0, a node's left child
//! immediately after it) plus the reordered primitive index list that leaves
//! reference into.
//!
//! ## Architecture
//! ```text
//! primitive bounds → build (median | binned SAH [+ spatial splits]) → Bvh
//!                  → translator::FatBvh (GPU layout) → device blob
//! ```

pub mod sah;
pub mod split;
pub mod translator;

use crate::util::{BBox, Options};

pub use translator::{Face, FatBvh, FatNode};

/// Child or primitive range of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Internal { left: u32, right: u32 },
    /// Range into [`Bvh::indices`].
    Leaf { first: u32, count: u32 },
}

/// Builder-side node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    pub bounds: BBox,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }
}

/// Split strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    /// Centroid median on the longest axis.
    Median,
    /// Binned surface area heuristic.
    Sah,
}

/// Builder parameters, normally read from world options.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSettings {
    pub builder: BuilderKind,
    /// Spatial splits (SBVH); only honoured by the SAH builder.
    pub use_splits: bool,
    pub max_split_depth: u32,
    /// Child overlap, relative to root surface area, that triggers a spatial split search.
    pub min_overlap: f32,
    pub traversal_cost: f32,
    /// Duplicate references allowed, as a fraction of the primitive count.
    pub extra_node_budget: f32,
    pub num_bins: usize,
    pub max_leaf_size: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            builder: BuilderKind::Median,
            use_splits: false,
            max_split_depth: 10,
            min_overlap: 0.05,
            traversal_cost: 10.0,
            extra_node_budget: 0.5,
            num_bins: 64,
            max_leaf_size: 1,
        }
    }
}

impl BuildSettings {
    /// Bin count actually used by the sweeps; at least two.
    pub fn bin_count(&self) -> usize {
        self.num_bins.max(2)
    }

    /// Read `bvh.*` options; unknown or malformed values keep their defaults.
    /// Enabling splits selects the SAH builder.
    pub fn from_options(options: &Options) -> Self {
        let d = Self::default();
        let use_splits = options.float_or("bvh.sah.use_splits", 0.0) > 0.0;
        let builder = match options.string("bvh.builder") {
            _ if use_splits => BuilderKind::Sah,
            Some("sah") => BuilderKind::Sah,
            _ => BuilderKind::Median,
        };
        Self {
            builder,
            use_splits,
            max_split_depth: options
                .float("bvh.sah.max_split_depth")
                .map_or(d.max_split_depth, |v| v.max(0.0) as u32),
            min_overlap: options.float_or("bvh.sah.min_overlap", d.min_overlap),
            traversal_cost: options.float_or("bvh.sah.traversal_cost", d.traversal_cost),
            extra_node_budget: options.float_or("bvh.sah.extra_node_budget", d.extra_node_budget),
            num_bins: options
                .float("bvh.sah.num_bins")
                .map_or(d.num_bins, |v| (v as usize).max(2)),
            max_leaf_size: options
                .float("bvh.max_leaf_size")
                .map_or(d.max_leaf_size, |v| (v as usize).max(1)),
        }
    }
}

/// Summary numbers logged after a rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BvhStats {
    pub node_count: usize,
    pub leaf_count: usize,
    pub height: u32,
    pub index_count: usize,
    /// Duplicate references introduced by spatial splits.
    pub duplicates: usize,
    pub sah_cost: f32,
}

/// Built hierarchy.
#[derive(Debug, Clone, Default)]
pub struct Bvh {
    pub(crate) nodes: Vec<Node>,
    pub(crate) indices: Vec<u32>,
    pub(crate) height: u32,
    pub(crate) duplicates: usize,
}

impl Bvh {
    /// Build over per-primitive bounds.
    pub fn build(bounds: &[BBox], settings: &BuildSettings) -> Bvh {
        sah::build(bounds, settings)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn root(&self) -> Option<&Node> {
        self.nodes.first()
    }

    /// Scene bounds; empty for an empty tree.
    pub fn bounds(&self) -> BBox {
        self.root().map_or(BBox::EMPTY, |n| n.bounds)
    }

    /// Reordered primitive ids. Leaves reference ranges of this list.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn num_indices(&self) -> usize {
        self.indices.len()
    }

    /// Levels in the tree: 0 when empty, 1 for a lone leaf.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stats(&self, traversal_cost: f32) -> BvhStats {
        let root_area = self.bounds().surface_area();
        let mut cost = 0.0f32;
        let mut leaf_count = 0;
        for node in &self.nodes {
            let rel = if root_area > 0.0 {
                node.bounds.surface_area() / root_area
            } else {
                1.0
            };
            match node.kind {
                NodeKind::Internal { .. } => cost += traversal_cost * rel,
                NodeKind::Leaf { count, .. } => {
                    leaf_count += 1;
                    cost += count as f32 * rel;
                }
            }
        }
        BvhStats {
            node_count: self.nodes.len(),
            leaf_count,
            height: self.height,
            index_count: self.indices.len(),
            duplicates: self.duplicates,
            sah_cost: cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_options() {
        let mut o = Options::new();
        let s = BuildSettings::from_options(&o);
        assert_eq!(s, BuildSettings::default());
        assert_eq!(s.builder, BuilderKind::Median);

        o.set_string("bvh.builder", "sah");
        o.set_float("bvh.sah.use_splits", 1.0);
        o.set_float("bvh.sah.num_bins", 16.0);
        o.set_float("bvh.sah.traversal_cost", 2.5);
        let s = BuildSettings::from_options(&o);
        assert_eq!(s.builder, BuilderKind::Sah);
        assert!(s.use_splits);
        assert_eq!(s.num_bins, 16);
        assert_eq!(s.traversal_cost, 2.5);
        assert_eq!(s.max_split_depth, 10);
    }

    #[test]
    fn test_unknown_builder_is_median() {
        let mut o = Options::new();
        o.set_string("bvh.builder", "lbvh");
        assert_eq!(BuildSettings::from_options(&o).builder, BuilderKind::Median);
    }
}
