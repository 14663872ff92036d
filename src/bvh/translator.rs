//! Fat-node layout for GPU traversal.
//!
//! Each fat node stores both child boxes and both child links, so a traversal
//! step tests two boxes with one node fetch. Only interior builder nodes
//! become fat nodes; leaves are folded into their parent's child slot.
//!
//! Child link encoding:
//! - `link >= 0`: index of a fat node
//! - `link < 0`: leaf whose first face is `-(link + 1)`, `count` faces long
//! - `count == 0` on a leaf link: empty slot

use bytemuck::{Pod, Zeroable};

use super::{Bvh, NodeKind};
use crate::util::{BBox, Error, Result};

/// Two-child node, 64 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FatNode {
    pub lmin: [f32; 3],
    pub lchild: i32,
    pub lmax: [f32; 3],
    pub lcount: i32,
    pub rmin: [f32; 3],
    pub rchild: i32,
    pub rmax: [f32; 3],
    pub rcount: i32,
}

/// Triangle record resolved against the world vertex array, 32 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Face {
    /// Global vertex indices.
    pub idx: [i32; 3],
    /// Owning shape id.
    pub shapeidx: i32,
    /// Face index local to the (base) mesh.
    pub id: i32,
    pub pad: [i32; 3],
}

/// Link meaning "no child".
pub const EMPTY_LINK: i32 = -1;

/// Header words preceding the node array in the device blob.
pub const HEADER_WORDS: usize = 4;

#[derive(Debug, Clone, Copy)]
struct Slot {
    bounds: BBox,
    link: i32,
    count: i32,
}

impl Slot {
    const EMPTY: Self = Self {
        bounds: BBox::EMPTY,
        link: EMPTY_LINK,
        count: 0,
    };
}

fn make_node(l: Slot, r: Slot) -> FatNode {
    FatNode {
        lmin: l.bounds.min.to_array(),
        lchild: l.link,
        lmax: l.bounds.max.to_array(),
        lcount: l.count,
        rmin: r.bounds.min.to_array(),
        rchild: r.link,
        rmax: r.bounds.max.to_array(),
        rcount: r.count,
    }
}

/// Translated hierarchy plus its face table.
#[derive(Debug, Clone, Default)]
pub struct FatBvh {
    nodes: Vec<FatNode>,
    faces: Vec<Face>,
    num_indices: usize,
}

impl FatBvh {
    /// Lay out `bvh` as fat nodes. Faces are injected afterwards.
    pub fn translate(bvh: &Bvh) -> Self {
        let src = bvh.nodes();
        let num_indices = bvh.num_indices();

        let Some(root) = src.first() else {
            return Self {
                nodes: vec![make_node(Slot::EMPTY, Slot::EMPTY)],
                faces: Vec::new(),
                num_indices,
            };
        };

        if let NodeKind::Leaf { first, count } = root.kind {
            let leaf = Slot {
                bounds: root.bounds,
                link: -(first as i32) - 1,
                count: count as i32,
            };
            return Self {
                nodes: vec![make_node(leaf, Slot::EMPTY)],
                faces: Vec::new(),
                num_indices,
            };
        }

        // Builder order is depth-first, so interior nodes keep their relative
        // order and the root stays at 0.
        let mut remap = vec![-1i32; src.len()];
        let mut next = 0i32;
        for (i, node) in src.iter().enumerate() {
            if !node.is_leaf() {
                remap[i] = next;
                next += 1;
            }
        }

        let slot = |child: u32| -> Slot {
            let node = &src[child as usize];
            match node.kind {
                NodeKind::Internal { .. } => Slot {
                    bounds: node.bounds,
                    link: remap[child as usize],
                    count: 0,
                },
                NodeKind::Leaf { first, count } => Slot {
                    bounds: node.bounds,
                    link: -(first as i32) - 1,
                    count: count as i32,
                },
            }
        };

        let nodes = src
            .iter()
            .filter_map(|node| match node.kind {
                NodeKind::Internal { left, right } => Some(make_node(slot(left), slot(right))),
                NodeKind::Leaf { .. } => None,
            })
            .collect();

        Self {
            nodes,
            faces: Vec::new(),
            num_indices,
        }
    }

    /// Attach the face table; `faces[i]` is the face for the builder's `indices()[i]`.
    pub fn inject_indices(&mut self, faces: Vec<Face>) -> Result<()> {
        if faces.len() != self.num_indices {
            return Err(Error::invalid(format!(
                "face table has {} entries, hierarchy references {}",
                faces.len(),
                self.num_indices
            )));
        }
        self.faces = faces;
        Ok(())
    }

    pub fn nodes(&self) -> &[FatNode] {
        &self.nodes
    }

    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    /// Device blob: 16-byte header (node count, face count, 0, 0), nodes, faces.
    pub fn to_blob(&self) -> Vec<u8> {
        let header: [u32; HEADER_WORDS] = [self.nodes.len() as u32, self.faces.len() as u32, 0, 0];
        let mut blob = Vec::with_capacity(self.blob_size());
        blob.extend_from_slice(bytemuck::cast_slice(&header));
        blob.extend_from_slice(bytemuck::cast_slice(&self.nodes));
        blob.extend_from_slice(bytemuck::cast_slice(&self.faces));
        blob
    }

    pub fn blob_size(&self) -> usize {
        HEADER_WORDS * 4
            + self.nodes.len() * std::mem::size_of::<FatNode>()
            + self.faces.len() * std::mem::size_of::<Face>()
    }
}

/// Borrowed view of a device blob.
#[derive(Debug, Clone, Copy)]
pub struct BlobView<'a> {
    pub nodes: &'a [FatNode],
    pub faces: &'a [Face],
}

/// Split a word-aligned blob back into nodes and faces.
pub fn parse_blob(words: &[u32]) -> Result<BlobView<'_>> {
    if words.len() < HEADER_WORDS {
        return Err(Error::invalid("bvh blob shorter than its header"));
    }
    let node_words = words[0] as usize * std::mem::size_of::<FatNode>() / 4;
    let face_words = words[1] as usize * std::mem::size_of::<Face>() / 4;
    let end = HEADER_WORDS + node_words + face_words;
    if words.len() < end {
        return Err(Error::invalid(format!(
            "bvh blob holds {} words, header describes {}",
            words.len(),
            end
        )));
    }
    let nodes = bytemuck::try_cast_slice(&words[HEADER_WORDS..HEADER_WORDS + node_words])
        .map_err(|e| Error::invalid(format!("bvh nodes: {e}")))?;
    let faces = bytemuck::try_cast_slice(&words[HEADER_WORDS + node_words..end])
        .map_err(|e| Error::invalid(format!("bvh faces: {e}")))?;
    Ok(BlobView { nodes, faces })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::{BuildSettings, Bvh};
    use crate::util::Vec3;

    fn boxes(n: usize) -> Vec<BBox> {
        (0..n)
            .map(|i| BBox::new(Vec3::new(i as f32 * 2.0, 0.0, 0.0), Vec3::new(i as f32 * 2.0 + 1.0, 1.0, 1.0)))
            .collect()
    }

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<FatNode>(), 64);
        assert_eq!(std::mem::size_of::<Face>(), 32);
    }

    #[test]
    fn test_empty_tree() {
        let fat = FatBvh::translate(&Bvh::default());
        assert_eq!(fat.nodes().len(), 1);
        assert_eq!(fat.nodes()[0].lcount, 0);
        assert_eq!(fat.nodes()[0].rcount, 0);
        assert!(fat.faces().is_empty());
    }

    #[test]
    fn test_root_leaf() {
        let bvh = Bvh::build(&boxes(1), &BuildSettings::default());
        let fat = FatBvh::translate(&bvh);
        assert_eq!(fat.nodes().len(), 1);
        assert_eq!(fat.nodes()[0].lchild, -1);
        assert_eq!(fat.nodes()[0].lcount, 1);
        assert_eq!(fat.nodes()[0].rcount, 0);
    }

    #[test]
    fn test_links() {
        let bvh = Bvh::build(&boxes(4), &BuildSettings::default());
        let fat = FatBvh::translate(&bvh);
        // 4 leaves under 3 interior nodes
        assert_eq!(fat.nodes().len(), 3);
        let root = fat.nodes()[0];
        assert_eq!((root.lchild, root.rchild), (1, 2));
        for node in &fat.nodes()[1..] {
            assert!(node.lchild < 0 && node.rchild < 0);
            assert_eq!((node.lcount, node.rcount), (1, 1));
        }
        // Leaf links cover every face slot exactly once
        let mut firsts: Vec<i32> = fat.nodes()[1..]
            .iter()
            .flat_map(|n| [-(n.lchild + 1), -(n.rchild + 1)])
            .collect();
        firsts.sort_unstable();
        assert_eq!(firsts, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_inject_length_checked() {
        let bvh = Bvh::build(&boxes(3), &BuildSettings::default());
        let mut fat = FatBvh::translate(&bvh);
        assert!(fat.inject_indices(vec![Face::zeroed(); 2]).is_err());
        assert!(fat.inject_indices(vec![Face::zeroed(); 3]).is_ok());
    }

    #[test]
    fn test_blob_round_trip() {
        let bvh = Bvh::build(&boxes(5), &BuildSettings::default());
        let mut fat = FatBvh::translate(&bvh);
        let faces: Vec<Face> = (0..5)
            .map(|i| Face {
                idx: [i * 3, i * 3 + 1, i * 3 + 2],
                shapeidx: 7,
                id: i,
                pad: [0; 3],
            })
            .collect();
        fat.inject_indices(faces.clone()).unwrap();

        let blob = fat.to_blob();
        assert_eq!(blob.len(), fat.blob_size());
        let words: Vec<u32> = bytemuck::pod_collect_to_vec(&blob);
        let view = parse_blob(&words).unwrap();
        assert_eq!(view.nodes, fat.nodes());
        assert_eq!(view.faces, &faces[..]);
        assert!(parse_blob(&words[..6]).is_err());
    }
}
