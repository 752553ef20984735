//! Tag trees for packet header coding (ISO/IEC 15444-1 B.10.2).
//!
//! A tag tree codes a 2-D array of small integers as a quad-tree of
//! running minima, queried leaf by leaf against a growing threshold. The
//! packet coder uses one per precinct for first-inclusion layers and one
//! for missing bit-plane counts.

use crate::bio::{BitReader, BitWriter};

#[derive(Clone, Debug)]
struct TagNode {
    value: i32,
    low: i32,
    known: bool,
    parent: Option<usize>,
}

impl Default for TagNode {
    fn default() -> Self {
        Self {
            value: 99999,
            low: 0,
            known: false,
            parent: None,
        }
    }
}

/// Quad-tree over a `w` x `h` leaf grid, leaves in row-major order,
/// each level half the size of the one below, up to a single root.
#[derive(Debug)]
pub struct TagTree {
    nodes: Vec<TagNode>,
    num_leaves: usize,
}

impl TagTree {
    pub fn new(w: usize, h: usize) -> Self {
        let mut nodes: Vec<TagNode> = vec![TagNode::default(); w * h];
        let mut level_start = 0;
        let mut level_w = w;
        let mut level_h = h;
        while level_w > 1 || level_h > 1 {
            let next_w = level_w.div_ceil(2);
            let next_h = level_h.div_ceil(2);
            let next_start = nodes.len();
            nodes.extend(std::iter::repeat_with(TagNode::default).take(next_w * next_h));
            for y in 0..level_h {
                for x in 0..level_w {
                    let child = level_start + y * level_w + x;
                    let parent = next_start + (y / 2) * next_w + (x / 2);
                    nodes[child].parent = Some(parent);
                }
            }
            level_start = next_start;
            level_w = next_w;
            level_h = next_h;
        }
        Self {
            nodes,
            num_leaves: w * h,
        }
    }

    /// Clears values and coding state, keeping the tree shape.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.value = 99999;
            node.low = 0;
            node.known = false;
        }
    }

    /// Records a leaf value, propagating the running minimum upward.
    pub fn set_value(&mut self, leafno: usize, value: i32) {
        let mut idx = Some(leafno);
        while let Some(i) = idx {
            let node = &mut self.nodes[i];
            if node.value <= value {
                break;
            }
            node.value = value;
            idx = node.parent;
        }
    }

    fn path_to_root(&self, leafno: usize) -> (usize, Vec<usize>) {
        debug_assert!(leafno < self.num_leaves);
        let mut stack = Vec::with_capacity(16);
        let mut idx = leafno;
        while let Some(parent) = self.nodes[idx].parent {
            stack.push(idx);
            idx = parent;
        }
        (idx, stack)
    }

    /// Emits the bits that resolve whether the leaf value is below
    /// `threshold`, given everything already emitted for this tree.
    pub fn encode(&mut self, bio: &mut BitWriter, leafno: usize, threshold: i32) {
        let (mut idx, mut stack) = self.path_to_root(leafno);
        let mut low = 0;
        loop {
            let node = &mut self.nodes[idx];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold {
                if low >= node.value {
                    if !node.known {
                        bio.put_bit(1);
                        node.known = true;
                    }
                    break;
                }
                bio.put_bit(0);
                low += 1;
            }
            node.low = low;
            match stack.pop() {
                Some(next) => idx = next,
                None => break,
            }
        }
    }

    /// Consumes bits until the leaf is resolved against `threshold`;
    /// returns whether its value is known to be below it.
    pub fn decode(
        &mut self,
        bio: &mut BitReader,
        leafno: usize,
        threshold: i32,
    ) -> Result<bool, ()> {
        let (mut idx, mut stack) = self.path_to_root(leafno);
        let mut low = 0;
        loop {
            let node = &mut self.nodes[idx];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold && low < node.value {
                if bio.get_bit()? == 1 {
                    node.value = low;
                } else {
                    low += 1;
                }
            }
            node.low = low;
            match stack.pop() {
                Some(next) => idx = next,
                None => break,
            }
        }
        Ok(self.nodes[leafno].value < threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_shape() {
        let tree = TagTree::new(3, 3);
        // 9 leaves, a 2x2 inner level, one root.
        assert_eq!(tree.nodes.len(), 14);
        assert_eq!(tree.nodes[0].parent, Some(9));
        assert_eq!(tree.nodes[8].parent, Some(12));
        assert_eq!(tree.nodes[13].parent, None);
    }

    #[test]
    fn test_minimum_propagates_to_root() {
        let mut tree = TagTree::new(2, 2);
        tree.set_value(0, 7);
        tree.set_value(1, 3);
        tree.set_value(2, 5);
        tree.set_value(3, 4);
        assert_eq!(tree.nodes[4].value, 3);
    }

    #[test]
    fn test_round_trip_interleaved_thresholds() {
        // Queries interleave leaves and thresholds the way layered packet
        // headers do; encoder and decoder must stay in lock step.
        let values = [1, 3, 2, 0];
        let mut enc = TagTree::new(2, 2);
        for (leaf, &v) in values.iter().enumerate() {
            enc.set_value(leaf, v);
        }
        let mut w = BitWriter::new();
        for threshold in 1..=4 {
            for leaf in 0..4 {
                enc.encode(&mut w, leaf, threshold);
            }
        }
        let bytes = w.finish();

        let mut dec = TagTree::new(2, 2);
        let mut r = BitReader::new(&bytes);
        for threshold in 1..=4 {
            for (leaf, &v) in values.iter().enumerate() {
                let hit = dec.decode(&mut r, leaf, threshold).unwrap();
                assert_eq!(hit, v < threshold, "leaf {leaf} threshold {threshold}");
            }
        }
    }

    #[test]
    fn test_probe_recovers_exact_value() {
        // The missing bit-plane count is read back by probing with
        // increasing thresholds until the leaf resolves.
        let mut enc = TagTree::new(1, 1);
        enc.set_value(0, 5);
        let mut w = BitWriter::new();
        enc.encode(&mut w, 0, 999);
        let bytes = w.finish();

        let mut dec = TagTree::new(1, 1);
        let mut r = BitReader::new(&bytes);
        let mut i = 0;
        while !dec.decode(&mut r, 0, i + 1).unwrap() {
            i += 1;
        }
        assert_eq!(i, 5);
    }
}
