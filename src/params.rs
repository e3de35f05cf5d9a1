//! Generation parameters shared by every node of a function tree.

use serde::{Deserialize, Serialize};

/// Depth and width bounds that shape a function tree.
///
/// `depth` counts the decomposition levels that remain below this node;
/// a node with `depth == 0` is a leaf. Widths bound how many tasks a
/// branch or leaf function may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub depth: u32,
    pub branch_min_width: u32,
    pub branch_max_width: u32,
    pub leaf_min_width: u32,
    pub leaf_max_width: u32,
}

impl GenerationParameters {
    /// Build parameters, clamping widths to at least 1 and swapping
    /// out-of-order bounds so that `min <= max` holds for both tiers.
    pub fn new(
        depth: u32,
        branch_min_width: u32,
        branch_max_width: u32,
        leaf_min_width: u32,
        leaf_max_width: u32,
    ) -> Self {
        let (branch_min_width, branch_max_width) = ordered(branch_min_width, branch_max_width);
        let (leaf_min_width, leaf_max_width) = ordered(leaf_min_width, leaf_max_width);
        Self {
            depth,
            branch_min_width,
            branch_max_width,
            leaf_min_width,
            leaf_max_width,
        }
    }

    /// Re-apply the construction invariants, e.g. after deserializing
    /// hand-edited parameters.
    pub fn normalized(self) -> Self {
        Self::new(
            self.depth,
            self.branch_min_width,
            self.branch_max_width,
            self.leaf_min_width,
            self.leaf_max_width,
        )
    }

    pub fn is_leaf(&self) -> bool {
        self.depth == 0
    }

    /// Parameters for a child one level further down the tree.
    pub fn child(&self) -> Self {
        Self {
            depth: self.depth.saturating_sub(1),
            ..*self
        }
    }

    /// The inclusive task-count bounds that apply at this depth.
    pub fn width_bounds(&self) -> (u32, u32) {
        if self.is_leaf() {
            (self.leaf_min_width, self.leaf_max_width)
        } else {
            (self.branch_min_width, self.branch_max_width)
        }
    }
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self::new(1, 2, 4, 2, 4)
    }
}

fn ordered(a: u32, b: u32) -> (u32, u32) {
    let a = a.max(1);
    let b = b.max(1);
    if a <= b { (a, b) } else { (b, a) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_widths_are_swapped() {
        let params = GenerationParameters::new(2, 9, 3, 7, 1);
        assert_eq!(params.branch_min_width, 3);
        assert_eq!(params.branch_max_width, 9);
        assert_eq!(params.leaf_min_width, 1);
        assert_eq!(params.leaf_max_width, 7);
    }

    #[test]
    fn test_zero_widths_clamp_to_one() {
        let params = GenerationParameters::new(0, 0, 0, 0, 5);
        assert_eq!(params.branch_min_width, 1);
        assert_eq!(params.branch_max_width, 1);
        assert_eq!(params.leaf_min_width, 1);
        assert_eq!(params.leaf_max_width, 5);
    }

    #[test]
    fn test_min_le_max_for_many_inputs() {
        for a in 0..6 {
            for b in 0..6 {
                let params = GenerationParameters::new(1, a, b, b, a);
                assert!(params.branch_min_width <= params.branch_max_width);
                assert!(params.leaf_min_width <= params.leaf_max_width);
            }
        }
    }

    #[test]
    fn test_child_decrements_depth_and_saturates() {
        let params = GenerationParameters::new(1, 2, 3, 4, 5);
        let child = params.child();
        assert_eq!(child.depth, 0);
        assert!(child.is_leaf());
        assert_eq!(child.child().depth, 0);
        assert_eq!(child.branch_max_width, 3);
    }

    #[test]
    fn test_width_bounds_follow_tier() {
        let params = GenerationParameters::new(1, 2, 3, 4, 5);
        assert_eq!(params.width_bounds(), (2, 3));
        assert_eq!(params.child().width_bounds(), (4, 5));
    }

    #[test]
    fn test_normalized_repairs_deserialized_values() {
        let raw: GenerationParameters = serde_json::from_str(
            r#"{"depth":1,"branch_min_width":5,"branch_max_width":2,"leaf_min_width":0,"leaf_max_width":0}"#,
        )
        .unwrap();
        let fixed = raw.normalized();
        assert_eq!((fixed.branch_min_width, fixed.branch_max_width), (2, 5));
        assert_eq!((fixed.leaf_min_width, fixed.leaf_max_width), (1, 1));
    }
}
