//! SSD anchor centers for the 192x192 MediaPipe palm detector.

use std::sync::OnceLock;

use crate::pipeline::detector::common::PALM_INPUT_SIZE;

const STRIDES: [u32; 4] = [8, 16, 16, 16];
const ANCHORS_PER_LAYER: usize = 2;
const ANCHOR_OFFSET: f32 = 0.5;

pub const NUM_ANCHORS: usize = 2016;

/// Anchor centers `[cx, cy]` in normalized input coordinates. The palm model
/// uses fixed-size anchors, so width and height are always 1.
pub fn anchors() -> &'static [[f32; 2]] {
    static ANCHORS: OnceLock<Vec<[f32; 2]>> = OnceLock::new();
    ANCHORS.get_or_init(|| generate(PALM_INPUT_SIZE))
}

fn generate(input_size: u32) -> Vec<[f32; 2]> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);
    let mut layer = 0;
    while layer < STRIDES.len() {
        let stride = STRIDES[layer];
        // Consecutive layers sharing a stride are emitted together per cell.
        let mut per_cell = 0;
        while layer < STRIDES.len() && STRIDES[layer] == stride {
            per_cell += ANCHORS_PER_LAYER;
            layer += 1;
        }

        let grid = input_size.div_ceil(stride);
        for y in 0..grid {
            let cy = (y as f32 + ANCHOR_OFFSET) / grid as f32;
            for x in 0..grid {
                let cx = (x as f32 + ANCHOR_OFFSET) / grid as f32;
                anchors.extend(std::iter::repeat_n([cx, cy], per_cell));
            }
        }
    }
    anchors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: [f32; 2], b: [f32; 2]) -> bool {
        (a[0] - b[0]).abs() < 1e-6 && (a[1] - b[1]).abs() < 1e-6
    }

    #[test]
    fn anchor_count_matches_model_outputs() {
        assert_eq!(anchors().len(), NUM_ANCHORS);
    }

    #[test]
    fn fine_grid_comes_first() {
        let anchors = anchors();
        let step = 1.0 / 24.0;

        assert!(close(anchors[0], [0.5 * step, 0.5 * step]));
        assert_eq!(anchors[1], anchors[0]);
        assert!(close(anchors[2], [1.5 * step, 0.5 * step]));
    }

    #[test]
    fn coarse_grid_groups_six_per_cell() {
        let anchors = anchors();
        let coarse = &anchors[24 * 24 * 2..];
        let step = 1.0 / 12.0;

        assert_eq!(coarse.len(), 12 * 12 * 6);
        assert!(coarse[..6].iter().all(|a| close(*a, [0.5 * step, 0.5 * step])));
        assert!(close(coarse[6], [1.5 * step, 0.5 * step]));
    }
}
