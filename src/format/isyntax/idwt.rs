//! Inverse discrete wavelet transform for iSyntax tiles.
//!
//! A tile's coefficients live in four quadrants (LL, HL, LH, HH) of a padded
//! workspace. The reversible integer 5/3 lifting transform is applied per
//! row, then per column, doubling the resolution. Because the 5/3 filter
//! reaches across sample boundaries, each quadrant is stitched with margins
//! sampled from the corresponding quadrants of the eight neighbouring tiles;
//! at the image edge the margins come from *dummy* coefficients (white for
//! the luminance LL quadrant, black otherwise).
//!
//! The four de-margined quadrants of the result become the LL inputs of the
//! four child tiles one level down — higher-resolution tiles never re-read
//! low-frequency data from the file.
//!
//! All arithmetic is signed 32-bit integer; no floating point enters the
//! transform.

use super::hulsken::absolute_value_block;

/// Left padding of each stitched quadrant, in coefficient samples.
pub const IDWT_PAD_L: usize = 3;

/// Right padding of each stitched quadrant.
pub const IDWT_PAD_R: usize = 4;

/// First row/column of the transformed workspace that holds valid pixels.
pub const IDWT_FIRST_VALID_PIXEL: usize = 2 * IDWT_PAD_L + 1;

/// Column strip width for the vertical lifting pass.
pub const PARALLEL_COLS_53: usize = 8;

// =============================================================================
// 1-D lifting
// =============================================================================

/// Undo the 5/3 lifting steps over an interleaved signal of 2N samples
/// where even positions hold the high band and odd positions the low band.
///
/// Boundary samples clamp to the nearest in-range band sample.
fn lift_53(a: &mut [i32], n: usize) {
    debug_assert!(a.len() >= 2 * n);
    if n == 0 {
        return;
    }

    // Undo the update step on the low band (odd positions)
    for i in 0..n {
        let h0 = a[2 * i];
        let h1 = a[2 * (i + 1).min(n - 1)];
        a[2 * i + 1] -= (h0 + h1 + 2) >> 2;
    }

    // Undo the predict step on the high band (even positions)
    for i in 0..n {
        let l0 = a[2 * i.saturating_sub(1) + 1];
        let l1 = a[2 * i + 1];
        a[2 * i] += (l0 + l1) >> 1;
    }
}

/// Horizontal pass: each row's halves ([low | high]) are interleaved and
/// lifted in place.
fn horizontal_pass(workspace: &mut [i32], quadrant_w: usize, full_w: usize, full_h: usize) {
    let mut temp = vec![0i32; full_w];
    for y in 0..full_h {
        let row = &mut workspace[y * full_w..(y + 1) * full_w];
        for i in 0..quadrant_w {
            temp[2 * i] = row[quadrant_w + i];
            temp[2 * i + 1] = row[i];
        }
        lift_53(&mut temp, quadrant_w);
        row.copy_from_slice(&temp);
    }
}

/// Vertical pass, processed in strips of [`PARALLEL_COLS_53`] columns so the
/// inner loops run over contiguous lanes.
fn vertical_pass(workspace: &mut [i32], quadrant_h: usize, full_w: usize) {
    let mut x = 0;
    while x < full_w {
        let cols = PARALLEL_COLS_53.min(full_w - x);
        vertical_strip(workspace, quadrant_h, full_w, x, cols);
        x += cols;
    }
}

fn vertical_strip(
    workspace: &mut [i32],
    quadrant_h: usize,
    full_w: usize,
    x0: usize,
    cols: usize,
) {
    let full_h = quadrant_h * 2;
    let mut temp = vec![0i32; full_h * cols];

    // Interleave: top half rows are the low band, bottom half the high band
    for i in 0..quadrant_h {
        for c in 0..cols {
            temp[(2 * i) * cols + c] = workspace[(quadrant_h + i) * full_w + x0 + c];
            temp[(2 * i + 1) * cols + c] = workspace[i * full_w + x0 + c];
        }
    }

    // Undo update on low rows
    for i in 0..quadrant_h {
        let i1 = (i + 1).min(quadrant_h - 1);
        for c in 0..cols {
            let h0 = temp[(2 * i) * cols + c];
            let h1 = temp[(2 * i1) * cols + c];
            temp[(2 * i + 1) * cols + c] -= (h0 + h1 + 2) >> 2;
        }
    }

    // Undo predict on high rows
    for i in 0..quadrant_h {
        let im1 = i.saturating_sub(1);
        for c in 0..cols {
            let l0 = temp[(2 * im1 + 1) * cols + c];
            let l1 = temp[(2 * i + 1) * cols + c];
            temp[(2 * i) * cols + c] += (l0 + l1) >> 1;
        }
    }

    for y in 0..full_h {
        for c in 0..cols {
            workspace[y * full_w + x0 + c] = temp[y * cols + c];
        }
    }
}

/// Apply the full 2-D inverse transform to a stitched workspace of
/// `2*quadrant x 2*quadrant` samples (horizontal, then vertical).
pub fn idwt_2d(workspace: &mut [i32], quadrant_w: usize, quadrant_h: usize) {
    let full_w = quadrant_w * 2;
    let full_h = quadrant_h * 2;
    debug_assert_eq!(workspace.len(), full_w * full_h);

    horizontal_pass(workspace, quadrant_w, full_w, full_h);
    vertical_pass(workspace, quadrant_h, full_w);
}

// =============================================================================
// Stitching
// =============================================================================

/// Coefficients of one tile's colour channel, as the stitcher sees them.
#[derive(Clone, Copy, Default)]
pub struct NeighborCoeffs<'a> {
    /// LL plane (`block_w * block_h` samples), absent until donated/loaded
    pub ll: Option<&'a [i16]>,
    /// Stacked HL/LH/HH planes (`3 * block_w * block_h` samples)
    pub h: Option<&'a [i16]>,
}

/// The 3x3 neighbourhood handed to the stitcher; `[1][1]` is the centre
/// tile. `None` marks an off-image position (margins stay at the dummy
/// fill).
pub type Neighborhood<'a> = [[Option<NeighborCoeffs<'a>>; 3]; 3];

/// Dummy coefficient used for missing luminance LL margins (renders white).
pub const DUMMY_WHITE: i16 = 255;

/// Dummy coefficient for all other missing margins.
pub const DUMMY_BLACK: i16 = 0;

/// Build the padded, stitched workspace for one colour channel and run the
/// inverse transform over it.
///
/// `ll_dummy` is [`DUMMY_WHITE`] for the luminance channel and
/// [`DUMMY_BLACK`] otherwise. The returned workspace is
/// `2*(block_w+P) x 2*(block_h+P)` where `P = IDWT_PAD_L + IDWT_PAD_R`.
pub fn transform_channel(
    neighborhood: &Neighborhood<'_>,
    block_w: usize,
    block_h: usize,
    ll_dummy: i16,
) -> Vec<i32> {
    let pad = IDWT_PAD_L + IDWT_PAD_R;
    let quadrant_w = block_w + pad;
    let quadrant_h = block_h + pad;
    let full_w = 2 * quadrant_w;
    let full_h = 2 * quadrant_h;

    let mut workspace = vec![0i32; full_w * full_h];

    // Prefill the LL quadrant with the dummy so off-image margins read as
    // background; the three detail quadrants stay zero.
    if ll_dummy != 0 {
        for y in 0..quadrant_h {
            let row = y * full_w;
            for x in 0..quadrant_w {
                workspace[row + x] = ll_dummy as i32;
            }
        }
    }

    // Quadrant origins: LL | HL over LH | HH
    let quadrant_origin = [
        0,
        quadrant_w,
        quadrant_h * full_w,
        quadrant_h * full_w + quadrant_w,
    ];

    let block_stride = block_w * block_h;

    for dy in 0..3 {
        // Dest/source geometry per neighbour row
        let (dest_y, copy_h, src_y) = match dy {
            0 => (0, IDWT_PAD_L, block_h - IDWT_PAD_R),
            1 => (IDWT_PAD_L, block_h, 0),
            _ => (IDWT_PAD_L + block_h, IDWT_PAD_R, 0),
        };
        for dx in 0..3 {
            let (dest_x, copy_w, src_x) = match dx {
                0 => (0, IDWT_PAD_L, block_w - IDWT_PAD_R),
                1 => (IDWT_PAD_L, block_w, 0),
                _ => (IDWT_PAD_L + block_w, IDWT_PAD_R, 0),
            };

            let Some(coeffs) = neighborhood[dy][dx] else {
                continue; // off-image: prefilled dummy stands
            };

            // Kind 0 = LL, kinds 1..3 = HL/LH/HH slices of the H block
            for kind in 0..4 {
                let (source, dummy) = if kind == 0 {
                    (coeffs.ll, ll_dummy)
                } else {
                    (
                        coeffs
                            .h
                            .map(|h| &h[(kind - 1) * block_stride..kind * block_stride]),
                        DUMMY_BLACK,
                    )
                };

                let origin = quadrant_origin[kind] + dest_y * full_w + dest_x;
                match source {
                    Some(plane) => {
                        for y in 0..copy_h {
                            let src_row = (src_y + y) * block_w + src_x;
                            let dst_row = origin + y * full_w;
                            for x in 0..copy_w {
                                workspace[dst_row + x] = plane[src_row + x] as i32;
                            }
                        }
                    }
                    None => {
                        for y in 0..copy_h {
                            let dst_row = origin + y * full_w;
                            for x in 0..copy_w {
                                workspace[dst_row + x] = dummy as i32;
                            }
                        }
                    }
                }
            }
        }
    }

    idwt_2d(&mut workspace, quadrant_w, quadrant_h);
    workspace
}

// =============================================================================
// LL donation and colour recombination
// =============================================================================

/// Cut the four de-margined `block_w x block_h` quadrants out of a
/// transformed workspace. In child order: top-left, top-right, bottom-left,
/// bottom-right; each becomes that child tile's LL plane.
///
/// Coefficients are stored two's-complement 16-bit with saturation.
pub fn extract_child_ll(
    workspace: &[i32],
    block_w: usize,
    block_h: usize,
) -> [Vec<i16>; 4] {
    let pad = IDWT_PAD_L + IDWT_PAD_R;
    let full_w = 2 * (block_w + pad);
    let first = IDWT_FIRST_VALID_PIXEL;

    let origins = [
        (first, first),
        (first, first + block_w),
        (first + block_h, first),
        (first + block_h, first + block_w),
    ];

    origins.map(|(oy, ox)| {
        let mut out = Vec::with_capacity(block_w * block_h);
        for y in 0..block_h {
            let row = (oy + y) * full_w + ox;
            for x in 0..block_w {
                out.push(clamp_i16(workspace[row + x]));
            }
        }
        out
    })
}

#[inline]
fn clamp_i16(v: i32) -> i16 {
    v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Recombine transformed Y/Co/Cg workspaces into a BGRA tile of
/// `2*block_w x 2*block_h` pixels, discarding the padding margins.
///
/// The Y workspace is converted to absolute values first; Co and Cg stay
/// signed. The reversible transform is
/// `t = Y - Cg/2; G = t + Cg; B = t - Co/2; R = B + Co`, each channel
/// clamped to `[0, 255]`.
pub fn recombine_ycocg_to_bgra(
    y_ws: &mut [i32],
    co_ws: &[i32],
    cg_ws: &[i32],
    block_w: usize,
    block_h: usize,
) -> Vec<u8> {
    let pad = IDWT_PAD_L + IDWT_PAD_R;
    let full_w = 2 * (block_w + pad);
    let first = IDWT_FIRST_VALID_PIXEL;
    let tile_w = 2 * block_w;
    let tile_h = 2 * block_h;

    // Luminance wavelets carry no meaningful sign
    absolute_value_i32_block(y_ws);

    let mut bgra = vec![0u8; tile_w * tile_h * 4];
    for y in 0..tile_h {
        let row = (first + y) * full_w + first;
        let dst_row = y * tile_w * 4;
        for x in 0..tile_w {
            let (b, g, r) = ycocg_to_bgr(y_ws[row + x], co_ws[row + x], cg_ws[row + x]);
            let d = dst_row + x * 4;
            bgra[d] = b;
            bgra[d + 1] = g;
            bgra[d + 2] = r;
            bgra[d + 3] = 255;
        }
    }
    bgra
}

fn absolute_value_i32_block(data: &mut [i32]) {
    // Same conversion the i16 path uses, widened
    let mut narrow: Vec<i16> = data.iter().map(|&v| clamp_i16(v)).collect();
    absolute_value_block(&mut narrow);
    for (wide, n) in data.iter_mut().zip(narrow) {
        *wide = n as i32;
    }
}

/// One pixel of the reversible YCoCg inverse, clamped to [0, 255].
/// Returns channels in (B, G, R) order.
#[inline]
pub fn ycocg_to_bgr(y: i32, co: i32, cg: i32) -> (u8, u8, u8) {
    let t = y - cg / 2;
    let g = t + cg;
    let b = t - co / 2;
    let r = b + co;
    (
        b.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        r.clamp(0, 255) as u8,
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // 5/3 round trip
    // -------------------------------------------------------------------------

    /// Forward counterpart of `lift_53` for the round-trip property.
    fn forward_lift_53(a: &mut [i32], n: usize) {
        // Predict on the high band, then update on the low band: the exact
        // mirror of the inverse order.
        for i in (0..n).rev() {
            let l0 = a[2 * i.saturating_sub(1) + 1];
            let l1 = a[2 * i + 1];
            a[2 * i] -= (l0 + l1) >> 1;
        }
        for i in (0..n).rev() {
            let h0 = a[2 * i];
            let h1 = a[2 * (i + 1).min(n - 1)];
            a[2 * i + 1] += (h0 + h1 + 2) >> 2;
        }
    }

    #[test]
    fn test_lift_53_round_trip() {
        // Deterministic pseudo-random samples
        let mut state = 0x12345678u32;
        let mut next = move || {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            ((state >> 16) as i32 % 512) - 256
        };

        for n in [1usize, 2, 3, 8, 16, 33] {
            let original: Vec<i32> = (0..2 * n).map(|_| next()).collect();

            let mut transformed = original.clone();
            forward_lift_53(&mut transformed, n);
            lift_53(&mut transformed, n);

            assert_eq!(transformed, original, "round trip failed for n={n}");
        }
    }

    #[test]
    fn test_idwt_2d_constant_ll_gives_constant_image() {
        // A constant LL band with zero detail bands must reconstruct to a
        // flat image at double resolution.
        let q = 8usize;
        let full = 2 * q;
        let mut ws = vec![0i32; full * full];
        for y in 0..q {
            for x in 0..q {
                ws[y * full + x] = 100;
            }
        }

        idwt_2d(&mut ws, q, q);

        assert!(
            ws.iter().all(|&v| v == 100),
            "expected flat 100, got {:?}",
            &ws[..8]
        );
    }

    // -------------------------------------------------------------------------
    // YCoCg reversibility
    // -------------------------------------------------------------------------

    /// Forward transform matching the inverse's truncating halves.
    fn rgb_to_ycocg(r: i32, g: i32, b: i32) -> (i32, i32, i32) {
        let co = r - b;
        let t = b + co / 2;
        let cg = g - t;
        let y = t + cg / 2;
        (y, co, cg)
    }

    #[test]
    fn test_ycocg_round_trip_is_identity() {
        for r in (0..=255).step_by(15) {
            for g in (0..=255).step_by(15) {
                for b in (0..=255).step_by(15) {
                    let (y, co, cg) = rgb_to_ycocg(r, g, b);
                    let (bb, gg, rr) = ycocg_to_bgr(y, co, cg);
                    assert_eq!(
                        (rr as i32, gg as i32, bb as i32),
                        (r, g, b),
                        "failed for rgb({r},{g},{b})"
                    );
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Stitching and dummy margins
    // -------------------------------------------------------------------------

    #[test]
    fn test_transform_channel_all_dummy_is_flat_white() {
        // A centre tile whose channel has no coefficients at all, with no
        // neighbours: the luminance LL prefill must reconstruct flat white.
        let neighborhood: Neighborhood<'_> = [
            [None, None, None],
            [None, Some(NeighborCoeffs::default()), None],
            [None, None, None],
        ];

        let ws = transform_channel(&neighborhood, 8, 8, DUMMY_WHITE);

        let pad = IDWT_PAD_L + IDWT_PAD_R;
        let full_w = 2 * (8 + pad);
        let first = IDWT_FIRST_VALID_PIXEL;
        for y in 0..16 {
            for x in 0..16 {
                let v = ws[(first + y) * full_w + first + x];
                assert_eq!(v, 255, "pixel ({x},{y}) = {v}");
            }
        }
    }

    #[test]
    fn test_transform_channel_copies_centre_ll() {
        // Constant LL of 42 with zero details reconstructs flat 42 in the
        // valid area.
        let block = 8usize;
        let ll = vec![42i16; block * block];
        let h = vec![0i16; 3 * block * block];

        let centre = NeighborCoeffs {
            ll: Some(&ll),
            h: Some(&h),
        };
        let neighborhood: Neighborhood<'_> = [
            [None, None, None],
            [None, Some(centre), None],
            [None, None, None],
        ];

        let ws = transform_channel(&neighborhood, block, block, DUMMY_BLACK);

        // The outermost valid pixel row/column blends with the (missing)
        // neighbour margins; everything inside it reconstructs exactly.
        let pad = IDWT_PAD_L + IDWT_PAD_R;
        let full_w = 2 * (block + pad);
        let first = IDWT_FIRST_VALID_PIXEL;
        for y in 0..2 * block - 1 {
            for x in 0..2 * block - 1 {
                let v = ws[(first + y) * full_w + first + x];
                assert_eq!(v, 42, "pixel ({x},{y}) = {v}");
            }
        }
    }

    #[test]
    fn test_extract_child_ll_quadrants() {
        let block = 4usize;
        let pad = IDWT_PAD_L + IDWT_PAD_R;
        let full_w = 2 * (block + pad);
        let full_h = full_w;

        // Mark the workspace with a coordinate encoding
        let mut ws = vec![0i32; full_w * full_h];
        for y in 0..full_h {
            for x in 0..full_w {
                ws[y * full_w + x] = (y * 100 + x) as i32;
            }
        }

        let children = extract_child_ll(&ws, block, block);
        let first = IDWT_FIRST_VALID_PIXEL as i32;

        // Top-left child starts at (first, first)
        assert_eq!(children[0][0], (first * 100 + first) as i16);
        // Top-right child starts block_w to the right
        assert_eq!(children[1][0], (first * 100 + first + block as i32) as i16);
        // Bottom-left child starts block_h down
        assert_eq!(children[2][0], ((first + block as i32) * 100 + first) as i16);
        // Bottom-right
        assert_eq!(
            children[3][0],
            ((first + block as i32) * 100 + first + block as i32) as i16
        );

        for child in &children {
            assert_eq!(child.len(), block * block);
        }
    }

    #[test]
    fn test_recombine_flat_grey() {
        let block = 4usize;
        let pad = IDWT_PAD_L + IDWT_PAD_R;
        let full = 2 * (block + pad);

        let mut y_ws = vec![128i32; full * full];
        let co = vec![0i32; full * full];
        let cg = vec![0i32; full * full];

        let bgra = recombine_ycocg_to_bgra(&mut y_ws, &co, &cg, block, block);
        assert_eq!(bgra.len(), 8 * 8 * 4);
        for px in bgra.chunks_exact(4) {
            assert_eq!(px, &[128, 128, 128, 255]);
        }
    }
}
