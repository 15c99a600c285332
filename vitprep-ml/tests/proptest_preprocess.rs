//! Property-based tests for calibration preprocessing using proptest.

use image::{Rgb, RgbImage};
use proptest::prelude::*;

use vitprep_core::ImageSize;
use vitprep_ml::calibration::{Normalization, preprocess_rgb};

fn arb_image() -> impl Strategy<Value = RgbImage> {
    (1u32..24, 1u32..24).prop_flat_map(|(w, h)| {
        proptest::collection::vec(any::<u8>(), (w * h * 3) as usize)
            .prop_map(move |pixels| RgbImage::from_raw(w, h, pixels).unwrap())
    })
}

// --- Value range properties ---

proptest! {
    #[test]
    fn values_stay_within_channel_bounds(
        img in arb_image(),
        width in 1u32..32,
        height in 1u32..32,
    ) {
        let norm = Normalization::IMAGENET;
        let tensor = preprocess_rgb(&img, ImageSize { width, height }, &norm);
        prop_assert_eq!(tensor.shape(), &[1, 3, height as usize, width as usize]);
        for ((_, c, _, _), v) in tensor.indexed_iter() {
            let (lo, hi) = norm.bounds(c);
            prop_assert!(v.is_finite());
            prop_assert!(*v >= lo - 1e-5 && *v <= hi + 1e-5, "channel {} value {} outside [{}, {}]", c, v, lo, hi);
        }
    }

    #[test]
    fn uniform_image_maps_to_uniform_channels(
        r in any::<u8>(),
        g in any::<u8>(),
        b in any::<u8>(),
        edge in 1u32..16,
    ) {
        let norm = Normalization::IMAGENET;
        let img = RgbImage::from_pixel(edge + 3, edge, Rgb([r, g, b]));
        let tensor = preprocess_rgb(&img, ImageSize { width: edge, height: edge }, &norm);
        for ((_, c, _, _), v) in tensor.indexed_iter() {
            let expected = norm.apply(c, [r, g, b][c]);
            prop_assert!((v - expected).abs() < 0.02);
        }
    }
}

// --- Normalization properties ---

proptest! {
    #[test]
    fn normalization_is_monotonic(a in any::<u8>(), b in any::<u8>(), c in 0usize..3) {
        let norm = Normalization::IMAGENET;
        prop_assume!(a < b);
        prop_assert!(norm.apply(c, a) < norm.apply(c, b));
    }
}
