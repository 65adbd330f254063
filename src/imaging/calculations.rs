//! Pure calculation functions for rendition dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

/// Fit `source` inside a square of `long_edge`, preserving aspect ratio.
///
/// Never upscales: a source already within the bound keeps its size.
///
/// # Examples
/// ```
/// # use gallery_renditions::imaging::fit_long_edge;
/// assert_eq!(fit_long_edge((4000, 3000), 1280), (1280, 960));
/// assert_eq!(fit_long_edge((3000, 4000), 1280), (960, 1280));
/// assert_eq!(fit_long_edge((800, 600), 1280), (800, 600));
/// ```
pub fn fit_long_edge(source: (u32, u32), long_edge: u32) -> (u32, u32) {
    let (src_w, src_h) = source;
    let longer = src_w.max(src_h);
    if longer <= long_edge || longer == 0 {
        return source;
    }
    let ratio = long_edge as f64 / longer as f64;
    if src_w >= src_h {
        // Landscape or square
        (long_edge, ((src_h as f64 * ratio).round() as u32).max(1))
    } else {
        // Portrait
        (((src_w as f64 * ratio).round() as u32).max(1), long_edge)
    }
}

/// Largest `aspect` box that fits inside `source`.
///
/// This is the centre crop a thumbnail takes before any scaling.
pub fn crop_box(source: (u32, u32), aspect: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = source;
    let (aspect_w, aspect_h) = aspect;
    let src_aspect = src_w as f64 / src_h as f64;
    let tgt_aspect = aspect_w as f64 / aspect_h as f64;

    if src_aspect > tgt_aspect {
        // Source is wider: full height, trimmed width
        let w = (src_h as f64 * tgt_aspect).round() as u32;
        (w.clamp(1, src_w), src_h)
    } else {
        // Source is taller: full width, trimmed height
        let h = (src_w as f64 / tgt_aspect).round() as u32;
        (src_w, h.clamp(1, src_h))
    }
}

/// Thumbnail dimensions: the centre crop, scaled down to `long_edge`.
///
/// # Examples
/// ```
/// # use gallery_renditions::imaging::thumbnail_dimensions;
/// // 4:3 landscape to a square 256 thumbnail
/// assert_eq!(thumbnail_dimensions((4000, 3000), (1, 1), 256), (256, 256));
/// // Small sources are cropped but not enlarged
/// assert_eq!(thumbnail_dimensions((200, 100), (1, 1), 256), (100, 100));
/// ```
pub fn thumbnail_dimensions(source: (u32, u32), aspect: (u32, u32), long_edge: u32) -> (u32, u32) {
    fit_long_edge(crop_box(source, aspect), long_edge)
}

/// The class's long edge after the plan's resolution cap.
pub fn capped_long_edge(class_edge: u32, max_resolution: Option<u32>) -> u32 {
    max_resolution.map_or(class_edge, |cap| class_edge.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // fit_long_edge tests
    // =========================================================================

    #[test]
    fn fit_landscape() {
        // 2000x1500, target 1000 on the longer edge
        assert_eq!(fit_long_edge((2000, 1500), 1000), (1000, 750));
    }

    #[test]
    fn fit_portrait() {
        assert_eq!(fit_long_edge((1500, 2000), 1000), (750, 1000));
    }

    #[test]
    fn fit_never_upscales() {
        assert_eq!(fit_long_edge((500, 400), 2048), (500, 400));
        assert_eq!(fit_long_edge((2048, 100), 2048), (2048, 100));
    }

    #[test]
    fn fit_keeps_extreme_strips_visible() {
        // 10000x10 panorama to 256: height rounds to 0 without the floor
        assert_eq!(fit_long_edge((10000, 10), 256), (256, 1));
    }

    // =========================================================================
    // crop_box tests
    // =========================================================================

    #[test]
    fn crop_wider_source_to_square() {
        assert_eq!(crop_box((800, 600), (1, 1)), (600, 600));
    }

    #[test]
    fn crop_taller_source_to_square() {
        assert_eq!(crop_box((600, 800), (1, 1)), (600, 600));
    }

    #[test]
    fn crop_to_portrait_aspect() {
        // 800x600 to 4:5 → full height 600, width 480
        assert_eq!(crop_box((800, 600), (4, 5)), (480, 600));
    }

    #[test]
    fn crop_same_aspect_is_identity() {
        assert_eq!(crop_box((800, 600), (4, 3)), (800, 600));
    }

    // =========================================================================
    // thumbnail_dimensions / capped_long_edge tests
    // =========================================================================

    #[test]
    fn thumbnail_landscape_to_wide_aspect() {
        // 16:9 crop of 4000x3000 is 4000x2250, scaled to 256 long edge
        assert_eq!(thumbnail_dimensions((4000, 3000), (16, 9), 256), (256, 144));
    }

    #[test]
    fn cap_applies_only_when_smaller() {
        assert_eq!(capped_long_edge(2048, Some(1280)), 1280);
        assert_eq!(capped_long_edge(640, Some(1280)), 640);
        assert_eq!(capped_long_edge(2048, None), 2048);
    }
}
