//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the two operations every backend must
//! support: render (resample one size class) and encode.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend). Tests substitute a
//! recording mock or a backend that fails on a chosen class.

use super::params::{EncodeParams, RenditionSpec};
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
    #[error("Encoding failed: {0}")]
    EncodeFailed(String),
}

/// Trait for image processing backends.
///
/// Implementations are shared across rayon workers, hence `Sync`.
pub trait ImageBackend: Sync {
    /// Resample the oriented source to the spec's exact output dimensions.
    fn render(&self, source: &DynamicImage, spec: &RenditionSpec) -> Result<DynamicImage, BackendError>;

    /// Encode a rendered image to its delivery bytes.
    fn encode(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, BackendError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::imaging::params::{Fit, Quality, Sharpening};
    use crate::types::{RenditionFormat, SizeClass};
    use std::sync::Mutex;

    /// Mock backend that records operations and returns blank canvases.
    /// Uses Mutex (not RefCell) so it is Sync and works with rayon's par_iter.
    #[derive(Default)]
    pub struct MockBackend {
        pub operations: Mutex<Vec<RecordedOp>>,
        /// Classes whose render call fails.
        pub fail_on: Vec<SizeClass>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedOp {
        Render {
            class: SizeClass,
            width: u32,
            height: u32,
            fit: Fit,
            sharpening: Option<(f32, i32)>,
        },
        Encode {
            width: u32,
            height: u32,
            format: RenditionFormat,
            quality: u32,
        },
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_on(class: SizeClass) -> Self {
            Self {
                fail_on: vec![class],
                ..Self::default()
            }
        }

        pub fn get_operations(&self) -> Vec<RecordedOp> {
            self.operations.lock().unwrap().clone()
        }
    }

    impl ImageBackend for MockBackend {
        fn render(&self, _source: &DynamicImage, spec: &RenditionSpec) -> Result<DynamicImage, BackendError> {
            self.operations.lock().unwrap().push(RecordedOp::Render {
                class: spec.class,
                width: spec.width,
                height: spec.height,
                fit: spec.fit,
                sharpening: spec.sharpening.map(|s| (s.sigma, s.threshold)),
            });
            if self.fail_on.contains(&spec.class) {
                return Err(BackendError::ProcessingFailed(format!("mock failure on {}", spec.class)));
            }
            Ok(DynamicImage::new_rgb8(spec.width, spec.height))
        }

        fn encode(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, BackendError> {
            self.operations.lock().unwrap().push(RecordedOp::Encode {
                width: image.width(),
                height: image.height(),
                format: params.format,
                quality: params.quality.value(),
            });
            Ok(vec![0; 16])
        }
    }

    #[test]
    fn mock_records_render() {
        let backend = MockBackend::new();
        let out = backend
            .render(
                &DynamicImage::new_rgb8(800, 600),
                &RenditionSpec {
                    class: SizeClass::Thumbnail,
                    width: 256,
                    height: 256,
                    fit: Fit::Fill,
                    sharpening: Some(Sharpening::light()),
                    watermark: false,
                },
            )
            .unwrap();
        assert_eq!((out.width(), out.height()), (256, 256));

        let ops = backend.get_operations();
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            &ops[0],
            RecordedOp::Render {
                class: SizeClass::Thumbnail,
                fit: Fit::Fill,
                sharpening: Some((0.5, 0)),
                ..
            }
        ));
    }

    #[test]
    fn mock_records_encode() {
        let backend = MockBackend::new();
        backend
            .encode(
                &DynamicImage::new_rgb8(64, 48),
                &EncodeParams {
                    format: RenditionFormat::Avif,
                    quality: Quality::new(70),
                    icc_profile: None,
                },
            )
            .unwrap();
        assert_eq!(
            backend.get_operations(),
            vec![RecordedOp::Encode {
                width: 64,
                height: 48,
                format: RenditionFormat::Avif,
                quality: 70
            }]
        );
    }

    #[test]
    fn mock_fails_on_chosen_class() {
        let backend = MockBackend::failing_on(SizeClass::Large);
        let spec = RenditionSpec {
            class: SizeClass::Large,
            width: 10,
            height: 10,
            fit: Fit::LongEdge,
            sharpening: None,
            watermark: false,
        };
        assert!(backend.render(&DynamicImage::new_rgb8(20, 20), &spec).is_err());
    }
}
