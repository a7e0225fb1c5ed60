//! Platform-specific codec backends.

use crate::CodecFactory;
use std::sync::Arc;

cfg_if::cfg_if! {
    if #[cfg(target_os = "android")] {
        /// Android `MediaCodec` implementation.
        pub mod android;
        pub use android::{AndroidCodec, AndroidCodecFactory};

        /// Codec factory of the current platform.
        #[must_use]
        pub fn default_factory() -> Arc<dyn CodecFactory> {
            Arc::new(AndroidCodecFactory)
        }

        /// Mime type the platform encoders produce by default.
        #[must_use]
        pub const fn preferred_video_mime() -> &'static str {
            crate::MIME_AVC
        }
    } else {
        /// Codec factory of the current platform.
        ///
        /// Platforms without codec bindings get the software codec.
        #[must_use]
        pub fn default_factory() -> Arc<dyn CodecFactory> {
            Arc::new(crate::SoftwareCodecFactory::default())
        }

        /// Mime type the platform encoders produce by default.
        #[must_use]
        pub const fn preferred_video_mime() -> &'static str {
            crate::MIME_RAW
        }
    }
}
