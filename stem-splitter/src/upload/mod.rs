//! Intake of uploaded audio files.

mod guard;

pub use guard::{
    RejectionKind, StoredUpload, UploadConfig, UploadError, UploadGuard, parse_stem_count,
};
