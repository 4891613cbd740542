use crate::{
    ErrorCode,
    ErrorMetadata,
};

/// Extension methods for classifying an `anyhow::Error` chain by the
/// [`ErrorMetadata`] it may carry, without forcing every caller to downcast
/// by hand.
pub trait ErrorMetadataAnyhowExt {
    fn is_version_conflict(&self) -> bool;
    fn is_stale_primary(&self) -> bool;
    fn is_engine_closed(&self) -> bool;
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    fn short_msg(&self) -> Option<&str>;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_version_conflict(&self) -> bool {
        matches!(
            self.downcast_ref::<ErrorMetadata>().map(|e| e.code),
            Some(ErrorCode::VersionConflict)
        )
    }

    fn is_stale_primary(&self) -> bool {
        matches!(
            self.downcast_ref::<ErrorMetadata>().map(|e| e.code),
            Some(ErrorCode::StalePrimary)
        )
    }

    fn is_engine_closed(&self) -> bool {
        matches!(
            self.downcast_ref::<ErrorMetadata>().map(|e| e.code),
            Some(ErrorCode::EngineClosed)
        )
    }

    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        self.downcast_ref::<ErrorMetadata>()
    }

    fn short_msg(&self) -> Option<&str> {
        self.downcast_ref::<ErrorMetadata>()
            .map(|e| e.short_msg.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn downcasts_through_context_chain() {
        let err = anyhow::anyhow!("boom").context(ErrorMetadata::version_conflict("stale write"));
        assert!(err.is_version_conflict());
        assert!(!err.is_stale_primary());
        assert_eq!(err.short_msg(), Some("VersionConflict"));
    }

    #[test]
    fn plain_errors_classify_as_none() {
        let err = anyhow::anyhow!("boom");
        assert!(!err.is_version_conflict());
        assert_eq!(err.error_metadata(), None);
    }
}
