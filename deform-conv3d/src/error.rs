use thiserror::Error;

/// Coarse classification of a [`DeformConvError`].
///
/// Every error is raised before any output buffer is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed kernel, stride, padding, dilation or dimension mask.
    Config,
    /// Tensor rank, size or channel count does not match the configuration.
    Shape,
    /// Channel counts that the requested grouping cannot partition.
    Domain,
}

/// The error type for deformable convolution operations.
#[derive(Error, Debug)]
pub enum DeformConvError {
    /// A construction-time parameter is out of range or inconsistent.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// The deformable dimension string is not a non-empty subset of `THW`.
    #[error("Invalid dimension mask {mask:?}: {reason}")]
    InvalidDimensionMask {
        /// The rejected mask string.
        mask: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A tensor does not have the shape the operation requires.
    #[error("Invalid {tensor} shape: expected {expected}, got {actual}")]
    InvalidTensorShape {
        /// Which operand was rejected.
        tensor: &'static str,
        /// The expected shape.
        expected: String,
        /// The actual shape.
        actual: String,
    },

    /// Channel counts derived from the tensors cannot be split into the requested groups.
    #[error("Invalid grouping: {reason}")]
    InvalidGrouping {
        /// The reason why the grouping is invalid.
        reason: String,
    },

    /// Extracting a dense buffer from a framework tensor failed.
    #[error("Tensor conversion failed: {reason}")]
    TensorConversion {
        /// The underlying conversion failure.
        reason: String,
    },
}

impl DeformConvError {
    /// Returns the category this error belongs to.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfiguration { .. } | Self::InvalidDimensionMask { .. } => {
                ErrorKind::Config
            }
            Self::InvalidTensorShape { .. } | Self::TensorConversion { .. } => ErrorKind::Shape,
            Self::InvalidGrouping { .. } => ErrorKind::Domain,
        }
    }

    pub(crate) fn shape(
        tensor: &'static str,
        expected: impl Into<String>,
        actual: &[usize],
    ) -> Self {
        Self::InvalidTensorShape {
            tensor,
            expected: expected.into(),
            actual: format!("{actual:?}"),
        }
    }
}

/// A specialized `Result` type for deformable convolution operations.
pub type DeformConvResult<T> = Result<T, DeformConvError>;
