//! Convolution options and the deformable dimension mask.

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{DeformConvError, DeformConvResult};

/// One of the three spatial axes of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Temporal (depth) axis.
    T,
    /// Height axis.
    H,
    /// Width axis.
    W,
}

impl Axis {
    /// All axes in storage order.
    pub const ALL: [Self; 3] = [Self::T, Self::H, Self::W];

    /// Position of the axis inside a `[T, H, W]` triple.
    pub const fn index(self) -> usize {
        match self {
            Self::T => 0,
            Self::H => 1,
            Self::W => 2,
        }
    }

    pub const fn symbol(self) -> char {
        match self {
            Self::T => 'T',
            Self::H => 'H',
            Self::W => 'W',
        }
    }

    const fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            'T' => Some(Self::T),
            'H' => Some(Self::H),
            'W' => Some(Self::W),
            _ => None,
        }
    }
}

/// The ordered subset of `{T, H, W}` that receives learned offsets.
///
/// Offsets of one kernel tap are laid out in the order the axes appear in the
/// mask string, so `"WT"` stores the width offset before the temporal one.
/// Axes outside the mask keep their kernel grid coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DimensionMask {
    axes: [Axis; 3],
    count: usize,
}

impl DimensionMask {
    /// Deformation along all three axes, `"THW"`.
    pub const FULL: Self = Self {
        axes: Axis::ALL,
        count: 3,
    };

    /// Parses a mask such as `"THW"`, `"TW"` or `"H"`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimensionMask` when the string is empty, longer than
    /// three characters, repeats an axis or contains a character outside `THW`.
    pub fn parse(mask: &str) -> DeformConvResult<Self> {
        let invalid = |reason: &str| DeformConvError::InvalidDimensionMask {
            mask: mask.to_owned(),
            reason: reason.to_owned(),
        };

        if mask.is_empty() {
            return Err(invalid("at least one of T, H, W is required"));
        }

        let mut axes = Axis::ALL;
        let mut count = 0;
        for symbol in mask.chars() {
            let axis = Axis::from_symbol(symbol).ok_or_else(|| {
                invalid(&format!("unknown axis {symbol:?}, expected T, H or W"))
            })?;
            if axes[..count].contains(&axis) {
                return Err(invalid(&format!("axis {symbol:?} appears more than once")));
            }
            // Three distinct axes at most, so the repeat check above bounds `count`.
            axes[count] = axis;
            count += 1;
        }

        Ok(Self { axes, count })
    }

    /// The deformed axes in offset layout order.
    pub fn axes(&self) -> &[Axis] {
        &self.axes[..self.count]
    }

    /// Number of deformed axes, between 1 and 3.
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Position of `axis` inside a tap's offset vector, if it is deformed.
    pub fn slot(&self, axis: Axis) -> Option<usize> {
        self.axes().iter().position(|&a| a == axis)
    }

    pub fn contains(&self, axis: Axis) -> bool {
        self.slot(axis).is_some()
    }
}

impl Default for DimensionMask {
    fn default() -> Self {
        Self::FULL
    }
}

impl fmt::Display for DimensionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.axes()
            .iter()
            .try_for_each(|axis| write!(f, "{}", axis.symbol()))
    }
}

impl FromStr for DimensionMask {
    type Err = DeformConvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DimensionMask {
    type Error = DeformConvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DimensionMask> for String {
    fn from(mask: DimensionMask) -> Self {
        mask.to_string()
    }
}

/// Options shared by the forward and backward passes.
///
/// The kernel size is taken from the weight tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeformConv3dOptions {
    /// Stride per axis (non-zero).
    pub stride: [usize; 3],

    /// Zero padding per axis.
    pub padding: [usize; 3],

    /// Dilation per axis (non-zero).
    pub dilation: [usize; 3],

    /// Weight groups (non-zero).
    pub groups: usize,

    /// Offset groups (non-zero).
    pub deformable_groups: usize,

    /// Axes that receive learned offsets.
    #[serde(default)]
    pub dimension: DimensionMask,
}

impl DeformConv3dOptions {
    /// Constructs a new `DeformConv3dOptions`.
    pub const fn new(
        stride: [usize; 3],
        padding: [usize; 3],
        dilation: [usize; 3],
        groups: usize,
        deformable_groups: usize,
        dimension: DimensionMask,
    ) -> Self {
        Self {
            stride,
            padding,
            dilation,
            groups,
            deformable_groups,
            dimension,
        }
    }

    #[must_use]
    pub const fn with_dimension(mut self, dimension: DimensionMask) -> Self {
        self.dimension = dimension;
        self
    }

    /// Checks the values that do not depend on any tensor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if a stride, dilation or group count is zero.
    pub fn validate(&self) -> DeformConvResult<()> {
        let nonzero = |values: [usize; 3], name: &str| {
            if values.contains(&0) {
                Err(DeformConvError::InvalidConfiguration {
                    reason: format!("{name} must be positive on every axis, got {values:?}"),
                })
            } else {
                Ok(())
            }
        };
        nonzero(self.stride, "stride")?;
        nonzero(self.dilation, "dilation")?;

        if self.groups == 0 || self.deformable_groups == 0 {
            return Err(DeformConvError::InvalidConfiguration {
                reason: format!(
                    "groups and deformable_groups must be positive, got {} and {}",
                    self.groups, self.deformable_groups
                ),
            });
        }
        Ok(())
    }
}

impl Default for DeformConv3dOptions {
    fn default() -> Self {
        Self::new([1; 3], [0; 3], [1; 3], 1, 1, DimensionMask::FULL)
    }
}

/// Output length of a convolution along one axis.
///
/// Returns `None` when the padded input is shorter than the dilated kernel.
pub const fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Option<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let Some(span) = dilation.checked_mul(kernel - 1) else {
        return None;
    };
    let Some(span) = span.checked_add(1) else {
        return None;
    };
    let Some(padded) = padding.checked_mul(2) else {
        return None;
    };
    let Some(padded) = input.checked_add(padded) else {
        return None;
    };
    if padded < span {
        return None;
    }
    Some((padded - span) / stride + 1)
}
