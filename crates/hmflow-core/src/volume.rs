//! Voxel extents and host-resident scalar volumes.
//!
//! Every field the solver touches (flows, labels, data terms) covers the same
//! global [`Extent`]. Storage is x-fastest: voxel `(x, y, z)` lives at
//! `x + nx * (y + ny * z)`.

/// Dimensions of a voxel grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Extent {
    /// Voxels along x.
    pub x: usize,
    /// Voxels along y.
    pub y: usize,
    /// Voxels along z (1 for 2D images).
    pub z: usize,
}

impl Extent {
    /// Creates an extent from its three dimensions.
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// Total number of voxels.
    #[inline]
    pub const fn voxels(self) -> usize {
        self.x * self.y * self.z
    }

    /// Returns true if any dimension is zero.
    pub const fn is_empty(self) -> bool {
        self.voxels() == 0
    }

    /// Flat index of voxel `(x, y, z)`.
    #[inline]
    pub const fn index(self, x: usize, y: usize, z: usize) -> usize {
        x + self.x * (y + self.y * z)
    }

    /// Distance between neighbours along each axis in flat storage.
    #[inline]
    pub const fn strides(self) -> (usize, usize, usize) {
        (1, self.x, self.x * self.y)
    }

    /// Bytes needed to hold one `f32` field of this extent.
    pub const fn field_bytes(self) -> usize {
        self.voxels() * core::mem::size_of::<f32>()
    }
}

impl core::fmt::Display for Extent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

/// A scalar `f32` field over an [`Extent`].
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    extent: Extent,
    data: Vec<f32>,
}

impl Volume {
    /// Creates a volume filled with `value`.
    pub fn filled(extent: Extent, value: f32) -> Self {
        Self {
            extent,
            data: vec![value; extent.voxels()],
        }
    }

    /// Creates a zeroed volume.
    pub fn zeros(extent: Extent) -> Self {
        Self::filled(extent, 0.0)
    }

    /// Wraps existing samples. Returns `None` if the length does not match the extent.
    pub fn from_vec(extent: Extent, data: Vec<f32>) -> Option<Self> {
        (data.len() == extent.voxels()).then_some(Self { extent, data })
    }

    /// Builds a volume by evaluating `f(x, y, z)` at every voxel.
    pub fn from_fn(extent: Extent, mut f: impl FnMut(usize, usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(extent.voxels());
        for z in 0..extent.z {
            for y in 0..extent.y {
                for x in 0..extent.x {
                    data.push(f(x, y, z));
                }
            }
        }
        Self { extent, data }
    }

    /// The grid this volume covers.
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Samples in x-fastest order.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable samples in x-fastest order.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consumes the volume, returning its samples.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Sample at `(x, y, z)`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinate is outside the extent.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[self.extent.index(x, y, z)]
    }

    /// Smallest and largest sample, or `None` for an empty volume.
    pub fn range(&self) -> Option<(f32, f32)> {
        let first = *self.data.first()?;
        Some(
            self.data
                .iter()
                .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v))),
        )
    }

    /// Arithmetic mean of all samples (0 for an empty volume).
    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&v| f64::from(v)).sum::<f64>() as f32 / self.data.len() as f32
    }
}
