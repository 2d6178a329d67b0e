use std::fmt::Debug;

/// Element type of a tensor buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataType {
    /// No data type. Used as a sentinel for optional arguments which are
    /// absent, such as a convolution without bias.
    #[default]
    Undef,
    F32,
    S32,
    S8,
    U8,
}

impl DataType {
    /// Size of one element in bytes. Zero for [`DataType::Undef`].
    pub fn size(self) -> usize {
        match self {
            DataType::Undef => 0,
            DataType::F32 | DataType::S32 => 4,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    /// Return true if this is an integer type.
    pub fn is_int(self) -> bool {
        matches!(self, DataType::S32 | DataType::S8 | DataType::U8)
    }

    /// Return true unless this is the [`DataType::Undef`] sentinel.
    pub fn is_defined(self) -> bool {
        self != DataType::Undef
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Undef => "undef",
            DataType::F32 => "f32",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
        };
        write!(f, "{}", name)
    }
}

/// Rust types which can be stored in tensor buffers.
pub trait Element: Copy + Debug + Default + PartialEq + Send + Sync + 'static {
    /// The [`DataType`] tag for this type.
    const DATA_TYPE: DataType;

    /// Convert to `f32`. This is exact for all supported types except large
    /// `i32` values.
    fn to_f32(self) -> f32;

    /// Convert from `f32`, rounding to nearest (ties to even) and saturating
    /// to the range of `Self` for integer types. NaN converts to zero.
    fn saturate_from_f32(x: f32) -> Self;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn saturate_from_f32(x: f32) -> f32 {
        x
    }
}

macro_rules! impl_int_element {
    ($type:ty, $dtype:ident) => {
        impl Element for $type {
            const DATA_TYPE: DataType = DataType::$dtype;

            #[inline]
            fn to_f32(self) -> f32 {
                self as f32
            }

            #[inline]
            fn saturate_from_f32(x: f32) -> $type {
                // Float to int `as` casts saturate and map NaN to zero.
                x.round_ties_even() as $type
            }
        }
    };
}

impl_int_element!(i32, S32);
impl_int_element!(i8, S8);
impl_int_element!(u8, U8);
