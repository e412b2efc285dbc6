use std::fmt::{Display, Formatter};

/// Pixel data types a JPEG2000 band can be exposed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Byte,
    UInt16,
    Int16,
    UInt32,
    Int32,
}

impl DataType {
    /// Pick the narrowest type able to hold samples of `precision` bits.
    pub fn for_precision(precision: u8, signed: bool) -> Self {
        match (precision, signed) {
            (0..=8, _) => DataType::Byte,
            (9..=16, true) => DataType::Int16,
            (9..=16, false) => DataType::UInt16,
            (_, true) => DataType::Int32,
            (_, false) => DataType::UInt32,
        }
    }

    /// Get the type size in **bytes**.
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::Byte => 1,
            DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt32 | DataType::Int32 => 4,
        }
    }

    /// Get the type size in **bits**.
    pub fn bits(&self) -> u8 {
        (self.size_bytes() * 8) as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Byte => "Byte",
            DataType::UInt16 => "UInt16",
            DataType::Int16 => "Int16",
            DataType::UInt32 => "UInt32",
            DataType::Int32 => "Int32",
        }
    }

    /// Store `value` at sample position `index` of `dst`, saturating to the
    /// range of this type.
    pub fn write_sample(&self, dst: &mut [u8], index: usize, value: i32) {
        let offset = index * self.size_bytes();
        match self {
            DataType::Byte => dst[offset] = value.clamp(0, u8::MAX as i32) as u8,
            DataType::UInt16 => {
                let v = value.clamp(0, u16::MAX as i32) as u16;
                dst[offset..offset + 2].copy_from_slice(&v.to_ne_bytes());
            }
            DataType::Int16 => {
                let v = value.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                dst[offset..offset + 2].copy_from_slice(&v.to_ne_bytes());
            }
            DataType::UInt32 => {
                let v = value.max(0) as u32;
                dst[offset..offset + 4].copy_from_slice(&v.to_ne_bytes());
            }
            DataType::Int32 => {
                dst[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
            }
        }
    }

    /// Load the sample at position `index` of `src`.
    pub fn read_sample(&self, src: &[u8], index: usize) -> i64 {
        let offset = index * self.size_bytes();
        match self {
            DataType::Byte => src[offset] as i64,
            DataType::UInt16 => u16::from_ne_bytes([src[offset], src[offset + 1]]) as i64,
            DataType::Int16 => i16::from_ne_bytes([src[offset], src[offset + 1]]) as i64,
            DataType::UInt32 => u32::from_ne_bytes([
                src[offset],
                src[offset + 1],
                src[offset + 2],
                src[offset + 3],
            ]) as i64,
            DataType::Int32 => i32::from_ne_bytes([
                src[offset],
                src[offset + 1],
                src[offset + 2],
                src[offset + 3],
            ]) as i64,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Type-level constraint for limiting which primitive numeric values can be
/// used as destination of a read.
pub trait GdalType: Copy + Default + Send + 'static {
    /// Convert a stored sample, saturating where the value does not fit.
    fn from_sample(value: i64) -> Self;
}

macro_rules! integer_gdal_type {
    ($($t:ty),*) => {
        $(
            impl GdalType for $t {
                fn from_sample(value: i64) -> Self {
                    value.clamp(<$t>::MIN as i64, <$t>::MAX as i64) as $t
                }
            }
        )*
    };
}

integer_gdal_type!(u8, u16, i16, u32, i32);

impl GdalType for f32 {
    fn from_sample(value: i64) -> Self {
        value as f32
    }
}

impl GdalType for f64 {
    fn from_sample(value: i64) -> Self {
        value as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_precision() {
        assert_eq!(DataType::for_precision(1, false), DataType::Byte);
        assert_eq!(DataType::for_precision(8, true), DataType::Byte);
        assert_eq!(DataType::for_precision(12, false), DataType::UInt16);
        assert_eq!(DataType::for_precision(16, true), DataType::Int16);
        assert_eq!(DataType::for_precision(17, false), DataType::UInt32);
        assert_eq!(DataType::for_precision(24, true), DataType::Int32);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(DataType::Byte.size_bytes(), 1);
        assert_eq!(DataType::Int16.bits(), 16);
        assert_eq!(DataType::UInt32.size_bytes(), 4);
        assert_eq!(DataType::Int32.to_string(), "Int32");
    }

    #[test]
    fn test_write_saturates() {
        let mut buf = [0_u8; 4];
        DataType::Byte.write_sample(&mut buf, 0, 300);
        DataType::Byte.write_sample(&mut buf, 1, -5);
        assert_eq!(&buf[..2], &[255, 0]);

        DataType::Int16.write_sample(&mut buf, 1, -40_000);
        assert_eq!(DataType::Int16.read_sample(&buf, 1), i16::MIN as i64);

        DataType::UInt32.write_sample(&mut buf, 0, -1);
        assert_eq!(DataType::UInt32.read_sample(&buf, 0), 0);
    }

    #[test]
    fn test_from_sample() {
        assert_eq!(u8::from_sample(256), 255);
        assert_eq!(i16::from_sample(-70_000), i16::MIN);
        assert_eq!(u32::from_sample(-3), 0);
        assert_eq!(f64::from_sample(-3), -3.0);
    }
}
