use crate::utils::error::SegError;
use crate::Result;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 输出图像的数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutputDtype {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl OutputDtype {
    pub fn is_integer(&self) -> bool {
        !matches!(self, OutputDtype::F32 | OutputDtype::F64)
    }
}

impl FromStr for OutputDtype {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uint8" | "u8" => Ok(OutputDtype::U8),
            "uint16" | "u16" => Ok(OutputDtype::U16),
            "uint32" | "u32" => Ok(OutputDtype::U32),
            "int8" | "i8" => Ok(OutputDtype::I8),
            "int16" | "i16" => Ok(OutputDtype::I16),
            "int32" | "i32" => Ok(OutputDtype::I32),
            "float32" | "f32" => Ok(OutputDtype::F32),
            "float64" | "f64" => Ok(OutputDtype::F64),
            other => Err(SegError::Config(format!("Unsupported output dtype '{}'", other))),
        }
    }
}

impl TryFrom<String> for OutputDtype {
    type Error = SegError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OutputDtype> for String {
    fn from(value: OutputDtype) -> Self {
        value.to_string()
    }
}

impl fmt::Display for OutputDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputDtype::U8 => "uint8",
            OutputDtype::U16 => "uint16",
            OutputDtype::U32 => "uint32",
            OutputDtype::I8 => "int8",
            OutputDtype::I16 => "int16",
            OutputDtype::I32 => "int32",
            OutputDtype::F32 => "float32",
            OutputDtype::F64 => "float64",
        };
        write!(f, "{}", name)
    }
}

/// 饱和转换：超出范围的值截断到类型边界，不回绕
trait Saturate: Copy {
    fn saturate(value: f64) -> Self;
}

macro_rules! impl_saturate_int {
    ($($t:ty),*) => {
        $(
            impl Saturate for $t {
                fn saturate(value: f64) -> Self {
                    if value.is_nan() {
                        return 0;
                    }
                    value.clamp(<$t>::MIN as f64, <$t>::MAX as f64) as $t
                }
            }
        )*
    };
}

impl_saturate_int!(u8, u16, u32, i8, i16, i32);

impl Saturate for f32 {
    fn saturate(value: f64) -> Self {
        value as f32
    }
}

impl Saturate for f64 {
    fn saturate(value: f64) -> Self {
        value
    }
}

/// 类型转换后的输出图像
#[derive(Debug, Clone, PartialEq)]
pub enum OutputImage {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    I8(ArrayD<i8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

impl OutputImage {
    /// 浮点预测转换；不指定类型时保持float32
    pub fn from_f32(prediction: ArrayD<f32>, dtype: Option<OutputDtype>) -> Self {
        match dtype {
            None | Some(OutputDtype::F32) => OutputImage::F32(prediction),
            Some(dtype) => Self::cast(&prediction.mapv(f64::from), dtype),
        }
    }

    /// 集成结果转换；不指定类型时保持int32
    pub fn from_i32(prediction: ArrayD<i32>, dtype: Option<OutputDtype>) -> Self {
        match dtype {
            None | Some(OutputDtype::I32) => OutputImage::I32(prediction),
            Some(dtype) => Self::cast(&prediction.mapv(f64::from), dtype),
        }
    }

    fn cast(values: &ArrayD<f64>, dtype: OutputDtype) -> Self {
        match dtype {
            OutputDtype::U8 => OutputImage::U8(values.mapv(u8::saturate)),
            OutputDtype::U16 => OutputImage::U16(values.mapv(u16::saturate)),
            OutputDtype::U32 => OutputImage::U32(values.mapv(u32::saturate)),
            OutputDtype::I8 => OutputImage::I8(values.mapv(i8::saturate)),
            OutputDtype::I16 => OutputImage::I16(values.mapv(i16::saturate)),
            OutputDtype::I32 => OutputImage::I32(values.mapv(i32::saturate)),
            OutputDtype::F32 => OutputImage::F32(values.mapv(f32::saturate)),
            OutputDtype::F64 => OutputImage::F64(values.mapv(f64::saturate)),
        }
    }

    pub fn dtype(&self) -> OutputDtype {
        match self {
            OutputImage::U8(_) => OutputDtype::U8,
            OutputImage::U16(_) => OutputDtype::U16,
            OutputImage::U32(_) => OutputDtype::U32,
            OutputImage::I8(_) => OutputDtype::I8,
            OutputImage::I16(_) => OutputDtype::I16,
            OutputImage::I32(_) => OutputDtype::I32,
            OutputImage::F32(_) => OutputDtype::F32,
            OutputImage::F64(_) => OutputDtype::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            OutputImage::U8(a) => a.shape(),
            OutputImage::U16(a) => a.shape(),
            OutputImage::U32(a) => a.shape(),
            OutputImage::I8(a) => a.shape(),
            OutputImage::I16(a) => a.shape(),
            OutputImage::I32(a) => a.shape(),
            OutputImage::F32(a) => a.shape(),
            OutputImage::F64(a) => a.shape(),
        }
    }
}
