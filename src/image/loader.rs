use crate::utils::error::SegError;
use crate::Result;
use image::DynamicImage;
use ndarray::{Array2, Array3, ArrayD, Axis};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::ColorType;

pub struct ImageLoader;

impl ImageLoader {
    /// 从文件加载图像，返回 (C, H, W) 或多页TIFF的 (C, D, H, W)
    pub fn from_path(path: &Path) -> Result<ArrayD<f32>> {
        if is_tiff(path) {
            Self::from_tiff(path)
        } else {
            let image = image::open(path)?;
            Self::to_array(&image)
        }
    }

    /// 支持的扩展名
    pub fn is_supported_format(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                matches!(
                    e.to_ascii_lowercase().as_str(),
                    "tif" | "tiff" | "png" | "jpg" | "jpeg" | "bmp"
                )
            })
            .unwrap_or(false)
    }

    /// 读取全部页面，每页作为一个深度切片
    fn from_tiff(path: &Path) -> Result<ArrayD<f32>> {
        let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;

        let mut planes: Vec<Array3<f32>> = Vec::new();
        loop {
            let (width, height) = decoder.dimensions()?;
            let channels = match decoder.colortype()? {
                ColorType::Gray(_) => 1,
                ColorType::RGB(_) => 3,
                ColorType::RGBA(_) => 4,
                other => {
                    return Err(SegError::UnsupportedFormat(format!(
                        "TIFF color type {:?} in {}",
                        other,
                        path.display()
                    )))
                }
            };

            let samples = decoding_result_to_f32(decoder.read_image()?)?;
            let (height, width) = (height as usize, width as usize);
            if samples.len() != height * width * channels {
                return Err(SegError::ImageProcessing(format!(
                    "{}: expected {} samples, decoded {}",
                    path.display(),
                    height * width * channels,
                    samples.len()
                )));
            }

            // 交错的 HWC 转为 CHW
            let hwc = Array3::from_shape_vec((height, width, channels), samples)?;
            planes.push(hwc.permuted_axes([2, 0, 1]).as_standard_layout().into_owned());

            if !decoder.more_images() {
                break;
            }
            decoder.next_image()?;
        }

        if planes.len() == 1 {
            return Ok(planes.remove(0).into_dyn());
        }

        if let Some(plane) = planes.iter().find(|p| p.shape() != planes[0].shape()) {
            return Err(SegError::ImageProcessing(format!(
                "{}: pages have different shapes {:?} and {:?}",
                path.display(),
                planes[0].shape(),
                plane.shape()
            )));
        }

        let views: Vec<_> = planes.iter().map(|p| p.view()).collect();
        // (D, C, H, W) -> (C, D, H, W)
        let stacked = ndarray::stack(Axis(0), &views)?;
        Ok(stacked.permuted_axes([1, 0, 2, 3]).as_standard_layout().into_owned().into_dyn())
    }

    /// 转换DynamicImage为 (C, H, W)；灰度保留原始强度，其余转为RGB
    pub fn to_array(image: &DynamicImage) -> Result<ArrayD<f32>> {
        match image {
            DynamicImage::ImageLuma8(buffer) => {
                let (width, height) = buffer.dimensions();
                gray_to_array(height, width, buffer.as_raw().iter().map(|&v| v as f32))
            }
            DynamicImage::ImageLuma16(buffer) => {
                let (width, height) = buffer.dimensions();
                gray_to_array(height, width, buffer.as_raw().iter().map(|&v| v as f32))
            }
            other => {
                let rgb_image = other.to_rgb8();
                let (width, height) = rgb_image.dimensions();
                let (height, width) = (height as usize, width as usize);
                let raw_data = rgb_image.into_raw();

                let mut array = Array3::<f32>::zeros((3, height, width));
                for (i, pixel_value) in raw_data.iter().enumerate() {
                    let h = (i / 3) / width;
                    let w = (i / 3) % width;
                    let c = i % 3;
                    array[[c, h, w]] = *pixel_value as f32;
                }
                Ok(array.into_dyn())
            }
        }
    }
}

fn gray_to_array(height: u32, width: u32, values: impl Iterator<Item = f32>) -> Result<ArrayD<f32>> {
    let plane = Array2::from_shape_vec((height as usize, width as usize), values.collect())?;
    Ok(plane.insert_axis(Axis(0)).into_dyn())
}

fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "tif" | "tiff"))
        .unwrap_or(false)
}

#[allow(unreachable_patterns)]
fn decoding_result_to_f32(result: DecodingResult) -> Result<Vec<f32>> {
    let samples = match result {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => {
            return Err(SegError::UnsupportedFormat(
                "unsupported TIFF sample format".to_string(),
            ))
        }
    };
    Ok(samples)
}
