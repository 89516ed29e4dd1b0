use crate::image::OutputImage;
use crate::utils::error::SegError;
use crate::Result;
use ndarray::ArrayD;
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;
use tiff::encoder::{
    colortype::{self, ColorType},
    compression::{Deflate, DeflateLevel},
    TiffEncoder, TiffValue,
};

/// 无损压缩TIFF写入（deflate，最高压缩级别）
pub struct TiffWriter;

impl TiffWriter {
    /// 最后两个轴为 (H, W)，其余轴展平为多页
    pub fn write(path: &Path, image: &OutputImage) -> Result<()> {
        let file = BufWriter::new(File::create(path)?);
        let mut encoder = TiffEncoder::new(file)?;

        match image {
            OutputImage::U8(a) => write_pages::<colortype::Gray8, _>(&mut encoder, a),
            OutputImage::U16(a) => write_pages::<colortype::Gray16, _>(&mut encoder, a),
            OutputImage::U32(a) => write_pages::<colortype::Gray32, _>(&mut encoder, a),
            OutputImage::I8(a) => write_pages::<colortype::GrayI8, _>(&mut encoder, a),
            OutputImage::I16(a) => write_pages::<colortype::GrayI16, _>(&mut encoder, a),
            OutputImage::I32(a) => write_pages::<colortype::GrayI32, _>(&mut encoder, a),
            OutputImage::F32(a) => write_pages::<colortype::Gray32Float, _>(&mut encoder, a),
            OutputImage::F64(a) => write_pages::<colortype::Gray64Float, _>(&mut encoder, a),
        }
    }
}

/// (页数, 高, 宽)
pub(crate) fn page_layout(shape: &[usize]) -> Result<(usize, usize, usize)> {
    if shape.len() < 2 {
        return Err(SegError::Geometry(format!(
            "cannot write an image with shape {:?}, need at least 2 axes",
            shape
        )));
    }
    let height = shape[shape.len() - 2];
    let width = shape[shape.len() - 1];
    let pages = shape[..shape.len() - 2].iter().product::<usize>();
    if height == 0 || width == 0 || pages == 0 {
        return Err(SegError::Geometry(format!("cannot write an empty image {:?}", shape)));
    }
    Ok((pages, height, width))
}

fn write_pages<C, W>(encoder: &mut TiffEncoder<W>, array: &ArrayD<C::Inner>) -> Result<()>
where
    C: ColorType,
    C::Inner: Clone,
    [C::Inner]: TiffValue,
    W: Write + Seek,
{
    let (pages, height, width) = page_layout(array.shape())?;
    let data = array.as_standard_layout();
    let samples = data
        .as_slice()
        .ok_or_else(|| SegError::Internal("standard layout array is not contiguous".to_string()))?;

    let page_len = height * width;
    for page in samples.chunks(page_len).take(pages) {
        encoder.write_image_with_compression::<C, _>(
            width as u32,
            height as u32,
            Deflate::with_level(DeflateLevel::Best),
            page,
        )?;
    }
    Ok(())
}
