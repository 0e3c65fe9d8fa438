/// 图像解码与缩放
/// JPEG → RGB8, 按目标宽度等比缩放
use crate::error::Result;
use fast_image_resize as fr;

/// 解码后的RGB图像
#[derive(Clone, Debug, PartialEq)]
pub struct RgbImage {
    pub rgb_data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// 解码器: 复用同一个 Resizer, 避免每帧重新分配缓冲
pub struct FrameDecoder {
    resizer: fr::Resizer,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            resizer: fr::Resizer::new(),
        }
    }

    /// 解码并 (可选) 缩放到 `target_width`, 0 表示保持原尺寸
    pub fn decode(&mut self, data: &[u8], target_width: u32) -> Result<RgbImage> {
        let img = image::load_from_memory(data)?.to_rgb8();
        let (width, height) = img.dimensions();
        let decoded = RgbImage {
            rgb_data: img.into_raw(),
            width,
            height,
        };

        match scaled_size(width, height, target_width) {
            Some((w, h)) => self.resize(decoded, w, h),
            None => Ok(decoded),
        }
    }

    fn resize(&mut self, src: RgbImage, dst_width: u32, dst_height: u32) -> Result<RgbImage> {
        let src_image =
            fr::images::Image::from_vec_u8(src.width, src.height, src.rgb_data, fr::PixelType::U8x3)?;
        let mut dst_image = fr::images::Image::new(dst_width, dst_height, fr::PixelType::U8x3);

        // 双三次插值
        self.resizer.resize(
            &src_image,
            &mut dst_image,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::CatmullRom)),
        )?;

        Ok(RgbImage {
            rgb_data: dst_image.into_vec(),
            width: dst_width,
            height: dst_height,
        })
    }
}

/// 按宽度等比缩放后的尺寸; 不需要缩放时返回 None
pub fn scaled_size(width: u32, height: u32, target_width: u32) -> Option<(u32, u32)> {
    if target_width == 0 || width == 0 || height == 0 || width == target_width {
        return None;
    }
    let aspect_ratio = width as f64 / height as f64;
    let target_height = ((target_width as f64 / aspect_ratio).floor() as u32).max(1);
    Some((target_width, target_height))
}
