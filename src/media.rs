//! 图像预处理
//!
//! 引擎会话只接受边长受限的 RGB8 帧。附加图像前统一经过
//! `prepare_for_session`：归一化像素格式，并在任一边超出上限时
//! 等比缩放到上限以内；已在界内的图像原样返回，不做多余的重采样。

use crate::error::GenerateError;
use image::{imageops, DynamicImage, RgbImage};
use tracing::debug;

/// 默认最大边长（像素）
pub const DEFAULT_BOUND_PX: u32 = 1024;

/// 归一化并按需缩放图像
///
/// 保持纵横比，缩放后最大边等于 `bound`；宽高均不超过 `bound`
/// 时跳过缩放。零尺寸输入视为图像处理失败。
pub fn prepare_for_session(
    image: &DynamicImage,
    bound: u32,
) -> Result<RgbImage, GenerateError> {
    let rgb = image.to_rgb8();
    let (width, height) = (rgb.width(), rgb.height());

    if width == 0 || height == 0 {
        return Err(GenerateError::ImageProcessingFailed(format!(
            "invalid image dimensions {}x{}",
            width, height
        )));
    }

    if width <= bound && height <= bound {
        return Ok(rgb);
    }

    let (new_width, new_height) = bounded_dimensions(width, height, bound);
    debug!(
        "Scaling image {}x{} -> {}x{} (bound: {})",
        width, height, new_width, new_height, bound
    );

    Ok(imageops::resize(
        &rgb,
        new_width,
        new_height,
        imageops::FilterType::Triangle,
    ))
}

/// 计算等比缩放后的尺寸，最大边贴合 `bound`
fn bounded_dimensions(width: u32, height: u32, bound: u32) -> (u32, u32) {
    if width >= height {
        let scaled = (height as u64 * bound as u64 / width as u64) as u32;
        (bound, scaled.max(1))
    } else {
        let scaled = (width as u64 * bound as u64 / height as u64) as u32;
        (scaled.max(1), bound)
    }
}
