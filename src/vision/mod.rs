//! 视觉分析辅助模块
//!
//! 在多模态推理不可用时，用轻量视觉模型（分类/目标检测/人脸检测）
//! 对图像做尽力而为的结构化描述，供文本路径合成提示词使用。
//! 对外永不失败：内部任何错误都降级为占位描述。

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

/// 所有视觉模型都不可用时的占位摘要
pub const VISION_UNAVAILABLE_SUMMARY: &str = "Vision analysis is not available on this device.";

/// 图像分类结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// 类别标签
    pub label: String,
    /// 置信度 (0.0 - 1.0)
    pub score: f32,
}

/// 检测到的目标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedObject {
    /// 目标标签
    pub label: String,
    /// 置信度 (0.0 - 1.0)
    pub score: f32,
}

/// 检测到的人脸
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    /// 置信度 (0.0 - 1.0)
    pub confidence: f32,
}

/// 一次图像分析的结构化结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAnalysis {
    /// 分类结果
    pub classifications: Vec<Classification>,
    /// 检测到的目标
    pub objects: Vec<DetectedObject>,
    /// 检测到的人脸
    pub faces: Vec<DetectedFace>,
    /// 分析耗时（毫秒）
    pub elapsed_ms: u64,
    /// 自然语言摘要
    pub summary: String,
}

impl ImageAnalysis {
    /// 是否为"视觉不可用"占位结果
    pub fn is_placeholder(&self) -> bool {
        self.summary == VISION_UNAVAILABLE_SUMMARY
    }

    fn placeholder(elapsed_ms: u64) -> Self {
        Self {
            classifications: Vec::new(),
            objects: Vec::new(),
            faces: Vec::new(),
            elapsed_ms,
            summary: VISION_UNAVAILABLE_SUMMARY.to_string(),
        }
    }
}

/// 图像分类器
pub trait ImageClassifier: Send + Sync {
    fn classify(&self, image: &RgbImage) -> Result<Vec<Classification>>;
}

/// 目标检测器
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedObject>>;
}

/// 人脸检测器
pub trait FaceDetector: Send + Sync {
    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<DetectedFace>>;
}

/// 视觉分析辅助器
///
/// 各子分析器均为可选，按需插装；`analyze` 总是返回结果对象。
#[derive(Default)]
pub struct VisionHelper {
    classifier: Option<Box<dyn ImageClassifier>>,
    object_detector: Option<Box<dyn ObjectDetector>>,
    face_detector: Option<Box<dyn FaceDetector>>,
}

impl VisionHelper {
    /// 创建一个不带任何视觉模型的辅助器
    pub fn new() -> Self {
        Self::default()
    }

    /// 插装图像分类器
    pub fn with_classifier(mut self, classifier: Box<dyn ImageClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// 插装目标检测器
    pub fn with_object_detector(mut self, detector: Box<dyn ObjectDetector>) -> Self {
        self.object_detector = Some(detector);
        self
    }

    /// 插装人脸检测器
    pub fn with_face_detector(mut self, detector: Box<dyn FaceDetector>) -> Self {
        self.face_detector = Some(detector);
        self
    }

    /// 是否装有任何视觉模型
    pub fn has_models(&self) -> bool {
        self.classifier.is_some() || self.object_detector.is_some() || self.face_detector.is_some()
    }

    /// 分析图像，永不失败
    ///
    /// 单个分析器出错只记录日志并跳过；所有分析器都缺失或都失败时
    /// 返回占位结果；有分析器成功但一无所获时返回基础启发式描述。
    pub fn analyze(&self, image: &RgbImage) -> ImageAnalysis {
        let start = Instant::now();

        if !self.has_models() {
            debug!("No vision models installed, returning placeholder analysis");
            return ImageAnalysis::placeholder(start.elapsed().as_millis() as u64);
        }

        let mut succeeded = 0u32;

        let classifications = match self.classifier.as_ref().map(|c| c.classify(image)) {
            Some(Ok(results)) => {
                succeeded += 1;
                results
            }
            Some(Err(e)) => {
                warn!("Image classifier failed: {}", e);
                Vec::new()
            }
            None => Vec::new(),
        };

        let objects = match self.object_detector.as_ref().map(|d| d.detect(image)) {
            Some(Ok(results)) => {
                succeeded += 1;
                results
            }
            Some(Err(e)) => {
                warn!("Object detector failed: {}", e);
                Vec::new()
            }
            None => Vec::new(),
        };

        let faces = match self.face_detector.as_ref().map(|d| d.detect_faces(image)) {
            Some(Ok(results)) => {
                succeeded += 1;
                results
            }
            Some(Err(e)) => {
                warn!("Face detector failed: {}", e);
                Vec::new()
            }
            None => Vec::new(),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;

        // 所有分析器都失败等同于视觉不可用
        if succeeded == 0 {
            warn!("All vision analyzers failed, returning placeholder analysis");
            return ImageAnalysis::placeholder(elapsed_ms);
        }

        let summary = if classifications.is_empty() && objects.is_empty() && faces.is_empty() {
            basic_description(image)
        } else {
            build_summary(&classifications, &objects, &faces)
        };

        debug!(
            "Vision analysis done in {}ms: {} classifications, {} objects, {} faces",
            elapsed_ms,
            classifications.len(),
            objects.len(),
            faces.len()
        );

        ImageAnalysis {
            classifications,
            objects,
            faces,
            elapsed_ms,
            summary,
        }
    }
}

/// 把结构化检测结果拼成一句自然语言摘要
fn build_summary(
    classifications: &[Classification],
    objects: &[DetectedObject],
    faces: &[DetectedFace],
) -> String {
    let mut parts = Vec::new();

    if !classifications.is_empty() {
        let labels: Vec<String> = classifications
            .iter()
            .map(|c| format!("{} ({:.0}%)", c.label, c.score * 100.0))
            .collect();
        parts.push(format!("The image most likely shows {}.", labels.join(", ")));
    }

    if !objects.is_empty() {
        let labels: Vec<&str> = objects.iter().map(|o| o.label.as_str()).collect();
        parts.push(format!("Detected objects: {}.", labels.join(", ")));
    }

    if !faces.is_empty() {
        let word = if faces.len() == 1 { "face" } else { "faces" };
        parts.push(format!("{} {} detected.", faces.len(), word));
    }

    parts.join(" ")
}

/// 基础启发式描述：尺寸、方向与整体明暗
///
/// 分析器在线但没有任何识别结果时的兜底文本。
fn basic_description(image: &RgbImage) -> String {
    let (width, height) = (image.width(), image.height());
    let orientation = if width > height {
        "landscape"
    } else if height > width {
        "portrait"
    } else {
        "square"
    };

    // 间隔采样估算平均亮度，避免整幅遍历
    let step = ((width.max(height) / 64).max(1)) as usize;
    let mut total = 0u64;
    let mut count = 0u64;
    for (x, y, pixel) in image.enumerate_pixels() {
        if x as usize % step == 0 && y as usize % step == 0 {
            let [r, g, b] = pixel.0;
            total += (r as u64 + g as u64 + b as u64) / 3;
            count += 1;
        }
    }
    let brightness = if count > 0 { total / count } else { 0 };
    let tone = if brightness < 64 {
        "predominantly dark"
    } else if brightness < 160 {
        "moderately lit"
    } else {
        "predominantly bright"
    };

    format!(
        "A {}x{} {} image with {} tones; no recognizable subjects were detected.",
        width, height, orientation, tone
    )
}
