//! 错误类型定义
//!
//! 编排器对外只暴露两类错误：模型加载错误和生成错误。
//! 引擎侧的失败只携带消息文本，由 `is_accelerator_failure`
//! 按消息模式归类为"加速器不可用"或一般性失败。

use thiserror::Error;

/// 模型加载错误
#[derive(Debug, Error)]
pub enum LoadError {
    /// 引擎创建失败（文件损坏、格式不兼容等非加速器原因）
    #[error("model load failed: {0}")]
    LoadFailed(String),

    /// 加速器后端初始化失败（可恢复，不影响模型可用性）
    #[error("accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    /// 未预期的失败（后端 panic 等），句柄已丢弃
    #[error("unexpected load failure: {0}")]
    Unexpected(String),
}

/// 生成请求错误
#[derive(Debug, Error)]
pub enum GenerateError {
    /// 尚未加载模型，立即返回，不触碰引擎
    #[error("no model is loaded")]
    ModelNotLoaded,

    /// 图像缩放/格式转换失败，中止当前尝试
    #[error("image processing failed: {0}")]
    ImageProcessingFailed(String),

    /// 等待超出时间预算（可恢复，触发降级链）
    #[error("generation timed out after {0} seconds")]
    Timeout(u64),

    /// 引擎侧失败
    #[error("engine failure: {0}")]
    Engine(String),

    /// 未预期的失败，始终记录完整细节后上抛
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

/// 加速器相关失败的消息模式
///
/// 原生运行时在 GPU/委托初始化失败时报错会带有这些字样，匹配即
/// 视为加速器不可用而不是模型本身不可用。
const ACCELERATOR_PATTERNS: &[&str] = &["gpu", "opencl", "delegate", "accelerator", "nnapi"];

/// 按消息模式判断是否为加速器相关失败
pub(crate) fn is_accelerator_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    ACCELERATOR_PATTERNS.iter().any(|p| lower.contains(p))
}
