//! 推理引擎抽象层
//!
//! 真实的文本/多模态引擎是外部原生库，这里只定义编排器依赖的
//! 最小能力接口：创建会话、按序追加查询分片（文本/图像）、
//! 同步或流式生成。任何原生后端或测试桩实现这组 trait 即可接入，
//! 编排器本身不需要真实模型就能被完整测试。

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[cfg(test)]
pub(crate) mod mock;

/// 引擎侧失败
///
/// 只携带消息文本；编排器按消息模式区分加速器失败与一般失败。
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// 会话生成参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// 采样温度
    pub temperature: f32,
    /// Top-K 采样阈值
    pub top_k: i32,
    /// 是否启用视觉能力（允许附加图像）
    pub enable_vision: bool,
}

impl SessionOptions {
    /// 纯文本会话
    pub fn text(temperature: f32, top_k: i32) -> Self {
        Self {
            temperature,
            top_k,
            enable_vision: false,
        }
    }

    /// 视觉会话
    pub fn vision(temperature: f32, top_k: i32) -> Self {
        Self {
            temperature,
            top_k,
            enable_vision: true,
        }
    }
}

/// 流式生成回调：`(增量文本, 是否结束)`
///
/// 由引擎自身的执行线程调用。
pub type StreamCallback<'a> = &'a mut dyn FnMut(&str, bool);

/// 一次生成交换的短生命周期会话
///
/// 约定：查询分片按追加顺序生效；每个会话最多附加一张图像；
/// 使用完毕必须显式 `close`。
pub trait InferenceSession: Send {
    /// 追加一段文本分片
    fn add_text(&mut self, text: &str);

    /// 附加图像（每会话至多一次）
    fn add_image(&mut self, image: RgbImage) -> Result<(), EngineError>;

    /// 同步生成，返回完整文本
    fn generate(&mut self) -> Result<String, EngineError>;

    /// 流式生成，通过回调逐段推送增量文本
    fn generate_stream(&mut self, on_delta: StreamCallback<'_>) -> Result<(), EngineError>;

    /// 释放会话持有的原生资源
    fn close(&mut self) -> Result<(), EngineError>;
}

/// 已加载的推理引擎句柄
pub trait InferenceEngine: Send + Sync {
    /// 创建一个新会话
    ///
    /// 视觉会话在加速器初始化失败时返回带相应消息的错误，
    /// 由调用方决定降级策略。
    fn create_session(
        &self,
        options: &SessionOptions,
    ) -> Result<Box<dyn InferenceSession>, EngineError>;
}

/// 引擎加载器（工厂）
///
/// 给定模型文件路径创建引擎句柄。`max_images` 统一配置会话可附加的
/// 图像上限，纯文本模型也按此配置，使能力探测路径保持一致。
pub trait EngineLoader: Send + Sync {
    fn load(&self, path: &Path, max_images: u32) -> Result<Arc<dyn InferenceEngine>, EngineError>;
}
