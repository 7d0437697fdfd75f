//! Mirage - Local-first multimodal inference orchestration
//!
//! 核心库：持有设备端文本/多模态推理引擎句柄，编排会话生命周期，
//! 并在多模态能力不可用时沿降级链给出尽力而为的回复。
//!
//! 推理引擎本身是外部原生库，经 [`engine`] 模块的窄接口接入；
//! 本库不实现任何神经网络执行。

pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod orchestrator;
pub mod vision;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use config::{AppConfig, GenerationConfig, RuntimeConfig};
pub use engine::{EngineError, EngineLoader, InferenceEngine, InferenceSession, SessionOptions};
pub use error::{GenerateError, LoadError};
pub use orchestrator::{
    Generation, GenerationKind, ModelKind, Orchestrator, IMAGE_GENERATION_NOTICE,
    REDUCED_CAPABILITY_NOTICE,
};
pub use vision::{ImageAnalysis, VisionHelper};

/// 初始化日志订阅
///
/// 嵌入方也可以自行配置 `tracing` 订阅者，此函数仅作为默认入口。
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("mirage=debug".parse().unwrap()))
        .init();
}
