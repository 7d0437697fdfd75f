//! 推理编排器
//!
//! 持有唯一的引擎句柄与视觉分析辅助器，把每个生成请求路由到
//! 当前可用的最佳执行路径，并保证无论成败资源都被回收。
//!
//! 多模态请求的降级链是一组按序尝试的显式策略：
//! 1. 原生多模态推理（加速器会话 + 图像附加，受时间预算约束）
//! 2. 视觉辅助文本路径（结构化图像描述合成提示词，走纯文本生成）
//! 3. 固定的能力受限说明文本
//!
//! 每一步只在前一步不可用或失败时才会尝试；加速器失败永远不会
//! 直接抛给调用方。

pub(crate) mod session;
pub(crate) mod stream;

use crate::config::AppConfig;
use crate::engine::{EngineLoader, InferenceEngine, SessionOptions};
use crate::error::{is_accelerator_failure, GenerateError, LoadError};
use crate::media;
use crate::vision::VisionHelper;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use session::SessionRegistry;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream::{StreamRelay, WaitOutcome};
use tokio::sync::RwLock;
use tokio::task;
use tracing::{debug, info, warn};

/// 图像生成尚未实现时的占位回复
pub const IMAGE_GENERATION_NOTICE: &str =
    "Image generation is not supported by this build yet.";

/// 降级链走到尽头时的固定说明回复
pub const REDUCED_CAPABILITY_NOTICE: &str = "The loaded model could not process the image on \
     this device, and no on-device vision models are available to describe it. Please try a \
     text-only request, or install the vision model pack to enable image understanding.";

/// 模型句柄类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// 纯文本模型（仅在严格探测模式下出现）
    Text,
    /// 多模态模型（默认的乐观归类）
    Multimodal,
    /// 图像生成模型（目录形式，尚无引擎实现）
    ImageGeneration,
    /// 未加载或加载失败
    Unknown,
}

/// 生成结果的产生方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationKind {
    /// 引擎正常产出
    Generated,
    /// 引擎完成但没有产出任何文本（与硬失败区分）
    Empty,
    /// 经视觉辅助文本路径产出
    VisionAssisted,
    /// 固定说明文本（占位/能力受限）
    Notice,
}

/// 一次生成请求的最终结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    /// 结果文本
    pub text: String,
    /// 产生方式
    pub kind: GenerationKind,
}

impl Generation {
    fn engine(text: String) -> Self {
        if text.trim().is_empty() {
            Self {
                text: String::new(),
                kind: GenerationKind::Empty,
            }
        } else {
            Self {
                text,
                kind: GenerationKind::Generated,
            }
        }
    }

    fn notice(text: &str) -> Self {
        Self {
            text: text.to_string(),
            kind: GenerationKind::Notice,
        }
    }
}

/// 流式回调：`(累计文本, 是否结束)`，在引擎执行线程上调用
pub type PartialCallback = Box<dyn FnMut(&str, bool) + Send>;

/// 可吊销的回调闸门
///
/// 超时放弃原生尝试后吊销回调，迟到的引擎回调不再触达调用方；
/// 取回的回调交给下一级策略继续使用。
struct CallbackGate {
    inner: Mutex<Option<PartialCallback>>,
}

impl CallbackGate {
    fn new(callback: Option<PartialCallback>) -> Self {
        Self {
            inner: Mutex::new(callback),
        }
    }

    fn emit(&self, text: &str, done: bool) {
        if let Some(cb) = self.inner.lock().unwrap().as_mut() {
            cb(text, done);
        }
    }

    fn revoke(&self) -> Option<PartialCallback> {
        self.inner.lock().unwrap().take()
    }
}

/// 策略执行结果：要么得出最终结果，要么带原因转入下一级
enum Attempt {
    Resolved(Generation),
    Next(String),
}

/// 模型句柄状态机
///
/// `Unloaded -> Loading -> {Ready | Failed}`；卸载回到 `Unloaded`，
/// 且总是先清空全部会话再丢弃句柄。
enum ModelState {
    Unloaded,
    Loading,
    Ready {
        kind: ModelKind,
        engine: Option<Arc<dyn InferenceEngine>>,
    },
    Failed,
}

/// 请求路由结果
enum Route {
    Engine(Arc<dyn InferenceEngine>, ModelKind),
    Placeholder,
}

/// 推理编排器
pub struct Orchestrator {
    loader: Arc<dyn EngineLoader>,
    vision: Arc<VisionHelper>,
    config: AppConfig,
    state: RwLock<ModelState>,
    sessions: Arc<SessionRegistry>,
}

impl Orchestrator {
    /// 创建编排器
    pub fn new(loader: Arc<dyn EngineLoader>, vision: VisionHelper, config: AppConfig) -> Self {
        Self {
            loader,
            vision: Arc::new(vision),
            config,
            state: RwLock::new(ModelState::Unloaded),
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    /// 当前模型类别
    pub async fn model_kind(&self) -> ModelKind {
        match &*self.state.read().await {
            ModelState::Ready { kind, .. } => *kind,
            _ => ModelKind::Unknown,
        }
    }

    /// 当前登记在案的会话数量
    pub fn live_session_count(&self) -> usize {
        self.sessions.live_count()
    }

    /// 卸载当前模型
    ///
    /// 先清空全部会话，再丢弃引擎句柄。
    pub async fn unload(&self) {
        self.sessions.release_all();
        let prev = std::mem::replace(&mut *self.state.write().await, ModelState::Unloaded);
        if let ModelState::Ready { kind, .. } = prev {
            info!("Model unloaded (was {:?})", kind);
        }
    }

    /// 加载模型
    ///
    /// 目录路径视为图像生成模型（不创建引擎句柄）；文件路径创建
    /// 引擎并做一次性视觉能力探测。加载新模型前总是先完整卸载
    /// 旧句柄，失败的加载不会留下半加载状态。
    pub async fn load_model(&self, path: impl AsRef<Path>) -> Result<ModelKind, LoadError> {
        let path = path.as_ref().to_path_buf();

        // 1. 完整卸载旧句柄（会话清零）
        self.unload().await;
        *self.state.write().await = ModelState::Loading;

        // 2. 目录 => 图像生成模型，无引擎
        if path.is_dir() {
            info!("Loading image generation model from {}", path.display());
            *self.state.write().await = ModelState::Ready {
                kind: ModelKind::ImageGeneration,
                engine: None,
            };
            return Ok(ModelKind::ImageGeneration);
        }

        // 3. 创建引擎句柄，失败按消息模式归类
        info!("Loading model from {}", path.display());
        let loader = self.loader.clone();
        let max_images = self.config.generation.max_images;
        let load_path = path.clone();
        let loaded = task::spawn_blocking(move || loader.load(&load_path, max_images)).await;

        let engine = match loaded {
            Err(e) => {
                warn!("Model load panicked: {}", e);
                *self.state.write().await = ModelState::Failed;
                return Err(LoadError::Unexpected(format!("load worker panicked: {}", e)));
            }
            Ok(Err(e)) => {
                *self.state.write().await = ModelState::Unloaded;
                return Err(if is_accelerator_failure(&e.0) {
                    warn!("Accelerator unavailable while loading {}: {}", path.display(), e);
                    LoadError::AcceleratorUnavailable(e.0)
                } else {
                    warn!("Failed to load {}: {}", path.display(), e);
                    LoadError::LoadFailed(e.0)
                });
            }
            Ok(Ok(engine)) => engine,
        };

        // 4. 视觉能力探测：创建并立即关闭一个一次性视觉会话
        let kind = self.probe_multimodal(&engine).await;

        *self.state.write().await = ModelState::Ready {
            kind,
            engine: Some(engine),
        };
        info!("Model loaded from {} as {:?}", path.display(), kind);
        Ok(kind)
    }

    /// 探测引擎的多模态能力
    ///
    /// 探测失败不会把句柄降级回纯文本：`max_images` 已按统一配置
    /// 生效，归类沿用乐观策略，按请求再降级。只有打开
    /// `strict_capability_probe` 时，非加速器原因的探测失败才降级
    /// 为 `Text`。
    async fn probe_multimodal(&self, engine: &Arc<dyn InferenceEngine>) -> ModelKind {
        let options = SessionOptions::vision(
            self.config.generation.temperature,
            self.config.generation.top_k,
        );
        let probe_engine = engine.clone();
        let probed = task::spawn_blocking(move || {
            probe_engine.create_session(&options).map(|mut session| {
                if let Err(e) = session.close() {
                    warn!("Failed to close probe session: {}", e);
                }
            })
        })
        .await;

        match probed {
            Ok(Ok(())) => {
                info!("Vision session probe succeeded, accelerated multimodal path available");
                ModelKind::Multimodal
            }
            Ok(Err(e)) if is_accelerator_failure(&e.0) => {
                warn!(
                    "Vision probe hit accelerator failure ({}), will retry per request",
                    e
                );
                ModelKind::Multimodal
            }
            Ok(Err(e)) => {
                if self.config.runtime.strict_capability_probe {
                    warn!("Vision probe failed ({}), classifying model as text-only", e);
                    ModelKind::Text
                } else {
                    warn!(
                        "Vision probe failed ({}), keeping optimistic multimodal classification",
                        e
                    );
                    ModelKind::Multimodal
                }
            }
            Err(e) => {
                warn!(
                    "Vision probe panicked ({}), keeping optimistic multimodal classification",
                    e
                );
                ModelKind::Multimodal
            }
        }
    }

    /// 路由当前请求
    async fn route(&self) -> Result<Route, GenerateError> {
        match &*self.state.read().await {
            ModelState::Ready {
                kind: ModelKind::ImageGeneration,
                ..
            } => Ok(Route::Placeholder),
            ModelState::Ready {
                kind,
                engine: Some(engine),
            } => Ok(Route::Engine(engine.clone(), *kind)),
            _ => Err(GenerateError::ModelNotLoaded),
        }
    }

    /// 纯文本生成
    pub async fn generate_text(
        &self,
        prompt: &str,
        preamble: Option<&str>,
    ) -> Result<Generation, GenerateError> {
        self.generate_text_inner(prompt, preamble, None).await
    }

    /// 纯文本流式生成
    ///
    /// 回调收到 `(累计文本, 是否结束)`；结束回调携带的文本与返回值
    /// 一致。
    pub async fn generate_text_streaming(
        &self,
        prompt: &str,
        preamble: Option<&str>,
        on_partial: impl FnMut(&str, bool) + Send + 'static,
    ) -> Result<Generation, GenerateError> {
        self.generate_text_inner(prompt, preamble, Some(Box::new(on_partial)))
            .await
    }

    async fn generate_text_inner(
        &self,
        prompt: &str,
        preamble: Option<&str>,
        callback: Option<PartialCallback>,
    ) -> Result<Generation, GenerateError> {
        match self.route().await? {
            Route::Placeholder => {
                if let Some(mut cb) = callback {
                    cb(IMAGE_GENERATION_NOTICE, true);
                }
                Ok(Generation::notice(IMAGE_GENERATION_NOTICE))
            }
            Route::Engine(engine, _) => {
                self.run_text_session(
                    engine,
                    prompt.to_string(),
                    preamble.map(|s| s.to_string()),
                    callback,
                )
                .await
            }
        }
    }

    /// 多模态生成（降级链入口）
    pub async fn generate_multimodal(
        &self,
        prompt: &str,
        image: DynamicImage,
        preamble: Option<&str>,
    ) -> Result<Generation, GenerateError> {
        self.generate_multimodal_inner(prompt, image, preamble, None)
            .await
    }

    /// 多模态流式生成
    pub async fn generate_multimodal_streaming(
        &self,
        prompt: &str,
        image: DynamicImage,
        preamble: Option<&str>,
        on_partial: impl FnMut(&str, bool) + Send + 'static,
    ) -> Result<Generation, GenerateError> {
        self.generate_multimodal_inner(prompt, image, preamble, Some(Box::new(on_partial)))
            .await
    }

    async fn generate_multimodal_inner(
        &self,
        prompt: &str,
        image: DynamicImage,
        preamble: Option<&str>,
        callback: Option<PartialCallback>,
    ) -> Result<Generation, GenerateError> {
        let (engine, kind) = match self.route().await? {
            Route::Placeholder => {
                if let Some(mut cb) = callback {
                    cb(IMAGE_GENERATION_NOTICE, true);
                }
                return Ok(Generation::notice(IMAGE_GENERATION_NOTICE));
            }
            Route::Engine(engine, kind) => (engine, kind),
        };

        let gate = Arc::new(CallbackGate::new(callback));
        let mut native_failure: Option<String> = None;

        // 策略一：原生多模态推理
        if kind == ModelKind::Multimodal {
            match self
                .try_native_multimodal(engine.clone(), prompt, &image, preamble, gate.clone())
                .await
            {
                Attempt::Resolved(generation) => return Ok(generation),
                Attempt::Next(reason) => {
                    warn!("Native multimodal attempt unavailable: {}", reason);
                    native_failure = Some(reason);
                }
            }
        } else {
            debug!("Model kind {:?} has no native multimodal path", kind);
        }

        // 策略二：视觉辅助文本路径
        let analysis = {
            let vision = self.vision.clone();
            let frame = image.to_rgb8();
            task::spawn_blocking(move || vision.analyze(&frame))
                .await
                .map_err(|e| GenerateError::Unexpected(format!("vision worker panicked: {}", e)))?
        };

        if !analysis.is_placeholder() {
            info!(
                "Resolving multimodal request via vision-assisted text path ({}ms analysis)",
                analysis.elapsed_ms
            );
            let synthetic = compose_vision_prompt(&analysis.summary, prompt);
            let mut generation = self
                .run_text_session(
                    engine,
                    synthetic,
                    preamble.map(|s| s.to_string()),
                    gate.revoke(),
                )
                .await?;
            if generation.kind == GenerationKind::Generated {
                generation.kind = GenerationKind::VisionAssisted;
            }
            return Ok(generation);
        }

        // 策略三：固定说明文本
        if let Some(reason) = native_failure {
            warn!(
                "Multimodal fallback exhausted; original engine failure was: {}",
                reason
            );
        }
        if let Some(mut cb) = gate.revoke() {
            cb(REDUCED_CAPABILITY_NOTICE, true);
        }
        Ok(Generation::notice(REDUCED_CAPABILITY_NOTICE))
    }

    /// 原生多模态尝试
    ///
    /// 任何失败（会话创建、图像处理、引擎错误、超时）都只转入
    /// 下一级策略，原始失败细节保留用于诊断。
    async fn try_native_multimodal(
        &self,
        engine: Arc<dyn InferenceEngine>,
        prompt: &str,
        image: &DynamicImage,
        preamble: Option<&str>,
        gate: Arc<CallbackGate>,
    ) -> Attempt {
        let options = SessionOptions::vision(
            self.config.generation.temperature,
            self.config.generation.top_k,
        );
        let bound = self.config.runtime.image_bound_px;
        let budget = Duration::from_secs(self.config.runtime.timeout_secs);
        let tick = Duration::from_secs(self.config.runtime.liveness_tick_secs);

        let relay = Arc::new(StreamRelay::new());
        let worker_relay = relay.clone();
        let sessions = self.sessions.clone();
        let worker_gate = gate.clone();
        let prompt = prompt.to_string();
        let preamble = preamble.map(|s| s.to_string());
        let image = image.clone();

        // 工作线程负责会话全生命周期：创建、填充、生成、关闭。
        // 超时后等待方先行放弃，原生调用返回时仍由这里关闭会话。
        let _worker = task::spawn_blocking(move || {
            let session = match engine.create_session(&options) {
                Ok(session) => session,
                Err(e) => {
                    worker_relay.fail(e.0);
                    return;
                }
            };
            let (id, slot) = sessions.register(session);

            let outcome = slot.with(|s| -> Result<(), String> {
                if let Some(p) = preamble.as_deref() {
                    if !p.trim().is_empty() {
                        s.add_text(p);
                    }
                }
                if !prompt.trim().is_empty() {
                    s.add_text(&prompt);
                }

                let prepared =
                    media::prepare_for_session(&image, bound).map_err(|e| e.to_string())?;
                s.add_image(prepared).map_err(|e| e.to_string())?;

                s.generate_stream(&mut |delta, done| {
                    // 完成信号延后到会话释放之后，这里只累计与转发
                    worker_relay.push(delta, false);
                    worker_gate.emit(&worker_relay.snapshot(), done);
                })
                .map_err(|e| e.to_string())
            });

            sessions.release(id, &slot);

            match outcome {
                None => worker_relay.fail("session was closed during teardown".to_string()),
                Some(Err(message)) => worker_relay.fail(message),
                Some(Ok(())) => worker_relay.push("", true),
            }
        });

        // 监视器式有界等待：小步轮询以评估预算并输出存活日志
        let wait_relay = relay.clone();
        let waited = task::spawn_blocking(move || wait_relay.wait(budget, tick)).await;

        match waited {
            Err(e) => Attempt::Next(format!("wait worker panicked: {}", e)),
            Ok(WaitOutcome::Done(text)) => Attempt::Resolved(Generation::engine(text)),
            Ok(WaitOutcome::Failed(message)) => {
                if is_accelerator_failure(&message) {
                    debug!("Accelerated vision session unavailable: {}", message);
                }
                Attempt::Next(message)
            }
            Ok(WaitOutcome::TimedOut) => {
                warn!(
                    "Multimodal generation exceeded {}s budget, abandoning the native call",
                    self.config.runtime.timeout_secs
                );
                Attempt::Next(GenerateError::Timeout(self.config.runtime.timeout_secs).to_string())
            }
        }
    }

    /// 文本会话执行
    ///
    /// 创建会话、按序追加分片、生成并在所有路径上释放会话。
    async fn run_text_session(
        &self,
        engine: Arc<dyn InferenceEngine>,
        prompt: String,
        preamble: Option<String>,
        callback: Option<PartialCallback>,
    ) -> Result<Generation, GenerateError> {
        let options = SessionOptions::text(
            self.config.generation.temperature,
            self.config.generation.top_k,
        );
        let sessions = self.sessions.clone();

        let handle = task::spawn_blocking(move || -> Result<String, GenerateError> {
            let session = engine
                .create_session(&options)
                .map_err(|e| GenerateError::Engine(e.0))?;
            let (id, slot) = sessions.register(session);

            let result = slot.with(|s| -> Result<String, GenerateError> {
                if let Some(p) = preamble.as_deref() {
                    if !p.trim().is_empty() {
                        s.add_text(p);
                    }
                }
                s.add_text(&prompt);

                match callback {
                    None => s.generate().map_err(|e| GenerateError::Engine(e.0)),
                    Some(mut cb) => {
                        let mut accumulated = String::new();
                        s.generate_stream(&mut |delta, done| {
                            accumulated.push_str(delta);
                            cb(&accumulated, done);
                        })
                        .map_err(|e| GenerateError::Engine(e.0))?;
                        Ok(accumulated)
                    }
                }
            });

            sessions.release(id, &slot);
            result.unwrap_or_else(|| {
                Err(GenerateError::Engine(
                    "session was closed during teardown".to_string(),
                ))
            })
        });

        let text = handle
            .await
            .map_err(|e| GenerateError::Unexpected(format!("generation worker panicked: {}", e)))??;
        Ok(Generation::engine(text))
    }
}

/// 把视觉描述与原始请求合成一条文本提示
fn compose_vision_prompt(summary: &str, prompt: &str) -> String {
    format!(
        "The user shared an image. An on-device vision analysis described it as: {}\n\n\
         User request: {}\n\nAnswer the request based on the description above.",
        summary, prompt
    )
}
