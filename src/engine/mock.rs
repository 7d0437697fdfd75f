//! 测试桩引擎
//!
//! 可脚本化的加载器/引擎/会话实现，用于在没有真实模型的情况下
//! 完整测试编排器：记录追加的分片与附加的图像，可按配置让视觉
//! 会话失败、延迟生成或整个加载 panic。

use super::{EngineError, InferenceEngine, InferenceSession, SessionOptions, StreamCallback};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 会话的应答方式
#[derive(Clone)]
pub(crate) enum MockResponse {
    /// 固定文本
    Fixed(String),
    /// 回显全部文本分片（换行拼接）
    Echo,
}

#[derive(Default)]
struct MockState {
    response: Mutex<Option<MockResponse>>,
    vision_failure: Mutex<Option<String>>,
    image_delay: Mutex<Option<Duration>>,
    created_options: Mutex<Vec<SessionOptions>>,
    chunk_log: Mutex<Vec<String>>,
    image_log: Mutex<Vec<(u32, u32)>>,
}

/// 脚本化引擎
pub(crate) struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub(crate) fn new(response: MockResponse) -> Arc<Self> {
        let state = MockState::default();
        *state.response.lock().unwrap() = Some(response);
        Arc::new(Self {
            state: Arc::new(state),
        })
    }

    /// 所有会话都返回固定文本
    pub(crate) fn fixed(text: &str) -> Arc<Self> {
        Self::new(MockResponse::Fixed(text.to_string()))
    }

    /// 让所有视觉会话的创建以指定消息失败
    pub(crate) fn fail_vision_sessions(&self, message: &str) {
        *self.state.vision_failure.lock().unwrap() = Some(message.to_string());
    }

    /// 附加了图像的会话在生成前休眠指定时长
    pub(crate) fn delay_image_generation(&self, delay: Duration) {
        *self.state.image_delay.lock().unwrap() = Some(delay);
    }

    /// 历次 `create_session` 收到的参数
    pub(crate) fn created_options(&self) -> Vec<SessionOptions> {
        self.state.created_options.lock().unwrap().clone()
    }

    /// 最近一次生成时会话里的文本分片
    pub(crate) fn last_chunks(&self) -> Vec<String> {
        self.state.chunk_log.lock().unwrap().clone()
    }

    /// 历次附加图像的尺寸
    pub(crate) fn attached_images(&self) -> Vec<(u32, u32)> {
        self.state.image_log.lock().unwrap().clone()
    }
}

impl InferenceEngine for MockEngine {
    fn create_session(
        &self,
        options: &SessionOptions,
    ) -> Result<Box<dyn InferenceSession>, EngineError> {
        self.state
            .created_options
            .lock()
            .unwrap()
            .push(options.clone());

        if options.enable_vision {
            if let Some(message) = self.state.vision_failure.lock().unwrap().clone() {
                return Err(EngineError(message));
            }
        }

        Ok(Box::new(MockSession {
            state: self.state.clone(),
            chunks: Vec::new(),
            image: None,
            closed: false,
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
    chunks: Vec<String>,
    image: Option<(u32, u32)>,
    closed: bool,
}

impl MockSession {
    fn produce(&self) -> String {
        if self.image.is_some() {
            if let Some(delay) = *self.state.image_delay.lock().unwrap() {
                std::thread::sleep(delay);
            }
        }

        *self.state.chunk_log.lock().unwrap() = self.chunks.clone();

        let response = self.state.response.lock().unwrap().clone();
        match response {
            Some(MockResponse::Fixed(text)) => text,
            Some(MockResponse::Echo) => self.chunks.join("\n"),
            None => String::new(),
        }
    }
}

impl InferenceSession for MockSession {
    fn add_text(&mut self, text: &str) {
        self.chunks.push(text.to_string());
    }

    fn add_image(&mut self, image: RgbImage) -> Result<(), EngineError> {
        if self.image.is_some() {
            return Err(EngineError::new("image already attached to this session"));
        }
        let dims = (image.width(), image.height());
        self.image = Some(dims);
        self.state.image_log.lock().unwrap().push(dims);
        Ok(())
    }

    fn generate(&mut self) -> Result<String, EngineError> {
        Ok(self.produce())
    }

    fn generate_stream(&mut self, on_delta: StreamCallback<'_>) -> Result<(), EngineError> {
        let text = self.produce();
        if text.is_empty() {
            on_delta("", true);
            return Ok(());
        }

        // 拆成两段增量，模拟逐段推送
        let mid = text.len() / 2;
        let mid = (0..=mid)
            .rev()
            .find(|i| text.is_char_boundary(*i))
            .unwrap_or(0);
        on_delta(&text[..mid], false);
        on_delta(&text[mid..], true);
        Ok(())
    }

    fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::new("session already closed"));
        }
        self.closed = true;
        Ok(())
    }
}

/// 加载行为脚本
pub(crate) enum LoadBehavior {
    Succeed(Arc<MockEngine>),
    Fail(String),
    Panic,
}

/// 脚本化加载器
pub(crate) struct MockLoader {
    behavior: LoadBehavior,
    calls: Mutex<Vec<(PathBuf, u32)>>,
}

impl MockLoader {
    pub(crate) fn new(behavior: LoadBehavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 历次 `load` 调用的参数
    pub(crate) fn calls(&self) -> Vec<(PathBuf, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

impl super::EngineLoader for MockLoader {
    fn load(&self, path: &Path, max_images: u32) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), max_images));

        match &self.behavior {
            LoadBehavior::Succeed(engine) => Ok(engine.clone()),
            LoadBehavior::Fail(message) => Err(EngineError(message.clone())),
            LoadBehavior::Panic => panic!("scripted loader panic"),
        }
    }
}
