//! 在线会话登记表
//!
//! 每个创建出来的会话（文本或多模态）都在单把协调锁下登记，
//! 关闭时注销。批量回收操作能随时清空全部登记会话，单个会话
//! 关闭失败只记录日志，不会中断清扫。模型卸载与全局清理都走
//! 这条路径。

use crate::engine::InferenceSession;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// 单个会话的持有槽
///
/// 会话在生成期间由工作线程独占（持锁），清扫方用 `try_lock`
/// 避让正在推理的会话。`Option` 保证关闭幂等。
pub(crate) struct SessionSlot {
    inner: Mutex<Option<Box<dyn InferenceSession>>>,
}

impl SessionSlot {
    fn new(session: Box<dyn InferenceSession>) -> Self {
        Self {
            inner: Mutex::new(Some(session)),
        }
    }

    /// 在持锁状态下访问会话；会话已被清扫时返回 `None`
    pub(crate) fn with<R>(
        &self,
        f: impl FnOnce(&mut dyn InferenceSession) -> R,
    ) -> Option<R> {
        let mut guard = self.inner.lock().unwrap();
        guard.as_mut().map(|session| f(session.as_mut()))
    }

    /// 立即关闭（幂等）
    fn close_now(&self, id: Uuid) {
        let taken = self.inner.lock().unwrap().take();
        if let Some(mut session) = taken {
            if let Err(e) = session.close() {
                warn!("Failed to close session {}: {}", id, e);
            } else {
                debug!("Closed session {}", id);
            }
        }
    }
}

/// 在线会话登记表
#[derive(Default)]
pub(crate) struct SessionRegistry {
    slots: Mutex<HashMap<Uuid, Arc<SessionSlot>>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 登记新会话，返回会话 ID 与持有槽
    pub(crate) fn register(
        &self,
        session: Box<dyn InferenceSession>,
    ) -> (Uuid, Arc<SessionSlot>) {
        let id = Uuid::new_v4();
        let slot = Arc::new(SessionSlot::new(session));
        self.slots.lock().unwrap().insert(id, slot.clone());
        debug!("Registered session {}", id);
        (id, slot)
    }

    /// 注销并关闭一个会话
    ///
    /// 正常路径与错误路径都必须走到这里；槽可能已被清扫，关闭幂等。
    pub(crate) fn release(&self, id: Uuid, slot: &SessionSlot) {
        self.slots.lock().unwrap().remove(&id);
        slot.close_now(id);
    }

    /// 清空全部登记会话
    ///
    /// 正在被工作线程占用的会话无法同步关闭：从登记表移除后
    /// 由其工作线程在收尾时关闭。
    pub(crate) fn release_all(&self) {
        let drained: Vec<(Uuid, Arc<SessionSlot>)> =
            self.slots.lock().unwrap().drain().collect();

        if drained.is_empty() {
            return;
        }

        debug!("Releasing {} live sessions", drained.len());
        for (id, slot) in drained {
            match slot.inner.try_lock() {
                Ok(mut guard) => {
                    if let Some(mut session) = guard.take() {
                        if let Err(e) = session.close() {
                            warn!("Failed to close session {} during sweep: {}", id, e);
                        }
                    }
                }
                Err(_) => {
                    warn!("Session {} still busy; its worker will close it", id);
                }
            }
        }
    }

    /// 当前登记在案的会话数量
    pub(crate) fn live_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, StreamCallback};
    use image::RgbImage;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestSession {
        closed: Arc<AtomicBool>,
        fail_close: bool,
    }

    impl InferenceSession for TestSession {
        fn add_text(&mut self, _text: &str) {}
        fn add_image(&mut self, _image: RgbImage) -> Result<(), EngineError> {
            Ok(())
        }
        fn generate(&mut self) -> Result<String, EngineError> {
            Ok(String::new())
        }
        fn generate_stream(&mut self, _on_delta: StreamCallback<'_>) -> Result<(), EngineError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), EngineError> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail_close {
                Err(EngineError::new("close failed"))
            } else {
                Ok(())
            }
        }
    }

    fn session(closed: &Arc<AtomicBool>, fail_close: bool) -> Box<dyn InferenceSession> {
        Box::new(TestSession {
            closed: closed.clone(),
            fail_close,
        })
    }

    #[test]
    fn test_register_and_release() {
        let registry = SessionRegistry::new();
        let closed = Arc::new(AtomicBool::new(false));

        let (id, slot) = registry.register(session(&closed, false));
        assert_eq!(registry.live_count(), 1);

        registry.release(id, &slot);
        assert_eq!(registry.live_count(), 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = SessionRegistry::new();
        let closed = Arc::new(AtomicBool::new(false));

        let (id, slot) = registry.register(session(&closed, false));
        registry.release(id, &slot);
        registry.release(id, &slot);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_release_all_tolerates_close_failures() {
        let registry = SessionRegistry::new();
        let closed_a = Arc::new(AtomicBool::new(false));
        let closed_b = Arc::new(AtomicBool::new(false));

        registry.register(session(&closed_a, true));
        registry.register(session(&closed_b, false));
        assert_eq!(registry.live_count(), 2);

        registry.release_all();
        assert_eq!(registry.live_count(), 0);
        // 第一个会话关闭失败不影响第二个被关掉
        assert!(closed_a.load(Ordering::SeqCst));
        assert!(closed_b.load(Ordering::SeqCst));
    }

    #[test]
    fn test_swept_slot_is_gone_for_worker() {
        let registry = SessionRegistry::new();
        let closed = Arc::new(AtomicBool::new(false));

        let (_id, slot) = registry.register(session(&closed, false));
        registry.release_all();

        // 工作线程随后访问只会看到空槽
        assert!(slot.with(|_s| ()).is_none());
    }
}
