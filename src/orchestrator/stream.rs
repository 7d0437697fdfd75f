//! 流式生成中继
//!
//! 引擎回调在其自身执行线程上把增量文本推入中继；等待方用单把锁
//! 加条件变量做监视器式等待，按固定小步长轮询，以便同时评估
//! 时间预算并周期性输出存活日志。
//!
//! 已知限制：超时只是放弃等待，底层原生调用无法取消，可能继续在
//! 后台运行并产生迟到回调。每个请求独占一个中继实例，迟到回调
//! 只会写入它自己那个已被放弃的缓冲区，不会串入后续请求。

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// 等待轮询步长
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 等待结果
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    /// 生成完成，携带累计全文
    Done(String),
    /// 引擎侧失败
    Failed(String),
    /// 超出时间预算，放弃等待
    TimedOut,
}

#[derive(Default)]
struct RelayState {
    text: String,
    done: bool,
    failed: Option<String>,
}

/// 单次请求的流式缓冲
pub(crate) struct StreamRelay {
    state: Mutex<RelayState>,
    cv: Condvar,
}

impl StreamRelay {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            cv: Condvar::new(),
        }
    }

    /// 引擎回调入口：追加增量并在结束时置位
    pub(crate) fn push(&self, delta: &str, done: bool) {
        let mut state = self.state.lock().unwrap();
        state.text.push_str(delta);
        if done {
            state.done = true;
        }
        self.cv.notify_all();
    }

    /// 标记引擎侧失败
    pub(crate) fn fail(&self, message: String) {
        let mut state = self.state.lock().unwrap();
        state.failed = Some(message);
        state.done = true;
        self.cv.notify_all();
    }

    /// 当前累计文本快照
    pub(crate) fn snapshot(&self) -> String {
        self.state.lock().unwrap().text.clone()
    }

    /// 阻塞等待完成
    ///
    /// `budget` 为总时间预算；每过 `liveness_tick` 输出一次存活日志。
    /// 在阻塞线程池上调用。
    pub(crate) fn wait(&self, budget: Duration, liveness_tick: Duration) -> WaitOutcome {
        let start = Instant::now();
        let mut last_tick = Instant::now();
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(message) = state.failed.take() {
                return WaitOutcome::Failed(message);
            }
            if state.done {
                return WaitOutcome::Done(state.text.clone());
            }

            let elapsed = start.elapsed();
            if elapsed >= budget {
                debug!("Generation wait abandoned after {:?}", elapsed);
                return WaitOutcome::TimedOut;
            }

            if last_tick.elapsed() >= liveness_tick {
                debug!(
                    "Still waiting for generation ({}s elapsed, {} chars so far)",
                    elapsed.as_secs(),
                    state.text.len()
                );
                last_tick = Instant::now();
            }

            let step = POLL_INTERVAL.min(budget - elapsed);
            let (guard, _timeout) = self.cv.wait_timeout(state, step).unwrap();
            state = guard;
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_returns_accumulated_text() {
        let relay = Arc::new(StreamRelay::new());
        let pusher = relay.clone();
        thread::spawn(move || {
            pusher.push("Hello", false);
            pusher.push(", world", true);
        });

        match relay.wait(Duration::from_secs(5), Duration::from_secs(1)) {
            WaitOutcome::Done(text) => assert_eq!(text, "Hello, world"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_wait_times_out() {
        let relay = StreamRelay::new();
        let outcome = relay.wait(Duration::from_millis(50), Duration::from_secs(1));
        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[test]
    fn test_wait_surfaces_failure() {
        let relay = Arc::new(StreamRelay::new());
        let failer = relay.clone();
        thread::spawn(move || {
            failer.push("partial", false);
            failer.fail("backend crashed".to_string());
        });

        match relay.wait(Duration::from_secs(5), Duration::from_secs(1)) {
            WaitOutcome::Failed(message) => assert_eq!(message, "backend crashed"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_late_push_after_timeout_is_isolated() {
        let relay = Arc::new(StreamRelay::new());
        let outcome = relay.wait(Duration::from_millis(10), Duration::from_secs(1));
        assert!(matches!(outcome, WaitOutcome::TimedOut));

        // 迟到回调只影响这个已放弃的缓冲区
        relay.push("too late", true);
        assert_eq!(relay.snapshot(), "too late");
    }
}
