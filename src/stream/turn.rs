//! 单轮驱动：打开会话资源 → 启动模型运行 → 多路合并事件 → 回收 → done
//!
//! 阶段：`Starting → Running → Draining → Closing → Done`。
//! 流泵任务把模型原生事件翻译后写入共享队列，工具调用通过 TurnContext 直接写同一队列；
//! 消费循环按到达顺序读队列，遇到 `End` 哨兵停止。调用方断开（TurnStream 被丢弃或取消）时
//! 每个队列元素检查一次取消，停止投递但仍完整回收：泵任务中止并等待、模型运行关闭、
//! close_turn 执行且只执行一次。

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRunner, RunItem, RunRequest};
use crate::ask_user::{AskUserStore, DEFAULT_ASK_USER_TIMEOUT};
use crate::credentials::SecretMaterial;
use crate::session::{ProviderSet, SessionManager};
use crate::stream::{event_queue, translate_run_event, EventEmitter, QueueItem, StreamEvent};
use crate::tools::{ToolRegistry, Toolbox, TurnContext};
use crate::translate::{translate_pending, Translator};

/// tool_result 预览默认字符数
pub const DEFAULT_TOOL_RESULT_PREVIEW_CHARS: usize = 4_000;

/// 输出通道容量（调用方读得慢时对消费循环形成背压）
const OUTPUT_CAPACITY: usize = 64;

/// 单轮所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Starting,
    Running,
    Draining,
    Closing,
    Done,
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub tool_result_preview_chars: usize,
    pub ask_user_timeout: Duration,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            tool_result_preview_chars: DEFAULT_TOOL_RESULT_PREVIEW_CHARS,
            ask_user_timeout: DEFAULT_ASK_USER_TIMEOUT,
        }
    }
}

/// 一轮的输入
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub owner: String,
    pub secret: SecretMaterial,
    pub run: RunRequest,
    pub conversation_id: Option<String>,
}

/// 轮次引擎：进程内共享，每次 start_turn 启动一个独立的驱动任务
pub struct TurnEngine {
    sessions: Arc<SessionManager>,
    runner: Arc<dyn AgentRunner>,
    ask_user: Arc<AskUserStore>,
    translator: Arc<dyn Translator>,
    functions: ToolRegistry,
    settings: TurnSettings,
}

impl TurnEngine {
    pub fn new(
        sessions: Arc<SessionManager>,
        runner: Arc<dyn AgentRunner>,
        ask_user: Arc<AskUserStore>,
        translator: Arc<dyn Translator>,
    ) -> Self {
        Self {
            sessions,
            runner,
            ask_user,
            translator,
            functions: ToolRegistry::with_builtins(),
            settings: TurnSettings::default(),
        }
    }

    pub fn with_functions(mut self, functions: ToolRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_settings(mut self, settings: TurnSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn ask_user(&self) -> &Arc<AskUserStore> {
        &self.ask_user
    }

    /// 启动一轮；返回的流以 `done` 结束（调用方提前断开时除外）
    pub fn start_turn(self: &Arc<Self>, request: TurnRequest) -> TurnStream {
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let (phase_tx, phase_rx) = watch::channel(TurnPhase::Starting);
        let cancel = CancellationToken::new();

        let driver = TurnDriver {
            engine: Arc::clone(self),
            out: out_tx,
            phase: phase_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.drive(request));

        TurnStream {
            events: out_rx,
            phase: phase_rx,
            cancel,
            driver: Some(task),
        }
    }
}

/// 调用方持有的事件流；丢弃即视为断开
pub struct TurnStream {
    events: mpsc::Receiver<StreamEvent>,
    phase: watch::Receiver<TurnPhase>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl TurnStream {
    pub fn phase(&self) -> TurnPhase {
        *self.phase.borrow()
    }

    /// 通知驱动任务停止投递（回收照常进行）
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 读完剩余事件并等待驱动任务完成回收，返回未读的事件
    pub async fn finish(mut self) -> Vec<StreamEvent> {
        let mut rest = Vec::new();
        while let Some(event) = self.events.recv().await {
            rest.push(event);
        }
        self.join_driver().await;
        rest
    }

    /// 取消并等待回收完成
    pub async fn cancel_and_wait(mut self) {
        self.cancel.cancel();
        self.events.close();
        self.join_driver().await;
    }

    async fn join_driver(&mut self) {
        if let Some(task) = self.driver.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "turn driver task failed");
            }
        }
    }
}

impl Stream for TurnStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        // 驱动任务不随流一起中止：它需要跑完回收
        self.cancel.cancel();
    }
}

struct TurnDriver {
    engine: Arc<TurnEngine>,
    out: mpsc::Sender<StreamEvent>,
    phase: watch::Sender<TurnPhase>,
    cancel: CancellationToken,
}

/// 泵任务退出（包括被中止、panic）时写入终止哨兵
struct FinishOnDrop(EventEmitter);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

impl TurnDriver {
    fn set_phase(&self, phase: TurnPhase) {
        self.phase.send_replace(phase);
    }

    /// 向调用方投递；已断开返回 false
    async fn deliver(&self, event: StreamEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.out.send(event) => sent.is_ok(),
        }
    }

    async fn drive(self, request: TurnRequest) {
        let TurnRequest {
            owner,
            secret,
            run,
            conversation_id,
        } = request;

        let mut set = match self.engine.sessions.open_turn(&owner, &secret).await {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(owner = %owner, error = %e, "turn bootstrap failed");
                self.deliver(StreamEvent::error(e.to_string())).await;
                self.finish(conversation_id).await;
                return;
            }
        };

        let connected = self.run_turn(&mut set, run, conversation_id.clone()).await;

        self.set_phase(TurnPhase::Closing);
        self.engine.sessions.close_turn(&mut set).await;
        tracing::info!(
            turn_id = %set.turn_id(),
            owner = %owner,
            completed = connected,
            cancelled = self.cancel.is_cancelled(),
            "turn finished"
        );
        self.finish(conversation_id).await;
    }

    async fn finish(&self, conversation_id: Option<String>) {
        self.deliver(StreamEvent::Done { conversation_id }).await;
        self.set_phase(TurnPhase::Done);
    }

    /// 进入资源并跑完模型运行；返回是否成功进入运行阶段
    async fn run_turn(
        &self,
        set: &mut ProviderSet,
        run: RunRequest,
        conversation_id: Option<String>,
    ) -> bool {
        let turn_id = set.turn_id().to_string();

        if let Err(e) = set.enter().await {
            tracing::warn!(turn_id = %turn_id, error = %e, "provider connect failed");
            self.deliver(StreamEvent::error(e.to_string())).await;
            return false;
        }
        let toolbox = match Toolbox::build(self.engine.functions.clone(), set.providers()).await {
            Ok(toolbox) => Arc::new(toolbox),
            Err(e) => {
                tracing::warn!(turn_id = %turn_id, error = %e, "tool listing failed");
                self.deliver(StreamEvent::error(e.to_string())).await;
                return false;
            }
        };

        let (emitter, mut queue) = event_queue();
        let ctx = TurnContext {
            turn_id: turn_id.clone(),
            conversation_id,
            emitter: emitter.clone(),
            ask_user: Arc::clone(&self.engine.ask_user),
            ask_user_timeout: self.engine.settings.ask_user_timeout,
        };

        let mut handle = self.engine.runner.run_streamed(run, toolbox, ctx);
        let pump = match handle.take_events() {
            Some(native) => tokio::spawn(pump(
                native,
                emitter,
                self.engine.settings.tool_result_preview_chars,
            )),
            None => {
                emitter.finish();
                tokio::spawn(async {})
            }
        };
        self.set_phase(TurnPhase::Running);

        let mut disconnected = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    disconnected = true;
                    break;
                }
                item = queue.recv() => item,
            };
            let event = match item {
                Some(QueueItem::Event(event)) => event,
                Some(QueueItem::End) | None => break,
            };
            let event = translate_pending(self.engine.translator.as_ref(), event).await;
            if !self.deliver(event).await {
                disconnected = true;
                break;
            }
        }

        self.set_phase(TurnPhase::Draining);
        if !pump.is_finished() {
            tracing::debug!(turn_id = %turn_id, "aborting event pump");
            pump.abort();
        }
        if let Err(e) = pump.await {
            if !e.is_cancelled() {
                tracing::warn!(turn_id = %turn_id, error = %e, "event pump panicked");
            }
        }
        handle.shutdown().await;

        if !disconnected {
            self.deliver(StreamEvent::ContextItems {
                items: handle.input_list(),
            })
            .await;
        } else {
            tracing::info!(turn_id = %turn_id, "client disconnected, stopping delivery");
        }
        true
    }
}

/// 读原生事件 → 翻译 → 入队；运行失败转为 error 事件；任何退出路径最后写入 End
async fn pump(
    mut native: mpsc::UnboundedReceiver<RunItem>,
    emitter: EventEmitter,
    preview_chars: usize,
) {
    let guard = FinishOnDrop(emitter);
    while let Some(item) = native.recv().await {
        match item {
            Ok(event) => {
                if let Some(event) = translate_run_event(event, preview_chars) {
                    guard.0.emit(event);
                }
            }
            Err(e) => {
                guard.0.emit(StreamEvent::error(e.to_string()));
                break;
            }
        }
    }
}
