//! 每轮共享的事件队列
//!
//! 写端有两类：流泵任务（翻译模型原生事件）与工具调用（ask_user / render_chart 等带外事件）；
//! 读端只有消费循环。泵任务在任何退出路径上最后写入 `End`。

use tokio::sync::mpsc;

use crate::stream::StreamEvent;

/// 队列元素：事件或终止哨兵
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Event(StreamEvent),
    End,
}

/// 队列写端（可克隆，交给工具上下文）
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl EventEmitter {
    /// 入队；读端已关闭时返回 false（本轮已结束，事件丢弃）
    pub fn emit(&self, event: StreamEvent) -> bool {
        self.tx.send(QueueItem::Event(event)).is_ok()
    }

    pub(crate) fn finish(&self) {
        let _ = self.tx.send(QueueItem::End);
    }
}

/// 新建一轮的队列
pub fn event_queue() -> (EventEmitter, mpsc::UnboundedReceiver<QueueItem>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventEmitter { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_per_writer_and_sentinel() {
        let (emitter, mut rx) = event_queue();
        let tool_side = emitter.clone();
        assert!(emitter.emit(StreamEvent::text_delta("a")));
        assert!(tool_side.emit(StreamEvent::text_delta("b")));
        emitter.finish();

        assert_eq!(rx.recv().await, Some(QueueItem::Event(StreamEvent::text_delta("a"))));
        assert_eq!(rx.recv().await, Some(QueueItem::Event(StreamEvent::text_delta("b"))));
        assert_eq!(rx.recv().await, Some(QueueItem::End));
    }

    #[tokio::test]
    async fn test_emit_after_reader_dropped() {
        let (emitter, rx) = event_queue();
        drop(rx);
        assert!(!emitter.emit(StreamEvent::done()));
    }
}
