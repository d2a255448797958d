//! 回答生成与事件流。
//!
//! 先发送一个 context 事件，再按生成顺序发送 answer 增量；流关闭即表示完成。
//! 生产端在独立任务中运行，通过容量有限的通道由消费端拉动；
//! abort 或丢弃 [`AnswerStream`] 会中止生产任务并释放底层连接。

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{AbortHandle, Abortable};
use futures::{Stream, StreamExt};
use gai_core::{ContextDocument, StreamEvent};
use gai_error::Result;
use gai_llm::{ChatModel, CompletionRequest};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::assembler::{answer_messages, AssembledContext};
use crate::prompts::REFUSAL_SENTENCE;

const DEFAULT_BUFFER: usize = 16;

pub struct AnswerGenerator {
    chat: Arc<dyn ChatModel>,
    model: Option<String>,
    buffer: usize,
}

impl AnswerGenerator {
    pub fn new(chat: Arc<dyn ChatModel>, model: Option<String>) -> Self {
        Self {
            chat,
            model,
            buffer: DEFAULT_BUFFER,
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// 必须在 tokio 运行时中调用
    pub fn stream(&self, context: AssembledContext, question: &str) -> AnswerStream {
        let (tx, rx) = mpsc::channel::<Result<StreamEvent>>(self.buffer);
        let (handle, registration) = AbortHandle::new_pair();

        let refuse = context.is_empty();
        let request = CompletionRequest::new(answer_messages(&context, question))
            .model(self.model.clone())
            .temperature(0.0);
        let documents = context.documents;
        let chat = self.chat.clone();

        let producer = async move {
            if tx.send(Ok(StreamEvent::Context(documents))).await.is_err() {
                return;
            }
            if refuse {
                debug!("empty context, answering with the refusal sentence");
                let _ = tx
                    .send(Ok(StreamEvent::Answer(REFUSAL_SENTENCE.to_string())))
                    .await;
                return;
            }

            let mut tokens = match chat.complete_streaming(request).await {
                Ok(tokens) => tokens,
                Err(err) => {
                    warn!(error = %err, "answer generation failed to start");
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };
            while let Some(item) = tokens.next().await {
                match item {
                    Ok(delta) if delta.is_empty() => continue,
                    Ok(delta) => {
                        if tx.send(Ok(StreamEvent::Answer(delta))).await.is_err() {
                            debug!("answer consumer dropped, stopping generation");
                            tokens.abort();
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "answer stream failed");
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        };
        tokio::spawn(Abortable::new(producer, registration));

        AnswerStream {
            inner: ReceiverStream::new(rx),
            handle,
        }
    }
}

/// 回答事件流；拉取驱动，关闭即完成
pub struct AnswerStream {
    inner: ReceiverStream<Result<StreamEvent>>,
    handle: AbortHandle,
}

impl AnswerStream {
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    /// 中止后不再产生任何事件，已缓冲的事件也被丢弃
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// 读到流结束，返回 context 文档与拼接后的完整回答
    pub async fn collect_answer(mut self) -> Result<(Vec<ContextDocument>, String)> {
        let mut context = Vec::new();
        let mut answer = String::new();
        while let Some(event) = self.next().await {
            match event? {
                StreamEvent::Context(docs) => context.extend(docs),
                StreamEvent::Answer(delta) => answer.push_str(&delta),
            }
        }
        Ok((context, answer))
    }
}

impl Stream for AnswerStream {
    type Item = Result<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.handle.is_aborted() {
            return Poll::Ready(None);
        }
        this.inner.poll_next_unpin(cx)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
