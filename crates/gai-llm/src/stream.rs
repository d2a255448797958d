//! 响应体按行切分，以及 SSE / NDJSON 两种流式格式的解析。

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;

use crate::{GaiError, Result};

/// 将字节流切成完整的文本行；行可能跨越多个网络分片
pub(crate) fn line_stream<S>(body: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = (Box::pin(body), Vec::<u8>::new(), false);
    futures::stream::unfold(state, |(mut body, mut buf, mut done)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line)
                    .trim_end_matches(|c| c == '\r' || c == '\n')
                    .to_string();
                return Some((Ok(text), (body, buf, done)));
            }
            if done {
                if buf.is_empty() {
                    return None;
                }
                let text = String::from_utf8_lossy(&buf).trim().to_string();
                buf.clear();
                return Some((Ok(text), (body, buf, done)));
            }
            match body.next().await {
                Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    buf.clear();
                    return Some((Err(GaiError::from(e)), (body, buf, true)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

enum SseLine<T> {
    Data(T),
    Done,
    Skip,
}

fn parse_sse_line<T: DeserializeOwned>(line: &str, provider: &str) -> Result<SseLine<T>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(SseLine::Skip);
    }
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    serde_json::from_str(data)
        .map(SseLine::Data)
        .map_err(|e| GaiError::LlmService {
            provider: provider.to_string(),
            message: format!("failed to parse SSE chunk: {}", e),
        })
}

/// 解析 `data: {...}` 事件，直到 `[DONE]` 或连接关闭；extract 返回空串的分片被丢弃
pub(crate) fn sse_deltas<T, F>(
    lines: BoxStream<'static, Result<String>>,
    provider: &'static str,
    extract: F,
) -> BoxStream<'static, Result<String>>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> String + Send + Sync + 'static,
{
    lines
        .map(move |line| line.and_then(|l| parse_sse_line::<T>(&l, provider)))
        .take_while(|item| futures::future::ready(!matches!(item, Ok(SseLine::Done))))
        .filter_map(move |item| {
            let out = match item {
                Ok(SseLine::Data(chunk)) => {
                    let text = extract(chunk);
                    (!text.is_empty()).then_some(Ok(text))
                }
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(out)
        })
        .boxed()
}

/// 每行一个 JSON 对象；extract 返回 (文本增量, 是否结束)
pub(crate) fn ndjson_deltas<T, F>(
    lines: BoxStream<'static, Result<String>>,
    extract: F,
) -> BoxStream<'static, Result<String>>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Result<(String, bool)> + Send + Sync + 'static,
{
    lines
        .filter(|line| futures::future::ready(!matches!(line, Ok(l) if l.trim().is_empty())))
        .map(move |line| {
            line.and_then(|l| serde_json::from_str::<T>(&l).map_err(GaiError::from))
                .and_then(&extract)
        })
        .scan(false, |finished, item| {
            if *finished {
                return futures::future::ready(None);
            }
            let out = match item {
                Ok((text, done)) => {
                    *finished = done;
                    Ok(text)
                }
                Err(e) => {
                    *finished = true;
                    Err(e)
                }
            };
            futures::future::ready(Some(out))
        })
        .filter(|item| futures::future::ready(!matches!(item, Ok(t) if t.is_empty())))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = reqwest::Result<Bytes>> + Send {
        futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[derive(Deserialize)]
    struct Delta {
        text: String,
        #[serde(default)]
        done: bool,
    }

    #[tokio::test]
    async fn lines_survive_chunk_splits() {
        let lines: Vec<String> = line_stream(chunks(&["ab", "c\nde", "f\r\n", "tail"]))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["abc", "def", "tail"]);
    }

    #[tokio::test]
    async fn sse_stops_at_done_marker() {
        let body = chunks(&[
            ": keepalive\n",
            "data: {\"text\":\"Hel\"}\n\n",
            "data: {\"text\":\"lo\"}\n\ndata: [DONE]\n\n",
            "data: {\"text\":\"ignored\"}\n\n",
        ]);
        let out: Vec<String> = sse_deltas(line_stream(body), "test", |d: Delta| d.text)
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn sse_reports_malformed_chunks() {
        let body = chunks(&["data: {oops}\n"]);
        let out: Vec<Result<String>> = sse_deltas(line_stream(body), "test", |d: Delta| d.text)
            .collect()
            .await;
        assert!(matches!(out[0], Err(GaiError::LlmService { .. })));
    }

    #[tokio::test]
    async fn ndjson_ends_after_done_line() {
        let body = chunks(&[
            "{\"text\":\"a\"}\n{\"text\":\"\"}\n",
            "{\"text\":\"b\",\"done\":true}\n{\"text\":\"c\"}\n",
        ]);
        let out: Vec<String> = ndjson_deltas(line_stream(body), |d: Delta| Ok((d.text, d.done)))
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["a", "b"]);
    }
}
