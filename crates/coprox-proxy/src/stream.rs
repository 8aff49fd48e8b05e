//! Upstream SSE to OpenAI SSE reframing.
//!
//! The upstream body is split into lines, each `data:` line is translated on
//! its own and the result forwarded right away. Nothing is buffered beyond
//! the current partial line. The caller always sees the stream end with
//! `data: [DONE]`, including when the upstream connection fails.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::chat::{ChatRequest, StreamChunk};
use crate::error::{Result, error_body};
use crate::upstream::CopilotClient;

/// Terminal frame of every caller-facing stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Caller-facing stream of complete SSE frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

// ─────────────────────────────────────────────────────────────────────────────
// Line decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Accumulates raw bytes and hands out complete `\n`-terminated lines.
///
/// Works on bytes so a UTF-8 sequence split across network chunks is only
/// decoded once it is whole.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            lines.push(decode_line(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Line translation
// ─────────────────────────────────────────────────────────────────────────────

/// What one upstream line turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// A complete caller-facing frame.
    Frame(String),
    /// Upstream sent the done-sentinel.
    Done,
    /// Nothing to forward for this line.
    Skip,
}

#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    #[serde(default)]
    delta: Option<UpstreamDelta>,
}

#[derive(Debug, Deserialize)]
struct UpstreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Translate one upstream line for a request on `model`.
pub fn translate_line(line: &str, model: &str) -> LineOutcome {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
        return LineOutcome::Skip;
    };

    if payload == "[DONE]" {
        return LineOutcome::Done;
    }

    let chunk: UpstreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed upstream line");
            return LineOutcome::Skip;
        }
    };

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|c| !c.is_empty());

    match content {
        Some(content) => match serde_json::to_string(&StreamChunk::content(model, content)) {
            Ok(json) => LineOutcome::Frame(format!("data: {}\n\n", json)),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to encode stream chunk");
                LineOutcome::Skip
            }
        },
        None => LineOutcome::Skip,
    }
}

/// Frame reporting a failure in the middle of a stream.
pub fn error_frame(message: &str) -> String {
    format!("data: {}\n\n", error_body(message, "stream_error"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream translation
// ─────────────────────────────────────────────────────────────────────────────

/// Reframe an upstream byte stream.
///
/// Each read waits at most `idle_timeout`; a stalled upstream is reported like
/// a failed one. Dropping the returned stream drops `upstream`, which closes
/// the upstream connection.
pub fn translate_stream<S, E>(
    upstream: S,
    model: String,
    idle_timeout: Duration,
) -> impl Stream<Item = Bytes> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut upstream = std::pin::pin!(upstream);
        let mut decoder = SseLineDecoder::new();
        let mut forwarded: usize = 0;

        loop {
            let outcome = match tokio::time::timeout(idle_timeout, upstream.next()).await {
                Ok(Some(Ok(bytes))) => Ok((decoder.push(&bytes), false)),
                Ok(Some(Err(e))) => Err(format!("Upstream stream failed: {}", e)),
                Ok(None) => Ok((decoder.finish().into_iter().collect::<Vec<_>>(), true)),
                Err(_) => Err(format!(
                    "Upstream stream stalled for {}s",
                    idle_timeout.as_secs_f32()
                )),
            };
            let (lines, eof) = match outcome {
                Ok(read) => read,
                Err(message) => {
                    tracing::warn!(error = %message, forwarded, "Upstream stream aborted");
                    yield Bytes::from(error_frame(&message));
                    yield Bytes::from_static(DONE_FRAME.as_bytes());
                    return;
                }
            };

            for line in lines {
                match translate_line(&line, &model) {
                    LineOutcome::Frame(frame) => {
                        forwarded += 1;
                        yield Bytes::from(frame);
                    }
                    LineOutcome::Done => {
                        tracing::debug!(forwarded, "Upstream stream completed");
                        yield Bytes::from_static(DONE_FRAME.as_bytes());
                        return;
                    }
                    LineOutcome::Skip => {}
                }
            }

            if eof {
                tracing::debug!(forwarded, "Upstream closed without done marker");
                yield Bytes::from_static(DONE_FRAME.as_bytes());
                return;
            }
        }
    }
}

/// Streams chat completions from Copilot in the OpenAI frame format.
#[derive(Debug, Clone)]
pub struct StreamTranslator {
    client: CopilotClient,
}

impl StreamTranslator {
    pub fn new(client: CopilotClient) -> Self {
        Self { client }
    }

    /// Open the upstream stream for `request`.
    ///
    /// Upstream status errors are returned before any frame exists.
    pub async fn open(&self, request: &ChatRequest, copilot_token: &str) -> Result<FrameStream> {
        let mut request = request.clone();
        request.stream = true;

        let response = self.client.send(&request, copilot_token).await?;
        Ok(Box::pin(translate_stream(
            response.bytes_stream(),
            request.model,
            self.client.config().request_timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::body::Body;
    use axum::{Router, routing::post};
    use futures::stream;
    use tokio::net::TcpListener;

    use super::*;
    use crate::chat::ChatMessage;
    use crate::upstream::UpstreamConfig;

    fn content_of(frame: &str) -> String {
        let json = frame
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        value["choices"][0]["delta"]["content"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn run(chunks: Vec<std::result::Result<&'static str, &'static str>>) -> Vec<String> {
        let upstream = stream::iter(chunks.into_iter().map(|c| {
            c.map(|s| Bytes::from_static(s.as_bytes()))
                .map_err(io::Error::other)
        }));
        translate_stream(upstream, "gpt-4".to_string(), Duration::from_secs(5))
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
            .await
    }

    #[test]
    fn test_translate_content_line() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"content":"Hi"}}]}"#;
        let LineOutcome::Frame(frame) = translate_line(line, "gpt-4") else {
            panic!("expected a frame");
        };
        assert_eq!(content_of(&frame), "Hi");
        assert!(frame.contains("\"object\":\"chat.completion.chunk\""));
        assert!(frame.contains("\"model\":\"gpt-4\""));
    }

    #[test]
    fn test_translate_skip_rules() {
        for line in [
            "",
            "   ",
            ": keep-alive",
            "event: message",
            r#"data: {"choices":[]}"#,
            r#"data: {"choices":[{"delta":{}}]}"#,
            r#"data: {"choices":[{"delta":{"content":""}}]}"#,
            r#"data: {"choices":[{"delta":{"content":null,"role":"assistant"}}]}"#,
            r#"data: {"id":"no-choices"}"#,
            "data: {not json",
        ] {
            assert_eq!(translate_line(line, "gpt-4"), LineOutcome::Skip, "{:?}", line);
        }
    }

    #[test]
    fn test_translate_done() {
        assert_eq!(translate_line("data: [DONE]", "gpt-4"), LineOutcome::Done);
        assert_eq!(translate_line("data:[DONE]\r", "gpt-4"), LineOutcome::Done);
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = SseLineDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(decoder.push(b":1}\r\ndata: x\n"), vec!["data: {\"a\":1}", "data: x"]);
        assert!(decoder.push(b"tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_keeps_multibyte_chars_intact() {
        let text = "data: héllo\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xc3).unwrap() + 1;

        let mut decoder = SseLineDecoder::new();
        assert!(decoder.push(&text[..split]).is_empty());
        assert_eq!(decoder.push(&text[split..]), vec!["data: héllo"]);
    }

    #[tokio::test]
    async fn test_content_then_done() {
        let frames = run(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n"),
            Ok("data: [DONE]\n\n"),
        ])
        .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(content_of(&frames[0]), "Hi");
        assert_eq!(frames[1], DONE_FRAME);
    }

    #[tokio::test]
    async fn test_empty_choices_do_not_terminate() {
        let frames = run(vec![
            Ok("data: {\"choices\":[]}\n\n"),
            Ok("data: {broken\n\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n"),
            Ok("data: [DONE]\n"),
        ])
        .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(content_of(&frames[0]), "a");
        assert_eq!(content_of(&frames[1]), "b");
        assert_eq!(frames[2], DONE_FRAME);
    }

    #[tokio::test]
    async fn test_frames_split_across_chunks_keep_order() {
        let frames = run(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"con"),
            Ok("tent\":\"one\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"two\"}}]}"),
            Ok("\n\ndata: [DO"),
            Ok("NE]\n\n"),
        ])
        .await;

        let contents: Vec<String> = frames[..2].iter().map(|f| content_of(f)).collect();
        assert_eq!(contents, vec!["one", "two"]);
        assert_eq!(frames[2], DONE_FRAME);
        assert_eq!(frames.len(), 3);
    }

    #[tokio::test]
    async fn test_nothing_forwarded_after_done() {
        let frames = run(vec![Ok(
            "data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
        )])
        .await;

        assert_eq!(frames, vec![DONE_FRAME.to_string()]);
    }

    #[tokio::test]
    async fn test_upstream_failure_yields_error_frame_then_done() {
        let frames = run(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n"),
            Err("connection reset"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n"),
        ])
        .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(content_of(&frames[0]), "partial");

        let error: serde_json::Value = serde_json::from_str(
            frames[1]
                .strip_prefix("data: ")
                .unwrap()
                .trim_end_matches('\n'),
        )
        .unwrap();
        assert_eq!(error["error"]["type"], "stream_error");
        assert!(
            error["error"]["message"]
                .as_str()
                .unwrap()
                .contains("connection reset")
        );
        assert_eq!(frames[2], DONE_FRAME);
    }

    #[tokio::test]
    async fn test_eof_without_done_still_terminates() {
        let frames = run(vec![Ok(
            "data: {\"choices\":[{\"delta\":{\"content\":\"last\"}}]}",
        )])
        .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(content_of(&frames[0]), "last");
        assert_eq!(frames[1], DONE_FRAME);
    }

    #[tokio::test]
    async fn test_empty_upstream() {
        assert_eq!(run(vec![]).await, vec![DONE_FRAME.to_string()]);
    }

    #[tokio::test]
    async fn test_stalled_upstream_yields_error_frame_then_done() {
        let upstream = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        ))])
        .chain(stream::pending());

        let frames: Vec<String> = tokio::time::timeout(
            Duration::from_secs(5),
            translate_stream(upstream, "gpt-4".to_string(), Duration::from_millis(100))
                .map(|b| String::from_utf8(b.to_vec()).unwrap())
                .collect(),
        )
        .await
        .expect("stalled upstream must still terminate");

        assert_eq!(frames.len(), 3);
        assert_eq!(content_of(&frames[0]), "Hi");
        assert!(frames[1].contains("\"stream_error\""), "{}", frames[1]);
        assert!(frames[1].contains("stalled"), "{}", frames[1]);
        assert_eq!(frames[2], DONE_FRAME);
    }

    #[tokio::test]
    async fn test_dropping_frames_drops_upstream() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<std::result::Result<Bytes, io::Error>>();
        tx.unbounded_send(Ok(Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        )))
        .unwrap();

        let mut frames = Box::pin(translate_stream(
            rx,
            "gpt-4".to_string(),
            Duration::from_secs(5),
        ));
        let first = frames.next().await.unwrap();
        assert_eq!(content_of(std::str::from_utf8(&first).unwrap()), "Hi");
        assert!(!tx.is_closed());

        drop(frames);
        assert!(tx.is_closed());
    }

    /// Sets its flag when the mock response body is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dropping_frames_closes_upstream_connection() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let router = Router::new().route(
            "/chat/completions",
            post(move || {
                let flag = flag.clone();
                async move {
                    Body::from_stream(async_stream::stream! {
                        let _guard = DropFlag(flag);
                        loop {
                            yield Ok::<_, Infallible>(Bytes::from_static(
                                b"data: {\"choices\":[{\"delta\":{\"content\":\"tick\"}}]}\n\n",
                            ));
                            tokio::time::sleep(Duration::from_millis(20)).await;
                        }
                    })
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        let client = CopilotClient::new(
            UpstreamConfig::default().with_chat_url(format!("http://{}/chat/completions", addr)),
        )
        .unwrap();
        let request = ChatRequest {
            messages: vec![ChatMessage::new("user", "hi")],
            model: "gpt-4".to_string(),
            temperature: 0.7,
            stream: true,
        };

        let mut frames = StreamTranslator::new(client)
            .open(&request, "copilot-test")
            .await
            .unwrap();
        let first = frames.next().await.unwrap();
        assert_eq!(content_of(std::str::from_utf8(&first).unwrap()), "tick");
        assert!(!closed.load(Ordering::SeqCst));

        drop(frames);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("upstream body should be dropped after the caller goes away");
    }
}
