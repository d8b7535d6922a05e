//! Turns whatever a pipe returned into OpenAI-compatible SSE frames or a
//! single JSON body.

use crate::pipes::{Line, LineIter, LineStream, Pipe, PipeArgs, PipeCall, PipeError, PipeOutput};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use serde_json::{Value, json};
use std::any::Any;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;

pub const DONE_FRAME: &str = "data: [DONE]";

pub type FrameStream = BoxStream<'static, Result<Bytes, Infallible>>;

pub enum Normalized {
    /// SSE frames, written to the response body as they are produced.
    Stream(FrameStream),
    Json(Value),
}

pub fn chunk_template(model: &str, content: &str) -> Value {
    json!({
        "id": format!("{}-{}", model, uuid::Uuid::new_v4()),
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "object": "chat.completion.chunk",
        "choices": [{
            "index": 0,
            "logprobs": null,
            "finish_reason": null,
            "delta": {"content": content},
        }],
    })
}

fn finish_template(model: &str) -> Value {
    let mut chunk = chunk_template(model, "");
    chunk["choices"][0]["finish_reason"] = json!("stop");
    chunk
}

pub fn completion_template(model: &str, content: &str) -> Value {
    json!({
        "id": format!("{}-{}", model, uuid::Uuid::new_v4()),
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "logprobs": null,
            "finish_reason": "stop",
            "message": {"content": content, "role": "assistant"},
        }],
    })
}

pub fn error_body(detail: &str) -> Value {
    json!({"error": {"detail": detail}})
}

pub fn error_frame(detail: &str) -> Bytes {
    frame(&error_body(detail))
}

fn frame(value: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", value))
}

/// Frames one sequence item.
pub fn process_line(model: &str, line: Line) -> Bytes {
    match line {
        Line::Structured(value) => frame(&value),
        Line::Object(map) => frame(&Value::Object(map)),
        Line::Text(text) => process_text(model, text),
        Line::Bytes(raw) => match String::from_utf8(raw.to_vec()) {
            Ok(text) => process_text(model, text),
            // Not text, so there is nothing to wrap.
            Err(_) => raw,
        },
    }
}

fn process_text(model: &str, text: String) -> Bytes {
    if text.starts_with("data:") {
        Bytes::from(format!("{}\n\n", text))
    } else {
        frame(&chunk_template(model, &text))
    }
}

fn line_content(line: Line) -> String {
    match line {
        Line::Text(text) => text,
        Line::Bytes(raw) => String::from_utf8_lossy(&raw).into_owned(),
        Line::Object(map) => Value::Object(map).to_string(),
        Line::Structured(value) => value.to_string(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "pipe panicked".to_string()
    }
}

/// Calls the pipe, turning a panic into an error result.
pub fn call_pipe(pipe: &dyn Pipe, args: PipeArgs) -> PipeCall {
    match std::panic::catch_unwind(AssertUnwindSafe(|| pipe.pipe(args))) {
        Ok(call) => call,
        Err(payload) => PipeCall::Ready(Err(PipeError::Panicked(panic_message(payload)))),
    }
}

/// Awaits the call when it is asynchronous. Panics while polling are caught.
pub async fn execute(call: PipeCall) -> Result<PipeOutput, PipeError> {
    match call {
        PipeCall::Ready(result) => result,
        PipeCall::Pending(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(PipeError::Panicked(panic_message(payload))),
        },
    }
}

pub async fn invoke(pipe: &dyn Pipe, args: PipeArgs, streaming: bool) -> Normalized {
    let model = args.model().to_string();
    let outcome = execute(call_pipe(pipe, args)).await;
    let result = match &outcome {
        Ok(output) => output.kind(),
        Err(_) => "error",
    };
    metrics::counter!("pipegate_pipe_invocations_total", "result" => result).increment(1);
    normalize(outcome, model, streaming).await
}

pub async fn normalize(
    outcome: Result<PipeOutput, PipeError>,
    model: String,
    streaming: bool,
) -> Normalized {
    let output = match outcome {
        Ok(output) => output,
        Err(err) => {
            tracing::error!(model = %model, error = %err, "pipe invocation failed");
            let detail = err.to_string();
            return if streaming {
                Normalized::Stream(single(error_frame(&detail)))
            } else {
                Normalized::Json(error_body(&detail))
            };
        }
    };

    if streaming {
        Normalized::Stream(stream_output(output, model))
    } else {
        collect_output(output, model).await
    }
}

fn stream_output(output: PipeOutput, model: String) -> FrameStream {
    match output {
        PipeOutput::Stream(upstream) => passthrough(upstream),
        PipeOutput::Object(map) => single(frame(&Value::Object(map))),
        PipeOutput::Structured(value) => single(frame(&value)),
        PipeOutput::Text(text) => {
            let frames: Vec<Result<Bytes, Infallible>> = vec![
                Ok(frame(&chunk_template(&model, &text))),
                Ok(frame(&finish_template(&model))),
                Ok(Bytes::from_static(DONE_FRAME.as_bytes())),
            ];
            futures_util::stream::iter(frames).boxed()
        }
        PipeOutput::Iter(iter) => sync_lines(iter, model),
        PipeOutput::AsyncIter(lines) => async_lines(lines, model),
    }
}

fn single(bytes: Bytes) -> FrameStream {
    futures_util::stream::once(async move { Ok::<Bytes, Infallible>(bytes) }).boxed()
}

fn passthrough(mut upstream: crate::pipes::ByteStream) -> FrameStream {
    async_stream::stream! {
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => yield Ok::<Bytes, Infallible>(bytes),
                Err(err) => {
                    tracing::warn!(error = %err, "upstream stream failed");
                    yield Ok::<Bytes, Infallible>(error_frame(&err.to_string()));
                    break;
                }
            }
        }
    }
    .boxed()
}

fn sync_lines(iter: LineIter, model: String) -> FrameStream {
    async_stream::stream! {
        for item in iter {
            match item {
                Ok(line) => yield Ok::<Bytes, Infallible>(process_line(&model, line)),
                Err(err) => {
                    tracing::warn!(model = %model, error = %err, "pipe sequence failed");
                    yield Ok::<Bytes, Infallible>(error_frame(&err.to_string()));
                    return;
                }
            }
        }
        yield Ok::<Bytes, Infallible>(frame(&finish_template(&model)));
        yield Ok::<Bytes, Infallible>(Bytes::from_static(DONE_FRAME.as_bytes()));
    }
    .boxed()
}

fn async_lines(mut lines: LineStream, model: String) -> FrameStream {
    async_stream::stream! {
        while let Some(item) = lines.next().await {
            match item {
                Ok(line) => yield Ok::<Bytes, Infallible>(process_line(&model, line)),
                Err(err) => {
                    tracing::warn!(model = %model, error = %err, "pipe stream failed");
                    yield Ok::<Bytes, Infallible>(error_frame(&err.to_string()));
                    break;
                }
            }
        }
    }
    .boxed()
}

async fn collect_output(output: PipeOutput, model: String) -> Normalized {
    let content = match output {
        PipeOutput::Stream(upstream) => return Normalized::Stream(passthrough(upstream)),
        PipeOutput::Object(map) => return Normalized::Json(Value::Object(map)),
        PipeOutput::Structured(value) => return Normalized::Json(value),
        PipeOutput::Text(text) => text,
        PipeOutput::Iter(iter) => {
            let mut content = String::new();
            for item in iter {
                match item {
                    Ok(line) => content.push_str(&line_content(line)),
                    Err(err) => return Normalized::Json(error_body(&err.to_string())),
                }
            }
            content
        }
        PipeOutput::AsyncIter(mut lines) => {
            let mut content = String::new();
            while let Some(item) = lines.next().await {
                match item {
                    Ok(line) => content.push_str(&line_content(line)),
                    Err(err) => return Normalized::Json(error_body(&err.to_string())),
                }
            }
            content
        }
    };
    Normalized::Json(completion_template(&model, &content))
}
