//! Incremental output from lazy sequences.
//!
//! A [`Producer`] is pulled one chunk at a time. Text chunks accumulate in a
//! running buffer that is flushed into a single markdown element, replaced in
//! place on every flush, whenever the configured interval has elapsed or the
//! unflushed text grew past the configured size. Any other chunk closes the
//! text run and is written as its own element.

use std::fmt;
use std::pin::Pin;

use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::context::ScriptContext;
use crate::delta::{DeltaPath, Payload, Table};
use crate::error::{ExceptionPayload, PassError, ScriptError, ScriptResult};
use crate::inbox::InterruptToken;
use crate::render::Renderable;

/// One unit of streamed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamItem {
    Text(String),
    Table(Table),
    Object(Renderable),
}

impl From<&str> for StreamItem {
    fn from(text: &str) -> Self {
        StreamItem::Text(text.to_string())
    }
}

impl From<String> for StreamItem {
    fn from(text: String) -> Self {
        StreamItem::Text(text)
    }
}

impl From<Table> for StreamItem {
    fn from(table: Table) -> Self {
        StreamItem::Table(table)
    }
}

impl From<Renderable> for StreamItem {
    fn from(renderable: Renderable) -> Self {
        StreamItem::Object(renderable)
    }
}

/// Result of one pull.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Item(StreamItem),
    Done,
    Failed(ScriptError),
}

/// Pull contract shared by synchronous and asynchronous sources.
pub trait Producer {
    fn next(&mut self) -> Chunk;
}

impl<P: Producer + ?Sized> Producer for Box<P> {
    fn next(&mut self) -> Chunk {
        (**self).next()
    }
}

/// Adapts an iterator of items.
pub struct IterProducer<I> {
    iter: I,
}

impl<I, T> Producer for IterProducer<I>
where
    I: Iterator<Item = T>,
    T: Into<StreamItem>,
{
    fn next(&mut self) -> Chunk {
        match self.iter.next() {
            Some(item) => Chunk::Item(item.into()),
            None => Chunk::Done,
        }
    }
}

/// Adapts an iterator of fallible items; the first error ends the stream.
pub struct TryIterProducer<I> {
    iter: I,
}

impl<I, T, E> Producer for TryIterProducer<I>
where
    I: Iterator<Item = Result<T, E>>,
    T: Into<StreamItem>,
    E: std::error::Error + 'static,
{
    fn next(&mut self) -> Chunk {
        match self.iter.next() {
            Some(Ok(item)) => Chunk::Item(item.into()),
            Some(Err(err)) => Chunk::Failed(ScriptError::from_error(&err)),
            None => Chunk::Done,
        }
    }
}

/// Adapts an async stream, blocking the pass on each item.
pub struct StreamProducer<S> {
    stream: Pin<Box<S>>,
}

impl<S, T> Producer for StreamProducer<S>
where
    S: Stream<Item = T>,
    T: Into<StreamItem>,
{
    fn next(&mut self) -> Chunk {
        match futures::executor::block_on(self.stream.next()) {
            Some(item) => Chunk::Item(item.into()),
            None => Chunk::Done,
        }
    }
}

pub fn from_iter<I>(items: I) -> IterProducer<I::IntoIter>
where
    I: IntoIterator,
    I::Item: Into<StreamItem>,
{
    IterProducer {
        iter: items.into_iter(),
    }
}

pub fn try_from_iter<I, T, E>(items: I) -> TryIterProducer<I::IntoIter>
where
    I: IntoIterator<Item = Result<T, E>>,
    T: Into<StreamItem>,
    E: std::error::Error + 'static,
{
    TryIterProducer {
        iter: items.into_iter(),
    }
}

pub fn from_stream<S>(stream: S) -> StreamProducer<S>
where
    S: Stream,
    S::Item: Into<StreamItem>,
{
    StreamProducer {
        stream: Box::pin(stream),
    }
}

/// Cursor over a partially consumed producer, valid only for the pass
/// generation that created it.
#[derive(Clone)]
pub struct StreamToken {
    interrupt: InterruptToken,
    pulled: u64,
}

impl StreamToken {
    pub(crate) fn new(interrupt: InterruptToken) -> Self {
        Self { interrupt, pulled: 0 }
    }

    pub fn generation(&self) -> u64 {
        self.interrupt.generation()
    }

    /// Chunks pulled so far.
    pub fn pulled(&self) -> u64 {
        self.pulled
    }

    pub fn is_valid(&self) -> bool {
        !self.interrupt.is_superseded()
    }
}

impl fmt::Debug for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamToken")
            .field("generation", &self.generation())
            .field("pulled", &self.pulled)
            .finish()
    }
}

/// Everything a stream produced, with adjacent text merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamOutput {
    items: Vec<StreamItem>,
}

impl StreamOutput {
    pub fn items(&self) -> &[StreamItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<StreamItem> {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All streamed text, concatenated.
    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter_map(|item| match item {
                StreamItem::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn push(&mut self, item: StreamItem) {
        if let (Some(StreamItem::Text(last)), StreamItem::Text(text)) = (self.items.last_mut(), &item) {
            last.push_str(text);
            return;
        }
        self.items.push(item);
    }
}

/// Text accumulated for the element currently being streamed into.
struct TextRun {
    path: DeltaPath,
    text: String,
    flushed_len: usize,
    last_flush_millis: u64,
}

impl TextRun {
    fn pending_bytes(&self) -> usize {
        self.text.len() - self.flushed_len
    }

    fn flush(&mut self, ctx: &mut ScriptContext<'_>) {
        if self.pending_bytes() == 0 {
            return;
        }
        ctx.emit_at(self.path.clone(), Payload::markdown(self.text.clone()));
        self.flushed_len = self.text.len();
        self.last_flush_millis = ctx.now_millis();
    }
}

pub(crate) fn write_stream<P: Producer>(ctx: &mut ScriptContext<'_>, mut producer: P) -> ScriptResult<StreamOutput> {
    ctx.check_interrupted()?;
    let mut token = ctx.stream_token();
    let flush_interval = ctx.config().stream.flush_interval_ms;
    let flush_bytes = ctx.config().stream.flush_bytes.max(1);
    let mut output = StreamOutput::default();
    let mut run: Option<TextRun> = None;

    loop {
        if !token.is_valid() {
            log::debug!("stream interrupted after {} chunks", token.pulled);
            drop(producer);
            return Err(PassError::Interrupted);
        }
        let chunk = producer.next();
        token.pulled += 1;
        match chunk {
            Chunk::Item(StreamItem::Text(text)) => {
                if text.is_empty() {
                    continue;
                }
                let now = ctx.now_millis();
                let current = run.get_or_insert_with(|| TextRun {
                    path: ctx.allocate_path(),
                    text: String::new(),
                    flushed_len: 0,
                    last_flush_millis: now,
                });
                current.text.push_str(&text);
                output.push(StreamItem::Text(text));
                let elapsed = now.saturating_sub(current.last_flush_millis);
                if elapsed >= flush_interval || current.pending_bytes() >= flush_bytes {
                    current.flush(ctx);
                }
            }
            Chunk::Item(item) => {
                if let Some(mut finished) = run.take() {
                    finished.flush(ctx);
                }
                output.push(item.clone());
                ctx.write_item(item)?;
            }
            Chunk::Done => {
                if let Some(mut finished) = run.take() {
                    finished.flush(ctx);
                }
                return Ok(output);
            }
            Chunk::Failed(err) => {
                if let Some(mut finished) = run.take() {
                    finished.flush(ctx);
                }
                log::error!("stream producer failed: {err}");
                let path = ctx.allocate_path();
                let config = ctx.config();
                let exception = ExceptionPayload::uncaught(
                    &err,
                    config.client.show_error_details,
                    &config.runner.user_frame_prefix,
                );
                ctx.emit_at(path, Payload::Exception { exception });
                return Err(PassError::Script(err.into_reported()));
            }
        }
    }
}
