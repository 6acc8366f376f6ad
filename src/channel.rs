/*!
 * Channels between pipeline stages
 *
 * A channel carries items of three shapes (buffer, text, stream) from exactly one
 * producing stage to exactly one consuming stage. Capacity is bounded so a fast
 * producer blocks on emission until the consumer catches up.
 *
 * End of data is an explicit close frame. A writer dropped without closing is seen
 * by the reader as an aborted upstream, never as a clean end.
 */

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::trace;

use crate::error::{FlowError, Result};

/// Lazy, single-pass sequence of byte chunks
pub struct ByteStream {
    inner: Box<dyn Iterator<Item = io::Result<Bytes>> + Send>,
}

impl ByteStream {
    /// Wrap any chunk iterator
    pub fn new<I>(chunks: I) -> Self
    where
        I: Iterator<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Box::new(chunks),
        }
    }

    /// Promote a buffer to a single-chunk stream
    pub fn once(bytes: Bytes) -> Self {
        Self::new(std::iter::once(Ok(bytes)))
    }

    /// Drain the stream into one contiguous buffer
    pub fn read_to_end(self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        for chunk in self {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

impl Iterator for ByteStream {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ByteStream { .. }")
    }
}

/// Shape of an item travelling through a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Buffer,
    Text,
    Stream,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Buffer => write!(f, "buffer"),
            Shape::Text => write!(f, "text"),
            Shape::Stream => write!(f, "stream"),
        }
    }
}

/// One unit of data in a channel
#[derive(Debug)]
pub enum Item {
    /// Fully materialized bytes
    Buffer(Bytes),
    /// Fully materialized string
    Text(String),
    /// Lazy chunk sequence
    Stream(ByteStream),
}

impl Item {
    pub fn shape(&self) -> Shape {
        match self {
            Item::Buffer(_) => Shape::Buffer,
            Item::Text(_) => Shape::Text,
            Item::Stream(_) => Shape::Stream,
        }
    }

    /// Materialize the item as bytes, draining streams
    pub fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            Item::Buffer(bytes) => Ok(bytes),
            Item::Text(text) => Ok(Bytes::from(text)),
            Item::Stream(stream) => stream.read_to_end(),
        }
    }
}

/// Wire frame: an item or the terminal close marker
#[derive(Debug)]
pub(crate) enum Frame {
    Item(Item),
    Close,
}

/// Create a bounded channel
///
/// `capacity` is the number of items that may be in flight before the writer
/// blocks; `0` makes every emission a rendezvous with the reader.
pub fn channel(name: impl Into<String>, capacity: usize) -> (ChannelWriter, ChannelReader) {
    let name: Arc<str> = Arc::from(name.into());
    let (tx, rx) = bounded(capacity);

    (
        ChannelWriter {
            name: name.clone(),
            tx,
            emitted: 0,
        },
        ChannelReader {
            name,
            rx,
            state: ReadState::Open,
        },
    )
}

/// Producing end of a channel
///
/// `close` consumes the writer, so nothing can be emitted after close and a
/// channel is closed at most once.
#[derive(Debug)]
pub struct ChannelWriter {
    name: Arc<str>,
    tx: Sender<Frame>,
    emitted: u64,
}

impl ChannelWriter {
    /// Emit a fully materialized byte buffer
    pub fn buffer(&mut self, bytes: impl Into<Bytes>) -> Result<()> {
        self.emit(Item::Buffer(bytes.into()))
    }

    /// Emit a string
    pub fn text(&mut self, text: impl Into<String>) -> Result<()> {
        self.emit(Item::Text(text.into()))
    }

    /// Emit a lazy chunk stream
    pub fn stream(&mut self, stream: ByteStream) -> Result<()> {
        self.emit(Item::Stream(stream))
    }

    /// Emit an item, blocking while the channel is full
    pub fn emit(&mut self, item: Item) -> Result<()> {
        let shape = item.shape();
        self.tx
            .send(Frame::Item(item))
            .map_err(|_| FlowError::DownstreamClosed {
                channel: self.name.to_string(),
            })?;
        self.emitted += 1;
        trace!(channel = %self.name, %shape, seq = self.emitted, "emitted item");
        Ok(())
    }

    /// Signal end of data
    pub fn close(self) -> Result<()> {
        self.tx
            .send(Frame::Close)
            .map_err(|_| FlowError::DownstreamClosed {
                channel: self.name.to_string(),
            })?;
        trace!(channel = %self.name, items = self.emitted, "closed channel");
        Ok(())
    }

    /// Number of items emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Open,
    Closed,
    Aborted,
}

/// Consuming end of a channel
///
/// Iterating yields `Ok(item)` for each emitted item and ends after the close
/// frame. If the writer disappears without closing, a single
/// `Err(UpstreamAborted)` is yielded before the iterator ends.
#[derive(Debug)]
pub struct ChannelReader {
    name: Arc<str>,
    rx: Receiver<Frame>,
    state: ReadState,
}

impl ChannelReader {
    /// Iterate buffer items; any other shape fails with `ShapeMismatch`
    pub fn buffers<'a>(&'a mut self, stage: &'a str) -> impl Iterator<Item = Result<Bytes>> + 'a {
        self.map(move |item| match item? {
            Item::Buffer(bytes) => Ok(bytes),
            other => Err(FlowError::shape_mismatch(stage, "buffer", other.shape())),
        })
    }

    /// Iterate text items; any other shape fails with `ShapeMismatch`
    pub fn texts<'a>(&'a mut self, stage: &'a str) -> impl Iterator<Item = Result<String>> + 'a {
        self.map(move |item| match item? {
            Item::Text(text) => Ok(text),
            other => Err(FlowError::shape_mismatch(stage, "text", other.shape())),
        })
    }

    /// Iterate stream items, promoting buffers to single-chunk streams; text
    /// fails with `ShapeMismatch`
    pub fn streams<'a>(
        &'a mut self,
        stage: &'a str,
    ) -> impl Iterator<Item = Result<ByteStream>> + 'a {
        self.map(move |item| match item? {
            Item::Stream(stream) => Ok(stream),
            Item::Buffer(bytes) => Ok(ByteStream::once(bytes)),
            other => Err(FlowError::shape_mismatch(stage, "buffer or stream", other.shape())),
        })
    }

    /// True once the close frame has been observed
    pub fn is_closed(&self) -> bool {
        self.state == ReadState::Closed
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw frame access, bypassing close bookkeeping
    #[cfg(test)]
    pub(crate) fn recv_frame(&self) -> Option<Frame> {
        self.rx.recv().ok()
    }
}

impl Iterator for ChannelReader {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != ReadState::Open {
            return None;
        }

        match self.rx.recv() {
            Ok(Frame::Item(item)) => Some(Ok(item)),
            Ok(Frame::Close) => {
                self.state = ReadState::Closed;
                None
            }
            Err(_) => {
                self.state = ReadState::Aborted;
                Some(Err(FlowError::UpstreamAborted {
                    channel: self.name.to_string(),
                }))
            }
        }
    }
}
