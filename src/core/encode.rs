// Streaming line splitter that wraps each line in markup without copying it.
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::core::chunk::{DataChunk, VirtualChunk};
use crate::core::error::Error;
use crate::core::vbuf::VirtualBuffer;

const HTML_PROLOGUE: &str = concat!(
    "<html>\n",
    " <head>\n",
    "  <style type=\"text/css\">\n",
    "    body {\n",
    "      counter-reset: log;\n",
    "      padding: 0;\n",
    "      font: 13px \"Source Code Pro\", Menlo, Monaco, Consolas, \"Courier New\", monospace;\n",
    "      color: #e0e0e0;\n",
    "      background-color: #424242;\n",
    "    }\n",
    "    body > div.line {\n",
    "      position: relative;\n",
    "      display: block;\n",
    "      padding: 0 0 0 30px;\n",
    "      line-height: 20px;\n",
    "      word-break: break-all;\n",
    "    }\n",
    "    body > div.line:before {\n",
    "      counter-increment: log;\n",
    "      content: counter(log);\n",
    "      min-width: 25px;\n",
    "      position: absolute;\n",
    "      text-align: right;\n",
    "      margin-left: -35px;\n",
    "      color: #777;\n",
    "    }\n",
    "  </style>\n",
    " </head>\n",
    " <body>\n",
);
const HTML_EPILOGUE: &str = " </body>\n</html>\n";
const HTML_LINE_OPEN: &str = "  <div class=\"line\">";
const HTML_LINE_CLOSE: &str = "</div>\n";

/// Markers placed around every line, plus optional page framing.
#[derive(Clone, Debug)]
pub struct LineMarkup {
    prologue: Option<Bytes>,
    epilogue: Option<Bytes>,
    open: Bytes,
    close: Bytes,
}

impl LineMarkup {
    /// Bare per-line markers with no page framing.
    pub fn new(open: impl Into<Bytes>, close: impl Into<Bytes>) -> Self {
        Self {
            prologue: None,
            epilogue: None,
            open: open.into(),
            close: close.into(),
        }
    }

    /// A standalone HTML page with one numbered `div` per line.
    pub fn html() -> Self {
        Self {
            prologue: Some(Bytes::from_static(HTML_PROLOGUE.as_bytes())),
            epilogue: Some(Bytes::from_static(HTML_EPILOGUE.as_bytes())),
            open: Bytes::from_static(HTML_LINE_OPEN.as_bytes()),
            close: Bytes::from_static(HTML_LINE_CLOSE.as_bytes()),
        }
    }
}

/// One unit of encoder output.
#[derive(Debug)]
pub enum Encoded {
    /// Constant markup shared by every line.
    Markup(Bytes),
    /// A fragment of line content still backed by the input chunk.
    Line(VirtualChunk),
}

impl Encoded {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Encoded::Markup(bytes) => bytes,
            Encoded::Line(chunk) => chunk.data(),
        }
    }

    /// Hand off the bytes, releasing the fragment's hold on its input chunk.
    ///
    /// The returned `Bytes` shares the chunk's storage and keeps it alive on
    /// its own, so the chunk's release hook may fire before the bytes are used.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Encoded::Markup(bytes) => bytes,
            Encoded::Line(chunk) => chunk.data().clone(),
        }
    }
}

/// Splits a chunk stream on `\n` and wraps every line in markup.
///
/// Line content is emitted as [`VirtualChunk`] views into the input chunks, so a
/// line spanning several chunks comes out as several fragments. Output is
/// produced only as fast as it is polled: a new input chunk is pulled once
/// everything derived from the previous one has been taken.
pub struct LineEncoder<S> {
    upstream: Option<S>,
    markup: LineMarkup,
    pending: VecDeque<Encoded>,
    buffer: VirtualBuffer,
    // Start of the unterminated line in `buffer`.
    position: usize,
    started: bool,
    finished: bool,
    request_id: u64,
}

impl<S> LineEncoder<S> {
    pub fn new(upstream: S, markup: LineMarkup) -> Self {
        Self {
            upstream: Some(upstream),
            markup,
            pending: VecDeque::new(),
            buffer: VirtualBuffer::new(),
            position: 0,
            started: false,
            finished: false,
            request_id: 0,
        }
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = request_id;
        self
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        if let Some(prologue) = &self.markup.prologue {
            self.pending.push_back(Encoded::Markup(prologue.clone()));
        }
    }

    fn on_chunk(&mut self, chunk: DataChunk) {
        self.start();
        // The unterminated tail was already scanned and holds no newline.
        let scanned = self.buffer.len() - self.position;
        self.buffer.offer(VirtualChunk::root(chunk), self.position);
        let mut from = scanned;
        let mut line_start = 0;
        let mut lines = 0u32;
        while let Some(newline) = self.buffer.find_byte(from, b'\n') {
            self.push_line(line_start, newline);
            line_start = newline + 1;
            from = line_start;
            lines += 1;
        }
        self.position = line_start;
        debug!(
            request_id = self.request_id,
            lines,
            position = self.position,
            "encoded chunk"
        );
    }

    fn on_complete(&mut self) {
        self.start();
        let len = self.buffer.len();
        let last_line = len > self.position;
        if last_line {
            self.push_line(self.position, len);
        }
        self.buffer.clear();
        self.position = 0;
        if let Some(epilogue) = &self.markup.epilogue {
            self.pending.push_back(Encoded::Markup(epilogue.clone()));
        }
        debug!(request_id = self.request_id, last_line, "encoding complete");
    }

    fn push_line(&mut self, begin: usize, end: usize) {
        self.pending.push_back(Encoded::Markup(self.markup.open.clone()));
        for view in self.buffer.slice(begin, end) {
            self.pending.push_back(Encoded::Line(view));
        }
        self.pending.push_back(Encoded::Markup(self.markup.close.clone()));
    }
}

impl<S> Stream for LineEncoder<S>
where
    S: Stream<Item = Result<DataChunk, Error>> + Unpin,
{
    type Item = Result<Encoded, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(item)));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            let Some(upstream) = this.upstream.as_mut() else {
                this.finished = true;
                continue;
            };
            match ready!(upstream.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => this.on_chunk(chunk),
                Some(Err(err)) => {
                    this.upstream = None;
                    this.buffer.clear();
                    this.finished = true;
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    this.upstream = None;
                    this.on_complete();
                    this.finished = true;
                }
            }
        }
    }
}
