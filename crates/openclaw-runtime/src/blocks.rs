//! Streaming block aggregation.
//!
//! Folds raw provider text deltas into blocks: paragraphs (split on blank
//! lines), fenced code blocks (kept whole from opening to closing fence),
//! and tool-call blocks. Purely synchronous; the agent loop publishes the
//! emitted events as `chat.delta` / `chat.block_end`.
//!
//! Chunk boundaries are arbitrary — a fence may arrive one backtick at a
//! time — so the aggregator holds the smallest possible lookahead: up to
//! three backticks at a line start.

use openclaw_types::event::BlockKind;

/// Output of feeding the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEvent {
    Delta {
        index: usize,
        kind: BlockKind,
        partial: String,
    },
    End {
        index: usize,
        kind: BlockKind,
    },
}

#[derive(Default)]
pub struct BlockAggregator {
    next_index: usize,
    current: Option<(usize, BlockKind)>,
    /// Content accumulated for the current block since the last flush.
    delta: String,
    at_line_start: bool,
    /// Backticks seen at a line start, pending fence classification.
    ticks: String,
    /// Consuming the remainder of a ``` fence line (language tag etc).
    in_fence_line: bool,
    /// The fence line being consumed closes the current code block.
    fence_closing: bool,
    /// One newline seen in text mode; a second closes the paragraph.
    newline_pending: bool,
}

impl BlockAggregator {
    pub fn new() -> Self {
        Self {
            at_line_start: true,
            ..Default::default()
        }
    }

    /// Blocks emitted so far (open block included).
    pub fn block_count(&self) -> usize {
        self.next_index
    }

    /// Feed a text delta; returns the block events it produced.
    pub fn feed_text(&mut self, text: &str) -> Vec<BlockEvent> {
        let mut events = Vec::new();
        for c in text.chars() {
            self.step(c, &mut events);
        }
        self.flush_delta(&mut events);
        events
    }

    /// A complete tool call arrived: emit it as its own block.
    pub fn tool_call_block(&mut self, rendered: &str) -> Vec<BlockEvent> {
        let mut events = Vec::new();
        self.close_current(&mut events);
        let index = self.open(BlockKind::ToolCall);
        self.delta.push_str(rendered);
        self.flush_delta(&mut events);
        events.push(BlockEvent::End {
            index,
            kind: BlockKind::ToolCall,
        });
        self.current = None;
        events
    }

    /// The stream ended: close whatever is open.
    pub fn finish(&mut self) -> Vec<BlockEvent> {
        let mut events = Vec::new();
        // Stray backticks that never became a fence are plain text.
        if !self.ticks.is_empty() {
            let ticks = std::mem::take(&mut self.ticks);
            for c in ticks.chars() {
                self.normal_char(c, &mut events);
            }
        }
        self.close_current(&mut events);
        events
    }

    // -- state machine ------------------------------------------------------

    fn step(&mut self, c: char, events: &mut Vec<BlockEvent>) {
        if self.in_fence_line {
            self.delta.push(c);
            if c == '\n' {
                self.in_fence_line = false;
                self.at_line_start = true;
                if self.fence_closing {
                    self.fence_closing = false;
                    self.close_current(events);
                }
            }
            return;
        }

        if self.at_line_start && c == '`' && self.ticks.len() < 3 {
            self.ticks.push(c);
            if self.ticks.len() == 3 {
                self.ticks.clear();
                self.begin_fence_line(events);
            }
            return;
        }

        if !self.ticks.is_empty() {
            // Fewer than three backticks: ordinary text after all.
            let ticks = std::mem::take(&mut self.ticks);
            for t in ticks.chars() {
                self.normal_char(t, events);
            }
        }
        self.normal_char(c, events);
    }

    fn begin_fence_line(&mut self, events: &mut Vec<BlockEvent>) {
        match self.current {
            Some((_, BlockKind::Code)) => {
                // Closing fence: belongs to the code block, which ends once
                // the fence line completes.
                self.delta.push_str("```");
                self.in_fence_line = true;
                self.fence_closing = true;
            }
            _ => {
                self.close_current(events);
                self.open(BlockKind::Code);
                self.delta.push_str("```");
                self.in_fence_line = true;
                self.fence_closing = false;
            }
        }
        self.at_line_start = false;
    }

    fn normal_char(&mut self, c: char, events: &mut Vec<BlockEvent>) {
        if let Some((_, BlockKind::Code)) = self.current {
            self.delta.push(c);
            self.at_line_start = c == '\n';
            return;
        }

        if c == '\n' {
            if self.current.is_some() {
                if self.newline_pending {
                    // Blank line: paragraph boundary.
                    self.newline_pending = false;
                    self.close_current(events);
                } else {
                    self.newline_pending = true;
                }
            }
            self.at_line_start = true;
            return;
        }

        if self.newline_pending {
            self.newline_pending = false;
            if self.current.is_some() {
                self.delta.push('\n');
            }
        }
        if self.current.is_none() {
            self.open(BlockKind::Text);
        }
        self.delta.push(c);
        self.at_line_start = false;
    }

    fn open(&mut self, kind: BlockKind) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.current = Some((index, kind));
        index
    }

    fn close_current(&mut self, events: &mut Vec<BlockEvent>) {
        self.flush_delta(events);
        if let Some((index, kind)) = self.current.take() {
            events.push(BlockEvent::End { index, kind });
        }
        self.newline_pending = false;
    }

    fn flush_delta(&mut self, events: &mut Vec<BlockEvent>) {
        if self.delta.is_empty() {
            return;
        }
        if let Some((index, kind)) = self.current {
            events.push(BlockEvent::Delta {
                index,
                kind,
                partial: std::mem::take(&mut self.delta),
            });
        } else {
            self.delta.clear();
        }
    }
}
