// Copyright 2024 The Tempstash Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tempstash_error::{make_err, Code, Error, ResultExt};
use tokio::sync::mpsc;

/// Create a channel pair used to move byte buffers between components. The
/// wrapper manages EOF explicitly: an empty `Bytes` returned from
/// [`DropCloserReadHalf::recv`] means the writer finished cleanly, while a
/// writer dropped before sending EOF delivers an error to the reader so
/// that truncated streams are never mistaken for complete ones.
pub fn make_buf_channel_pair() -> (DropCloserWriteHalf, DropCloserReadHalf) {
    // Two buffered chunks gives the producer a little headroom to prepare
    // the next buffer while the consumer drains the previous one, without
    // letting either side run far ahead.
    let (tx, rx) = mpsc::channel(2);
    (
        DropCloserWriteHalf {
            tx: Some(tx),
            bytes_written: 0,
        },
        DropCloserReadHalf {
            rx,
            partial: None,
            bytes_received: 0,
        },
    )
}

/// Writer half of the pair.
pub struct DropCloserWriteHalf {
    tx: Option<mpsc::Sender<Result<Bytes, Error>>>,
    bytes_written: u64,
}

impl DropCloserWriteHalf {
    /// Sends data over the channel to the receiver.
    pub async fn send(&mut self, buf: Bytes) -> Result<(), Error> {
        if buf.is_empty() {
            return Err(make_err!(
                Code::Internal,
                "Cannot send EOF in send(). Instead use send_eof()"
            ));
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| make_err!(Code::Internal, "Tried to send while stream is closed"))?;
        let buf_len = buf.len() as u64;
        let result = tx.send(Ok(buf)).await.map_err(|_| {
            make_err!(
                Code::Internal,
                "Failed to write to stream, receiver disconnected"
            )
        });
        if result.is_err() {
            // Close our channel to prevent drop() from reporting a second error.
            self.tx = None;
        }
        self.bytes_written += buf_len;
        result
    }

    /// Closes the stream, letting the receiver know all data arrived.
    pub fn send_eof(&mut self) -> Result<(), Error> {
        if self.tx.take().is_none() {
            return Err(make_err!(
                Code::Internal,
                "Tried to send an EOF when pipe is broken"
            ));
        }
        Ok(())
    }

    /// Forwards every chunk of `reader` into this writer. Empty chunks are
    /// skipped rather than sent, since an empty send means EOF.
    pub async fn forward<S>(&mut self, mut reader: S, forward_eof: bool) -> Result<(), Error>
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin,
    {
        while let Some(maybe_chunk) = reader.next().await {
            let chunk = maybe_chunk.err_tip(|| "Failed to forward message")?;
            if chunk.is_empty() {
                continue;
            }
            self.send(chunk).await?;
        }
        if forward_eof {
            self.send_eof()?;
        }
        Ok(())
    }

    /// Number of bytes written so far. This does not mean the receiver
    /// consumed them all yet.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// True if the channel was closed, either by `send_eof()` or because
    /// the receiver went away.
    pub fn is_pipe_broken(&self) -> bool {
        self.tx.is_none()
    }
}

impl Drop for DropCloserWriteHalf {
    /// If the writer is dropped without sending an EOF the reader must see
    /// an error, otherwise it could treat a truncated stream as complete.
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let err = make_err!(Code::Internal, "Writer was dropped before EOF was sent");
            if let Err(mpsc::error::TrySendError::Full(pending)) = tx.try_send(Err(err)) {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        // Nowhere to report a failure to write here.
                        let _ = tx.send(pending).await;
                    });
                }
            }
        }
    }
}

/// Reader half of the pair.
pub struct DropCloserReadHalf {
    rx: mpsc::Receiver<Result<Bytes, Error>>,
    /// Remainder of a chunk that was only partially consumed by `take()`.
    partial: Option<Bytes>,
    bytes_received: u64,
}

impl DropCloserReadHalf {
    /// Receive a chunk of data. An empty `Bytes` means EOF.
    pub async fn recv(&mut self) -> Result<Bytes, Error> {
        if let Some(partial) = self.partial.take() {
            self.bytes_received += partial.len() as u64;
            return Ok(partial);
        }
        match self.rx.recv().await {
            Some(Ok(chunk)) => {
                self.bytes_received += chunk.len() as u64;
                Ok(chunk)
            }
            Some(Err(e)) => Err(e),
            // Channel closed after a clean send_eof().
            None => Ok(Bytes::new()),
        }
    }

    /// Number of bytes received so far, not counting a partial chunk that
    /// was pushed back by `take()`.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Takes up to `size` bytes from the stream. Returns fewer bytes only
    /// if EOF is reached first. Any surplus from the final chunk stays
    /// buffered and is yielded by the next read, so the overall byte
    /// sequence is preserved exactly.
    pub async fn take(&mut self, size: usize) -> Result<Bytes, Error> {
        let first_chunk = {
            let mut chunk = self.recv().await.err_tip(|| "During first take() read")?;
            if chunk.len() > size {
                self.push_back(chunk.split_off(size));
            }
            if chunk.is_empty() || chunk.len() == size {
                return Ok(chunk);
            }
            chunk
        };

        let mut output = BytesMut::with_capacity(size);
        output.put(first_chunk);
        loop {
            let mut chunk = self.recv().await.err_tip(|| "During take() read")?;
            if chunk.is_empty() {
                break; // EOF.
            }
            let wanted = size - output.len();
            if chunk.len() > wanted {
                self.push_back(chunk.split_off(wanted));
            }
            output.put(chunk);
            if output.len() >= size {
                break;
            }
        }
        Ok(output.freeze())
    }

    /// Collects the whole stream into one buffer.
    pub async fn collect_all_with_size_hint(mut self, size_hint: usize) -> Result<Bytes, Error> {
        let (first_chunk, second_chunk) = {
            // When the stream holds a single chunk we can hand the original
            // Bytes through without a copy.
            let first_chunk = self
                .recv()
                .await
                .err_tip(|| "Failed to recv first chunk in collect_all_with_size_hint")?;
            if first_chunk.is_empty() {
                return Ok(first_chunk);
            }
            let second_chunk = self
                .recv()
                .await
                .err_tip(|| "Failed to recv second chunk in collect_all_with_size_hint")?;
            if second_chunk.is_empty() {
                return Ok(first_chunk);
            }
            (first_chunk, second_chunk)
        };

        let mut buf = BytesMut::with_capacity(size_hint);
        buf.put(first_chunk);
        buf.put(second_chunk);
        loop {
            let chunk = self
                .recv()
                .await
                .err_tip(|| "Failed to recv in collect_all_with_size_hint")?;
            if chunk.is_empty() {
                break; // EOF.
            }
            buf.put(chunk);
        }
        Ok(buf.freeze())
    }

    fn push_back(&mut self, chunk: Bytes) {
        debug_assert!(
            self.partial.is_none(),
            "Partial should have been consumed by recv()"
        );
        if !chunk.is_empty() {
            self.bytes_received -= chunk.len() as u64;
            self.partial = Some(chunk);
        }
    }
}

impl Stream for DropCloserReadHalf {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(partial) = self.partial.take() {
            self.bytes_received += partial.len() as u64;
            return Poll::Ready(Some(Ok(partial)));
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_received += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.to_std_err()))),
            Poll::Ready(None) => Poll::Ready(None),
        }
    }
}
