//! Progress rendering
//!
//! One bar per pipeline stage, measured in KiB so multi-terabyte
//! volumes do not overflow the display math. Multiple byte streams can
//! feed the same bar through independent counters; an upload counter
//! raises the total when actual bytes pass the estimate, so the shown
//! percentage never exceeds 100.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// A progress bar over a known (or estimated) byte total
#[derive(Debug, Clone)]
pub struct Progress {
    bar: ProgressBar,
}

impl Progress {
    /// Bar for `total_bytes` of work, labeled with `message`
    pub fn bytes(total_bytes: u64, message: impl Into<String>) -> Self {
        let bar = ProgressBar::new(total_bytes / 1024);
        bar.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} KiB ({eta}) {msg}",
            )
            .expect("static template parses")
            .progress_chars("#>-"),
        );
        bar.set_message(message.into());
        Self { bar }
    }

    /// A counter feeding this bar. `raise_total` lets the counter grow
    /// the total once actual bytes overtake the estimate.
    pub fn counter(&self, raise_total: bool) -> ByteCounter {
        ByteCounter {
            bar: self.bar.clone(),
            raise_total,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Finish and clear the bar
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Byte accumulator feeding a [`Progress`] bar in whole KiB
#[derive(Debug, Clone)]
pub struct ByteCounter {
    bar: ProgressBar,
    raise_total: bool,
    count: Arc<AtomicU64>,
}

impl ByteCounter {
    /// Record `n` more bytes
    pub fn add(&self, n: u64) {
        if n == 0 {
            return;
        }
        let before = self.count.fetch_add(n, Ordering::Relaxed);
        let ticks = (before + n) / 1024 - before / 1024;
        if ticks > 0 {
            self.bar.inc(ticks);
            if self.raise_total {
                let position = self.bar.position();
                if position > self.bar.length().unwrap_or(0) {
                    self.bar.set_length(position);
                }
            }
        }
    }

    /// Total bytes recorded so far
    pub fn total(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// AsyncRead adapter that reports every byte to a counter
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    counter: ByteCounter,
}

impl<R> CountingReader<R> {
    /// Count bytes read through `inner`
    pub fn new(inner: R, counter: ByteCounter) -> Self {
        Self { inner, counter }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            self.counter.add((buf.filled().len() - before) as u64);
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_counter_ticks_in_kib() {
        let progress = Progress::bytes(10 * 1024, "test");
        let counter = progress.counter(false);
        counter.add(512);
        counter.add(512);
        counter.add(1024);
        assert_eq!(counter.total(), 2048);
        assert_eq!(progress.bar.position(), 2);
    }

    #[test]
    fn test_counter_raises_total_past_estimate() {
        let progress = Progress::bytes(1024, "test");
        let counter = progress.counter(true);
        counter.add(4096);
        // Estimate was 1 KiB, actual 4 KiB: total follows position
        assert_eq!(progress.bar.position(), 4);
        assert_eq!(progress.bar.length(), Some(4));
    }

    #[test]
    fn test_counter_without_raise_keeps_total() {
        let progress = Progress::bytes(1024, "test");
        let counter = progress.counter(false);
        counter.add(4096);
        assert_eq!(progress.bar.length(), Some(1));
    }

    #[test]
    fn test_two_counters_sum_on_one_bar() {
        let progress = Progress::bytes(8 * 1024, "test");
        let local = progress.counter(false);
        let remote = progress.counter(false);
        local.add(2048);
        remote.add(3072);
        assert_eq!(progress.bar.position(), 5);
        assert_eq!(local.total(), 2048);
        assert_eq!(remote.total(), 3072);
    }

    #[tokio::test]
    async fn test_counting_reader_counts_everything() {
        let progress = Progress::bytes(0, "test");
        let counter = progress.counter(true);
        let data = vec![1u8; 5000];
        let mut reader = CountingReader::new(std::io::Cursor::new(data), counter.clone());
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink.len(), 5000);
        assert_eq!(counter.total(), 5000);
    }
}
