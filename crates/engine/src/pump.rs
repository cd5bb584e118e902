use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
};
use tokio_util::sync::CancellationToken;

use crate::error::{PumpError, PumpSide};

pub const DEFAULT_BUFFER_SIZE: usize = 65536;

/// Terminal state of one pump direction. `bytes` counts what was written to the destination.
#[derive(Debug)]
pub enum PumpOutcome {
    Completed { bytes: u64 },
    Failed { bytes: u64, error: PumpError },
    Cancelled { bytes: u64 },
}

impl PumpOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            PumpOutcome::Completed { bytes } | PumpOutcome::Failed { bytes, .. } | PumpOutcome::Cancelled { bytes } => *bytes,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PumpOutcome::Completed { .. })
    }

    pub fn error(&self) -> Option<&PumpError> {
        match self {
            PumpOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Copies `source` into `destination` until end of stream, an I/O error on either side, or
/// `cancel` fires. On end of stream the destination is flushed and shut down so the peer sees it.
pub async fn pump<R, W>(source: &mut R, destination: &mut W, buffer_size: usize, cancel: &CancellationToken) -> PumpOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut bytes = 0u64;
    loop {
        let len = select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Cancelled { bytes },
            res = source.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(len) => len,
                Err(source) => {
                    return PumpOutcome::Failed {
                        bytes,
                        error: PumpError { side: PumpSide::Source, source },
                    }
                }
            },
        };

        let written = async {
            destination.write_all(&buf[..len]).await?;
            destination.flush().await
        };
        select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Cancelled { bytes },
            res = written => {
                if let Err(source) = res {
                    return PumpOutcome::Failed {
                        bytes,
                        error: PumpError { side: PumpSide::Destination, source },
                    };
                }
            }
        }
        bytes += len as u64;
    }

    select! {
        biased;
        _ = cancel.cancelled() => PumpOutcome::Cancelled { bytes },
        res = destination.shutdown() => match res {
            Ok(()) => PumpOutcome::Completed { bytes },
            Err(source) => PumpOutcome::Failed {
                bytes,
                error: PumpError { side: PumpSide::Destination, source },
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::io::{duplex, ReadBuf};

    use super::*;

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn copies_in_order_and_propagates_eof() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut source: &[u8] = &payload;
        let (mut writer, mut reader) = duplex(1024);

        let expected = payload.clone();
        let collector = tokio::spawn(async move {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.expect("should read");
            received
        });

        let outcome = pump(&mut source, &mut writer, 4096, &CancellationToken::new()).await;
        assert!(outcome.is_completed());
        assert_eq!(outcome.bytes(), expected.len() as u64);
        assert_eq!(collector.await.expect("collector"), expected);
    }

    #[tokio::test]
    async fn cancellation_stops_idle_pump() {
        let (_keep_open, mut source) = duplex(64);
        let mut sink = tokio::io::sink();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(2), pump(&mut source, &mut sink, 64, &cancel)).await.expect("should be cancelled in time");
        assert!(matches!(outcome, PumpOutcome::Cancelled { bytes: 0 }));
    }

    #[tokio::test]
    async fn reports_failing_side() {
        let mut sink = tokio::io::sink();
        let outcome = pump(&mut FailingReader, &mut sink, 64, &CancellationToken::new()).await;
        assert_eq!(outcome.error().map(|e| e.side), Some(PumpSide::Source));

        let mut source: &[u8] = b"data";
        let outcome = pump(&mut source, &mut FailingWriter, 64, &CancellationToken::new()).await;
        assert_eq!(outcome.error().map(|e| e.side), Some(PumpSide::Destination));
    }
}
