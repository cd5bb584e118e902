//! A session pairs a local stream with a relay stream and pumps both directions until one side
//! is done, then closes both within a bounded grace period.

use std::{future::Future, time::Duration};

use derive_more::derive::{Deref, Display, From};
use tokio::{
    io::{split, AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::PumpError,
    pump::{pump, PumpOutcome},
};

#[derive(Debug, Hash, Display, PartialEq, Eq, From, Deref, Clone, Copy)]
#[display("{_0:016x}")]
pub struct SessionId(u64);

impl SessionId {
    pub fn rand() -> Self {
        Self(rand::random())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub buffer_size: usize,
    pub grace: Duration,
}

#[derive(Debug)]
pub struct SessionOutcome {
    /// local -> relay
    pub upstream: PumpOutcome,
    /// relay -> local
    pub downstream: PumpOutcome,
}

impl SessionOutcome {
    pub fn error(&self) -> Option<&PumpError> {
        self.upstream.error().or(self.downstream.error())
    }

    pub fn bytes_sent(&self) -> u64 {
        self.upstream.bytes()
    }

    pub fn bytes_received(&self) -> u64 {
        self.downstream.bytes()
    }
}

enum FirstDone {
    Upstream(PumpOutcome),
    Downstream(PumpOutcome),
}

/// Runs one proxied connection to completion.
///
/// The first pump to stop decides: an error or cancellation cancels the opposite direction at
/// once, a clean end of stream leaves it `grace` to drain before it is cancelled. Cancelling
/// `shutdown` cancels both directions.
pub async fn run_session<L, R>(id: SessionId, local: L, relay: R, cfg: &SessionConfig, shutdown: &CancellationToken) -> SessionOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = split(local);
    let (mut relay_read, mut relay_write) = split(relay);
    let cancel = shutdown.child_token();

    let (upstream, downstream) = {
        let up = pump(&mut local_read, &mut relay_write, cfg.buffer_size, &cancel);
        let down = pump(&mut relay_read, &mut local_write, cfg.buffer_size, &cancel);
        tokio::pin!(up, down);

        let first = select! {
            outcome = &mut up => FirstDone::Upstream(outcome),
            outcome = &mut down => FirstDone::Downstream(outcome),
        };
        match first {
            FirstDone::Upstream(outcome) => {
                log::debug!("[Session {id}] upstream finished first {outcome:?}");
                let other = finish_other(&mut down, &outcome, &cancel, cfg.grace).await;
                (outcome, other)
            }
            FirstDone::Downstream(outcome) => {
                log::debug!("[Session {id}] downstream finished first {outcome:?}");
                let other = finish_other(&mut up, &outcome, &cancel, cfg.grace).await;
                (other, outcome)
            }
        }
    };

    let close = async {
        if let Err(e) = local_write.shutdown().await {
            log::debug!("[Session {id}] close local stream error {e}");
        }
        if let Err(e) = relay_write.shutdown().await {
            log::debug!("[Session {id}] close relay stream error {e}");
        }
    };
    if timeout(cfg.grace, close).await.is_err() {
        log::warn!("[Session {id}] close handshake did not finish in {:?}, abandon", cfg.grace);
    }

    SessionOutcome { upstream, downstream }
}

async fn finish_other<F>(other: &mut F, first: &PumpOutcome, cancel: &CancellationToken, grace: Duration) -> PumpOutcome
where
    F: Future<Output = PumpOutcome> + Unpin,
{
    if !first.is_completed() {
        cancel.cancel();
    }
    match timeout(grace, &mut *other).await {
        Ok(outcome) => outcome,
        Err(_) => {
            log::debug!("[Session] opposite direction still busy after {grace:?}, cancel");
            cancel.cancel();
            other.await
        }
    }
}
