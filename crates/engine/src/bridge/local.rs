//! Local forward: a local TCP or socket listener whose connections are carried to a relay endpoint.

use std::sync::Arc;

use metrics::gauge;
use tokio::{io::AsyncWriteExt, select, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

use super::{BridgeContext, BridgeShared, BridgeStatus};
use crate::{
    error::{classify_io_error, EngineError, Severity, TransportError},
    local_endpoint::{LocalBinding, LocalListener, LocalStream},
    metrics::METRICS_BRIDGE_LIVE,
    resolver::{local_addresses, resolve_bind_address},
    rule::{LocalForward, RelayEndpoint},
    transport::RelayTransport,
};

pub(super) async fn open<T: RelayTransport>(
    rule: &LocalForward,
    endpoint: RelayEndpoint,
    shared: Arc<BridgeShared>,
    cancel: CancellationToken,
    ctx: &BridgeContext<T>,
) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
    let binding = match rule.binding() {
        Ok(binding) => binding,
        Err((host, port)) => {
            let ip = resolve_bind_address(&host, &local_addresses()).await?;
            log::info!("[LocalBridge {}] bind address {host} resolved to {ip}", shared.key);
            LocalBinding::Tcp((ip, port).into())
        }
    };

    let listener = LocalListener::bind(&binding).await?;
    let local_addr = listener.local_addr();
    shared.set_local_addr(local_addr.clone());
    shared.publish(BridgeStatus::Online, Some(format!("listening on {local_addr}")));

    let display_host = rule.display_host().to_string();
    let ctx = ctx.clone();
    Ok(tokio::spawn(async move {
        gauge!(METRICS_BRIDGE_LIVE, "direction" => shared.direction()).increment(1.0);
        let res = run_accept_loop(listener, endpoint, display_host, shared.clone(), cancel, ctx).await;
        gauge!(METRICS_BRIDGE_LIVE, "direction" => shared.direction()).decrement(1.0);
        res
    }))
}

async fn run_accept_loop<T: RelayTransport>(
    listener: LocalListener,
    endpoint: RelayEndpoint,
    display_host: String,
    shared: Arc<BridgeShared>,
    cancel: CancellationToken,
    ctx: BridgeContext<T>,
) -> Result<(), EngineError> {
    let endpoint = Arc::new(endpoint);
    loop {
        let accepted = select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept(ctx.config.tcp_nodelay) => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                log::debug!("[LocalBridge {}] accepted {peer} for {display_host}", shared.key);
                tokio::spawn(handle_connection(stream, peer, endpoint.clone(), shared.clone(), ctx.clone()));
            }
            Err(e) => {
                if classify_io_error(&e) == Severity::Fatal {
                    let error = EngineError::Fatal(format!("accept on {} failed: {e}", listener.local_addr()));
                    shared.publish(BridgeStatus::Faulted, Some(error.to_string()));
                    return Err(error);
                }
                log::warn!("[LocalBridge {}] accept error {e}", shared.key);
                select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ctx.config.accept_retry_delay) => {}
                }
            }
        }
    }

    log::info!("[LocalBridge {}] stop accepting on {}", shared.key, listener.local_addr());
    Ok(())
}

async fn handle_connection<T: RelayTransport>(mut stream: LocalStream, peer: String, endpoint: Arc<RelayEndpoint>, shared: Arc<BridgeShared>, ctx: BridgeContext<T>) {
    let relay = match timeout(ctx.config.connect_timeout, ctx.transport.connect(&endpoint)).await {
        Ok(Ok(relay)) => relay,
        Ok(Err(e)) => return reject(&mut stream, &peer, e, &shared, &ctx).await,
        Err(_) => return reject(&mut stream, &peer, TransportError::Timeout, &shared, &ctx).await,
    };
    shared.run_session(peer, stream, relay, &ctx.config, &ctx.shutdown).await;
}

async fn reject<T>(stream: &mut LocalStream, peer: &str, error: TransportError, shared: &BridgeShared, ctx: &BridgeContext<T>) {
    shared.connect_failed(peer, error.into());
    if timeout(ctx.config.session_grace, stream.shutdown()).await.is_err() {
        log::debug!("[LocalBridge {}] close of rejected {peer} timed out", shared.key);
    }
}
