//! Remote forward: a listener on a relay endpoint whose sessions are delivered to a local target.

use std::sync::Arc;

use metrics::gauge;
use tokio::{io::AsyncWriteExt, select, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

use super::{BridgeContext, BridgeShared, BridgeStatus};
use crate::{
    error::{classify_io_error, ConfigError, EngineError, Severity, TransportError},
    local_endpoint::LocalTarget,
    metrics::METRICS_BRIDGE_LIVE,
    rule::{RelayEndpoint, RemoteForward},
    transport::{RelayListener, RelayListenerEvent, RelayTransport},
};

pub(super) async fn open<T: RelayTransport>(
    rule: &RemoteForward,
    endpoint: RelayEndpoint,
    shared: Arc<BridgeShared>,
    cancel: CancellationToken,
    ctx: &BridgeContext<T>,
) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
    let target = rule
        .target()
        .ok_or_else(|| ConfigError::invalid(&rule.relay_name, "Host", "or LocalSocket must select exactly one target"))?;

    let listener = match timeout(ctx.config.connect_timeout, ctx.transport.listen(&endpoint)).await {
        Ok(listener) => listener?,
        Err(_) => return Err(TransportError::Timeout.into()),
    };
    shared.set_local_addr(target.to_string());
    shared.publish(BridgeStatus::Online, Some(format!("listening on {} for {target}", endpoint.uri)));

    let ctx = ctx.clone();
    Ok(tokio::spawn(async move {
        gauge!(METRICS_BRIDGE_LIVE, "direction" => shared.direction()).increment(1.0);
        let res = run_accept_loop(listener, Arc::new(target), shared.clone(), cancel, ctx).await;
        gauge!(METRICS_BRIDGE_LIVE, "direction" => shared.direction()).decrement(1.0);
        res
    }))
}

async fn run_accept_loop<T: RelayTransport>(mut listener: T::Listener, target: Arc<LocalTarget>, shared: Arc<BridgeShared>, cancel: CancellationToken, ctx: BridgeContext<T>) -> Result<(), EngineError> {
    let res = loop {
        let event = select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            event = listener.accept() => event,
        };

        match event {
            Ok(RelayListenerEvent::Incoming(stream)) => {
                tokio::spawn(handle_session(stream, target.clone(), shared.clone(), ctx.clone()));
            }
            Ok(RelayListenerEvent::Online) => shared.publish(BridgeStatus::Online, None),
            Ok(RelayListenerEvent::Offline(reason)) => shared.publish(BridgeStatus::Offline, Some(reason)),
            Ok(RelayListenerEvent::End) => {
                log::info!("[RemoteBridge {}] relay listener ended", shared.key);
                shared.publish(BridgeStatus::Closed, Some("relay listener ended".to_string()));
                break Ok(());
            }
            Err(e) if e.severity() == Severity::Fatal => {
                shared.publish(BridgeStatus::Faulted, Some(e.to_string()));
                break Err(e.into());
            }
            Err(e) => {
                log::warn!("[RemoteBridge {}] accept error {e}", shared.key);
                select! {
                    _ = cancel.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(ctx.config.accept_retry_delay) => {}
                }
            }
        }
    };

    listener.close().await;
    log::info!("[RemoteBridge {}] stop listening", shared.key);
    res
}

async fn handle_session<T: RelayTransport>(mut stream: T::Stream, target: Arc<LocalTarget>, shared: Arc<BridgeShared>, ctx: BridgeContext<T>) {
    let peer = target.to_string();
    let local = match timeout(ctx.config.connect_timeout, target.connect(ctx.config.tcp_nodelay)).await {
        Ok(Ok(local)) => local,
        Ok(Err(e)) => {
            let error = match classify_io_error(&e) {
                Severity::Fatal => EngineError::Fatal(format!("connect {peer} failed: {e}")),
                Severity::Recoverable => TransportError::Unreachable(format!("{peer}: {e}")).into(),
            };
            return reject(&mut stream, &peer, error, &shared, &ctx).await;
        }
        Err(_) => return reject(&mut stream, &peer, TransportError::Timeout.into(), &shared, &ctx).await,
    };
    shared.run_session(peer, local, stream, &ctx.config, &ctx.shutdown).await;
}

async fn reject<T: RelayTransport>(stream: &mut T::Stream, peer: &str, error: EngineError, shared: &BridgeShared, ctx: &BridgeContext<T>) {
    shared.connect_failed(peer, error);
    if timeout(ctx.config.session_grace, stream.shutdown()).await.is_err() {
        log::debug!("[RemoteBridge {}] close of rejected relay session timed out", shared.key);
    }
}
