//! The relay a worker runs: messaging gateway on one side, CRM on the other.
//!
//! The worker only cares that a relay can be prepared for a connection and
//! then run until cancelled. [`GatewayRelay`] is the production relay; it holds
//! the gateway WebSocket open and reconnects until told to stop.
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpStream, time::sleep};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::connection::Connection;

pub const GATEWAY_WS_PATH: &str = "/api/bot/v1/ws";
pub const GATEWAY_EVENTS: &str = "message_new,message_updated,message_deleted";
pub const BOT_TOKEN_HEADER: &str = "X-Bot-Token";

/// A long-running relay bound to a single tenant.
#[async_trait]
pub trait Relay: Send {
    /// Run until `cancel` fires. Must observe the token promptly.
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()>;
}

/// Builds relays for workers.
#[async_trait]
pub trait RelayFactory: Send + Sync {
    /// Validate the connection and build its relay. An error here is a failed
    /// worker start.
    async fn prepare(&self, connection: &Connection) -> Result<Box<dyn Relay>>;
}

#[derive(Debug, Clone)]
pub struct GatewayRelayFactory {
    reconnect_delay: Duration,
}

impl GatewayRelayFactory {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self { reconnect_delay }
    }
}

#[async_trait]
impl RelayFactory for GatewayRelayFactory {
    async fn prepare(&self, connection: &Connection) -> Result<Box<dyn Relay>> {
        if connection.gate_token.is_empty() {
            bail!("no gateway token configured for `{}`", connection.client_id);
        }
        let endpoint = gateway_endpoint(&connection.gate_url)
            .with_context(|| format!("bad gateway url for `{}`", connection.client_id))?;
        let token = HeaderValue::from_str(&connection.gate_token).context("gateway token is not a valid header")?;

        Ok(Box::new(GatewayRelay {
            client_id: connection.client_id.clone(),
            endpoint,
            token,
            reconnect_delay: self.reconnect_delay,
        }))
    }
}

/// `https://mg.example.com` -> `wss://mg.example.com/api/bot/v1/ws?events=...`
pub fn gateway_endpoint(gate_url: &str) -> Result<Url> {
    let mut url = Url::parse(gate_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("unsupported scheme `{other}`"),
    };
    if url.host_str().is_none() {
        bail!("no host in `{gate_url}`");
    }
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot switch `{gate_url}` to {scheme}"))?;
    url.set_path(GATEWAY_WS_PATH);
    url.set_query(Some(&format!("events={GATEWAY_EVENTS}")));
    Ok(url)
}

type GatewayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct GatewayRelay {
    client_id: String,
    endpoint: Url,
    token: HeaderValue,
    reconnect_delay: Duration,
}

impl GatewayRelay {
    async fn connect(&self) -> Result<GatewayStream> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        request.headers_mut().insert(BOT_TOKEN_HEADER, self.token.clone());
        let (stream, response) = connect_async(request).await?;
        debug!(client_id = %self.client_id, status = %response.status(), "Gateway handshake done");
        Ok(stream)
    }

    /// Pump one session. Returns `true` when cancelled, `false` when the
    /// gateway went away and a reconnect is due.
    async fn pump(&self, stream: GatewayStream, cancel: &CancellationToken) -> bool {
        let (mut write, mut read) = stream.split();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return true;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_event(text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = write.send(Message::Pong(payload)).await {
                            warn!(client_id = %self.client_id, "Pong failed: {err}");
                            return false;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(client_id = %self.client_id, ?frame, "Gateway closed the session");
                        return false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(client_id = %self.client_id, "Gateway read error: {err}");
                        return false;
                    }
                    None => return false,
                }
            }
        }
    }

    fn handle_event(&self, raw: &str) {
        match serde_json::from_str::<Value>(raw) {
            Ok(event) => {
                let kind = event.get("type").and_then(Value::as_str).unwrap_or("unknown");
                debug!(client_id = %self.client_id, event = kind, "Gateway event");
                trace!(client_id = %self.client_id, payload = %event, "Gateway event payload");
            }
            Err(err) => warn!(client_id = %self.client_id, "Unparseable gateway frame: {err}"),
        }
    }
}

#[async_trait]
impl Relay for GatewayRelay {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()> {
        loop {
            let session = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                session = self.connect() => session,
            };
            match session {
                Ok(stream) => {
                    info!(client_id = %self.client_id, "Connected to gateway");
                    if self.pump(stream, &cancel).await {
                        return Ok(());
                    }
                }
                Err(err) => warn!(client_id = %self.client_id, "Gateway connect failed: {err:#}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(self.reconnect_delay) => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    /// Relays that sit idle until cancelled, counting how many are alive.
    #[derive(Debug, Default, Clone)]
    pub struct IdleRelayFactory {
        running: Arc<AtomicUsize>,
        prepared: Arc<AtomicUsize>,
    }

    impl IdleRelayFactory {
        pub fn running(&self) -> usize {
            self.running.load(Ordering::SeqCst)
        }

        pub fn prepared(&self) -> usize {
            self.prepared.load(Ordering::SeqCst)
        }
    }

    struct IdleRelay {
        running: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Relay for IdleRelay {
        async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl RelayFactory for IdleRelayFactory {
        async fn prepare(&self, _connection: &Connection) -> Result<Box<dyn Relay>> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            // counted here so it is visible as soon as start returns
            self.running.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(IdleRelay {
                running: self.running.clone(),
            }))
        }
    }

    pub struct FailingRelayFactory;

    #[async_trait]
    impl RelayFactory for FailingRelayFactory {
        async fn prepare(&self, connection: &Connection) -> Result<Box<dyn Relay>> {
            bail!("gateway for `{}` refused the connection", connection.client_id)
        }
    }

    /// Ignores cancellation for a long while.
    pub struct StubbornRelayFactory;

    struct StubbornRelay;

    #[async_trait]
    impl Relay for StubbornRelay {
        async fn run(self: Box<Self>, _cancel: CancellationToken) -> Result<()> {
            sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[async_trait]
    impl RelayFactory for StubbornRelayFactory {
        async fn prepare(&self, _connection: &Connection) -> Result<Box<dyn Relay>> {
            Ok(Box::new(StubbornRelay))
        }
    }

    /// Never finishes preparing.
    pub struct HangingRelayFactory;

    #[async_trait]
    impl RelayFactory for HangingRelayFactory {
        async fn prepare(&self, _connection: &Connection) -> Result<Box<dyn Relay>> {
            std::future::pending::<Result<Box<dyn Relay>>>().await
        }
    }

    /// Idle relays that take `delay` to prepare.
    #[derive(Debug, Default, Clone)]
    pub struct SlowRelayFactory {
        pub idle: IdleRelayFactory,
        pub delay: Duration,
    }

    #[async_trait]
    impl RelayFactory for SlowRelayFactory {
        async fn prepare(&self, connection: &Connection) -> Result<Box<dyn Relay>> {
            sleep(self.delay).await;
            self.idle.prepare(connection).await
        }
    }
}
