// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! A WebSocket listener that reports each connection's lifecycle to a [`SocketEvents`] handler.
//!
//! Connections are identified by the raw descriptor of their TCP socket, captured at accept time.
//! The descriptor stays open until after [`SocketEvents::on_close`] has returned, so a handler
//! never sees the same number reused for a new connection before it has finished with the old one.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, trace, warn};
use wsrelay_common::Fd;

/// Frames queued for delivery to one connection.
pub type Outbound = mpsc::Sender<Message>;

/// Frames a connection may have waiting for its writer. Pushes beyond this are dropped.
pub const OUTBOUND_CAPACITY: usize = 64;

/// What a handler knows about the connection an event belongs to.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub fd: Fd,
    pub peer_addr: SocketAddr,
    pub listener: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    Accept,
    /// Close the connection with a policy-violation close frame carrying this reason.
    Reject(String),
}

/// Typed callbacks for one listener. Each is short and must not block on the network.
pub trait SocketEvents: Send + Sync + 'static {
    /// Checked before any handshake; a refused peer's socket is dropped immediately.
    fn accepts_peer(&self, _peer_addr: SocketAddr) -> bool {
        true
    }

    fn on_connect(&self, conn: &ConnectionContext) {
        debug!(listener = conn.listener, fd = conn.fd, peer = %conn.peer_addr, "Connection attempt");
    }

    /// Called once the WebSocket upgrade completed, with the request path. `outbound` feeds
    /// frames to this connection for as long as it stays open.
    fn on_open(&self, conn: &ConnectionContext, path: &str, outbound: Outbound) -> OpenDecision;

    fn on_message(&self, conn: &ConnectionContext, message: Message);

    /// Called only for connections that were accepted by `on_open`.
    fn on_close(&self, conn: &ConnectionContext);
}

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("TLS handshake failed: {0}")]
    Tls(io::Error),
    #[error("WebSocket upgrade failed: {0}")]
    Upgrade(#[from] tungstenite::Error),
    #[error("Handshake timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Listener shutting down")]
    ShuttingDown,
}

/// A connection's transport, plain for the internal listener and TLS for the external one.
pub enum RelayStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_flush(cx),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListenerTimeouts {
    /// Bound on TLS plus WebSocket upgrade for one connection.
    pub handshake: Duration,
    /// How long open connections get to finish once shutdown starts.
    pub drain: Duration,
}

pub struct Listener<H: SocketEvents> {
    name: &'static str,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handler: Arc<H>,
    timeouts: ListenerTimeouts,
}

impl<H: SocketEvents> Listener<H> {
    pub async fn bind(
        name: &'static str,
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        handler: Arc<H>,
        timeouts: ListenerTimeouts,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            name,
            listener,
            tls,
            handler,
            timeouts,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` flips, then give open connections the drain timeout
    /// to close before aborting them.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let addr = self.listener.local_addr().ok();
        info!(listener = self.name, ?addr, tls = self.tls.is_some(), "Listening");
        let mut connections = JoinSet::new();
        loop {
            select! {
                _ = stopping(&mut shutdown) => {
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(listener = self.name, error = %e, "Accept failed");
                            continue;
                        }
                    };
                    if !self.handler.accepts_peer(peer_addr) {
                        warn!(listener = self.name, peer = %peer_addr, "Refusing connection from disallowed peer");
                        continue;
                    }
                    connections.spawn(handle_connection(
                        self.name,
                        stream,
                        peer_addr,
                        self.tls.clone(),
                        self.handler.clone(),
                        self.timeouts.handshake,
                        shutdown.clone(),
                    ));
                }
                Some(finished) = connections.join_next() => {
                    if let Err(e) = finished
                        && e.is_panic()
                    {
                        warn!(listener = self.name, error = %e, "Connection task panicked");
                    }
                }
            }
        }

        drop(self.listener);
        let open = connections.len();
        info!(listener = self.name, open, "Stopped accepting; draining connections");
        let drained = tokio::time::timeout(self.timeouts.drain, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                listener = self.name,
                remaining = connections.len(),
                "Drain timed out; aborting remaining connections"
            );
            connections.shutdown().await;
        }
        info!(listener = self.name, "Done listening");
    }
}

/// Resolves once shutdown has been requested, or the sender is gone.
async fn stopping(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        trace!("Shutdown sender dropped");
    }
}

async fn upgrade(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
) -> Result<(tokio_tungstenite::WebSocketStream<RelayStream>, String), HandshakeError> {
    let stream = match tls {
        Some(acceptor) => RelayStream::Tls(Box::new(
            acceptor.accept(stream).await.map_err(HandshakeError::Tls)?,
        )),
        None => RelayStream::Plain(stream),
    };
    let mut path = String::new();
    let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;
    Ok((ws, path))
}

async fn handle_connection<H: SocketEvents>(
    name: &'static str,
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    handler: Arc<H>,
    handshake_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn = ConnectionContext {
        fd: stream.as_raw_fd(),
        peer_addr,
        listener: name,
    };
    handler.on_connect(&conn);

    let upgraded = select! {
        result = tokio::time::timeout(handshake_timeout, upgrade(stream, tls)) => match result {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::TimedOut(handshake_timeout)),
        },
        _ = stopping(&mut shutdown) => Err(HandshakeError::ShuttingDown),
    };
    let (mut ws, path) = match upgraded {
        Ok(upgraded) => upgraded,
        Err(e) => {
            debug!(listener = name, fd = conn.fd, peer = %peer_addr, error = %e, "Handshake abandoned");
            return;
        }
    };

    let (outbound, mut queued) = mpsc::channel(OUTBOUND_CAPACITY);
    if let OpenDecision::Reject(reason) = handler.on_open(&conn, &path, outbound) {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: reason.into(),
        };
        if let Err(e) = ws.close(Some(frame)).await {
            trace!(listener = name, fd = conn.fd, error = %e, "Close after rejection failed");
        }
        return;
    }

    let (mut sink, mut source) = ws.split();
    loop {
        select! {
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Close(frame))) => {
                        debug!(listener = name, fd = conn.fd, ?frame, "Peer closed");
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(message)) => handler.on_message(&conn, message),
                    Some(Err(e)) => {
                        debug!(listener = name, fd = conn.fd, error = %e, "Read failed");
                        break;
                    }
                    None => break,
                }
            }
            Some(message) = queued.recv() => {
                if let Err(e) = sink.send(message).await {
                    debug!(listener = name, fd = conn.fd, error = %e, "Write failed");
                    break;
                }
            }
            _ = stopping(&mut shutdown) => {
                let frame = CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    trace!(listener = name, fd = conn.fd, error = %e, "Close on shutdown failed");
                }
                break;
            }
        }
    }

    handler.on_close(&conn);
    drop((sink, source));
}
