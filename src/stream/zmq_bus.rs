// ZeroMQ transport for the stream client.
//
// The pure-Rust `zeromq` sockets are async; a private single-worker tokio
// runtime drives them so callers see a plain blocking poll with a timeout.
use super::bus::{Inbound, MessageBus};
use crate::error::StreamError;

use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage, ZmqResult};

pub struct ZmqBus {
    data_endpoint: String,
    control_endpoint: String,
    socket_timeout: Duration,
    runtime: Runtime,
    data: Option<SubSocket>,
    control: Option<ReqSocket>,
    request_pending: bool,
}

impl ZmqBus {
    pub fn new(
        data_endpoint: &str,
        control_endpoint: &str,
        socket_timeout: Duration,
    ) -> Result<Self, StreamError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|e| StreamError::Transport(format!("failed to start runtime: {}", e)))?;

        Ok(Self {
            data_endpoint: data_endpoint.to_string(),
            control_endpoint: control_endpoint.to_string(),
            socket_timeout,
            runtime,
            data: None,
            control: None,
            request_pending: false,
        })
    }

    fn open_control(&self) -> Result<ReqSocket, StreamError> {
        let endpoint = self.control_endpoint.clone();
        let timeout = self.socket_timeout;
        self.runtime.block_on(async move {
            let mut socket = ReqSocket::new();
            let connected = tokio::time::timeout(timeout, socket.connect(&endpoint)).await;
            match connected {
                Ok(Ok(())) => Ok(socket),
                Ok(Err(e)) => Err(StreamError::Transport(format!(
                    "ZMQ REQ connect error on {}: {}",
                    endpoint, e
                ))),
                Err(_) => Err(StreamError::Transport(format!(
                    "ZMQ REQ connect to {} timed out",
                    endpoint
                ))),
            }
        })
    }

    fn open_data(&self) -> Result<SubSocket, StreamError> {
        let endpoint = self.data_endpoint.clone();
        let timeout = self.socket_timeout;
        self.runtime.block_on(async move {
            let mut socket = SubSocket::new();
            let subscribe = async {
                socket.connect(&endpoint).await?;
                socket.subscribe("").await
            };
            let connected = tokio::time::timeout(timeout, subscribe).await;
            match connected {
                Ok(Ok(())) => Ok(socket),
                Ok(Err(e)) => Err(StreamError::Transport(format!(
                    "ZMQ SUB connect error on {}: {}",
                    endpoint, e
                ))),
                Err(_) => Err(StreamError::Transport(format!(
                    "ZMQ SUB connect to {} timed out",
                    endpoint
                ))),
            }
        })
    }
}

async fn recv_reply(control: Option<&mut ReqSocket>) -> ZmqResult<ZmqMessage> {
    match control {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

impl MessageBus for ZmqBus {
    fn connect(&mut self) -> Result<(), StreamError> {
        log::info!(
            "Connecting to {} (data) and {} (control)",
            self.data_endpoint,
            self.control_endpoint
        );
        let data = self.open_data()?;
        let control = self.open_control()?;
        self.data = Some(data);
        self.control = Some(control);
        self.request_pending = false;
        log::info!("ZMQ sockets connected");
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Inbound>, StreamError> {
        let Self {
            runtime,
            data,
            control,
            request_pending,
            ..
        } = self;
        let data = data
            .as_mut()
            .ok_or_else(|| StreamError::Transport("data channel not connected".into()))?;
        let control = if *request_pending { control.as_mut() } else { None };

        runtime.block_on(async {
            tokio::select! {
                biased;
                message = data.recv() => message
                    .map(|m| Some(Inbound::Data(m.into_vec())))
                    .map_err(|e| StreamError::Transport(format!("ZMQ receive error: {}", e))),
                reply = recv_reply(control) => {
                    *request_pending = false;
                    reply
                        .map(|m| Some(Inbound::Reply(m.into_vec())))
                        .map_err(|e| StreamError::Transport(format!("ZMQ reply error: {}", e)))
                }
                _ = tokio::time::sleep(timeout) => Ok(None),
            }
        })
    }

    fn send_request(&mut self, payload: Vec<u8>) -> Result<(), StreamError> {
        // REQ allows a single outstanding request; retries wait for the reply.
        if self.request_pending {
            log::debug!("Control request still pending, retry absorbed");
            return Ok(());
        }

        let timeout = self.socket_timeout;
        let Self {
            runtime, control, ..
        } = self;
        let socket = control
            .as_mut()
            .ok_or_else(|| StreamError::Transport("control channel not connected".into()))?;

        runtime.block_on(async {
            match tokio::time::timeout(timeout, socket.send(ZmqMessage::from(payload))).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(StreamError::Transport(format!("ZMQ send error: {}", e))),
                Err(_) => Err(StreamError::Transport("ZMQ send timed out".into())),
            }
        })?;
        self.request_pending = true;
        Ok(())
    }

    fn reset_control(&mut self) -> Result<(), StreamError> {
        if let Some(old) = self.control.take() {
            self.runtime.block_on(async move {
                let _ = old.close().await;
            });
        }
        self.request_pending = false;
        self.control = Some(self.open_control()?);
        log::info!("Control socket recreated on {}", self.control_endpoint);
        Ok(())
    }

    fn close(&mut self) {
        let data = self.data.take();
        let control = self.control.take();
        self.runtime.block_on(async move {
            if let Some(socket) = data {
                let _ = socket.close().await;
            }
            if let Some(socket) = control {
                let _ = socket.close().await;
            }
        });
        self.request_pending = false;
        log::info!("ZMQ sockets closed");
    }
}
