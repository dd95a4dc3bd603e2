//! Channel attachment
//!
//! Opens the five kernel channels described by a connection descriptor and
//! confirms the kernel behind them is actually serving requests. The
//! descriptor existing on disk only proves the kernel *started*; the probe
//! here proves its request loop is up.

use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::time::{timeout, Instant};
use tracing::debug;
use uuid::Uuid;
use zeromq::{DealerSocket, ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::error::{Result, SandboxError};
use crate::kernel::descriptor::{ConnectionDescriptor, SIGNATURE_SCHEME};
use crate::kernel::wire::WireMessage;

/// The attached channel set for one kernel.
pub struct KernelChannels {
    pub(crate) session_id: String,
    pub(crate) key: Vec<u8>,
    pub(crate) shell: DealerSocket,
    pub(crate) iopub: SubSocket,
    pub(crate) control: DealerSocket,
    pub(crate) stdin: DealerSocket,
    pub(crate) hb: ReqSocket,
}

impl KernelChannels {
    /// Connect every channel the descriptor describes. The descriptor must
    /// already be loopback-patched.
    pub async fn attach(descriptor: &ConnectionDescriptor) -> Result<Self> {
        if descriptor.signature_scheme != SIGNATURE_SCHEME {
            return Err(SandboxError::Descriptor(format!(
                "unsupported signature scheme {:?}",
                descriptor.signature_scheme
            )));
        }

        let mut shell = DealerSocket::new();
        shell.connect(&descriptor.endpoint(descriptor.shell_port)).await?;

        let mut iopub = SubSocket::new();
        iopub.connect(&descriptor.endpoint(descriptor.iopub_port)).await?;
        // All topics: events are filtered by correlation id, not by topic
        iopub.subscribe("").await?;

        let mut control = DealerSocket::new();
        control
            .connect(&descriptor.endpoint(descriptor.control_port))
            .await?;

        let mut stdin = DealerSocket::new();
        stdin.connect(&descriptor.endpoint(descriptor.stdin_port)).await?;

        let mut hb = ReqSocket::new();
        hb.connect(&descriptor.endpoint(descriptor.hb_port)).await?;

        Ok(Self {
            session_id: Uuid::new_v4().to_string(),
            key: descriptor.signing_key().to_vec(),
            shell,
            iopub,
            control,
            stdin,
            hb,
        })
    }

    /// Liveness handshake: a heartbeat echo, then a `kernel_info_request`
    /// that must be answered within `wait`. No retry; a kernel that cannot
    /// answer this never becomes usable.
    pub async fn probe(&mut self, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;

        self.hb.send(ZmqMessage::from(Bytes::from_static(b"ping"))).await?;
        timeout(remaining(deadline), self.hb.recv())
            .await
            .map_err(|_| SandboxError::Channel("heartbeat did not echo".into()))??;

        let request = WireMessage::request("kernel_info_request", &self.session_id, json!({}));
        let probe_id = request.header.msg_id.clone();
        send(&mut self.shell, &self.key, &request).await?;

        loop {
            let reply = timeout(remaining(deadline), self.shell.recv())
                .await
                .map_err(|_| SandboxError::Channel("no reply to kernel_info_request".into()))??;

            match WireMessage::decode(&reply.into_vec(), &self.key) {
                Ok(msg)
                    if msg.msg_type() == "kernel_info_reply"
                        && msg.parent_msg_id() == Some(probe_id.as_str()) =>
                {
                    debug!(session_id = %self.session_id, "Kernel answered readiness probe");
                    return Ok(());
                }
                Ok(msg) => {
                    debug!(msg_type = %msg.msg_type(), "Ignoring unrelated shell message");
                }
                Err(e) => {
                    debug!(error = %e, "Ignoring undecodable shell message");
                }
            }
        }
    }

    /// Submit code for execution; returns the correlation id of the
    /// submission.
    pub async fn submit_execute(&mut self, code: &str) -> Result<String> {
        let request = WireMessage::request(
            "execute_request",
            &self.session_id,
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        );
        let msg_id = request.header.msg_id.clone();

        send(&mut self.shell, &self.key, &request).await?;

        Ok(msg_id)
    }

    /// Best-effort shutdown request on the control channel; gives the kernel
    /// `wait` to acknowledge and does not care whether it does.
    pub async fn request_shutdown(&mut self, wait: Duration) {
        let request = WireMessage::request(
            "shutdown_request",
            &self.session_id,
            json!({"restart": false}),
        );

        match send(&mut self.control, &self.key, &request).await {
            Ok(()) => {
                let _ = timeout(wait, self.control.recv()).await;
            }
            Err(e) => {
                debug!(error = %e, "Shutdown request not delivered");
            }
        }
    }

    /// Close every channel.
    pub async fn close(self) {
        self.shell.close().await;
        self.iopub.close().await;
        self.control.close().await;
        self.stdin.close().await;
        self.hb.close().await;
    }
}

/// Encode, sign and send one message on a channel socket.
pub(crate) async fn send<S: SocketSend>(
    socket: &mut S,
    key: &[u8],
    message: &WireMessage,
) -> Result<()> {
    let mut frames = message.encode(key)?.into_iter();
    let first: Bytes = frames
        .next()
        .ok_or_else(|| SandboxError::Channel("empty outgoing message".into()))?;
    let mut zmsg = ZmqMessage::from(first);
    for frame in frames {
        zmsg.push_back(frame);
    }
    socket.send(zmsg).await?;
    Ok(())
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
