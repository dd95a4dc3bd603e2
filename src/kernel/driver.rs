//! Execution protocol driver
//!
//! One submission, synchronously: send the code, await the kernel's
//! acknowledgement on the shell channel, and in parallel drain the iopub
//! event stream into output fragments. Events carrying another submission's
//! correlation id are discarded; matching events append fragments in the
//! order they arrive.
//!
//! The drain stops once `drain_idle_timeout` passes with no matching event.
//! That cutoff is the documented completeness/latency trade-off: a
//! submission that goes quiet longer than the idle window loses whatever it
//! prints afterwards, and raising the window taxes every call.

use std::time::Duration;

use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use zeromq::{DealerSocket, SocketRecv, SubSocket};

use crate::error::Result;
use crate::kernel::channels::KernelChannels;
use crate::kernel::wire::WireMessage;
use crate::models::{ExecutionOutput, OutputFragment};

/// Terminal control/formatting escapes, as kernels love to color tracebacks.
static CONTROL_CODES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("control-code pattern compiles")
});

/// Run one code submission to completion and collect its output.
pub async fn execute(
    channels: &mut KernelChannels,
    code: &str,
    ack_timeout: Duration,
    drain_idle_timeout: Duration,
) -> Result<ExecutionOutput> {
    let msg_id = channels.submit_execute(code).await?;

    debug!(msg_id = %msg_id, "Submitted execute request");

    let KernelChannels {
        shell, iopub, key, ..
    } = channels;
    let key: &[u8] = key;

    let mut collector = FragmentCollector::new(msg_id.clone());

    // Reply and event stream come from independent sockets and may land in
    // either order; run both waits side by side.
    let (reply, ()) = tokio::join!(
        await_reply(shell, key, &msg_id, ack_timeout),
        drain_iopub(iopub, key, &mut collector, drain_idle_timeout),
    );

    match reply? {
        ReplyOutcome::Reply(content) => collector.absorb_reply(&content),
        ReplyOutcome::TimedOut => {
            warn!(msg_id = %msg_id, "No execute reply within {:?}", ack_timeout);
            collector.push_timeout(ack_timeout);
        }
    }

    Ok(collector.finish())
}

enum ReplyOutcome {
    Reply(Value),
    /// Not fatal: the kernel is still computing and the session stays
    /// usable.
    TimedOut,
}

/// Wait for the terminal `execute_reply` to `msg_id`, bounded by
/// `ack_timeout`. Replies to other submissions are stale and ignored.
async fn await_reply(
    shell: &mut DealerSocket,
    key: &[u8],
    msg_id: &str,
    ack_timeout: Duration,
) -> Result<ReplyOutcome> {
    let deadline = Instant::now() + ack_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let received = match timeout(remaining, shell.recv()).await {
            Ok(received) => received?,
            Err(_) => return Ok(ReplyOutcome::TimedOut),
        };

        match WireMessage::decode(&received.into_vec(), key) {
            Ok(msg)
                if msg.msg_type() == "execute_reply"
                    && msg.parent_msg_id() == Some(msg_id) =>
            {
                return Ok(ReplyOutcome::Reply(msg.content));
            }
            Ok(msg) => {
                debug!(msg_type = %msg.msg_type(), "Ignoring stale shell message");
            }
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable shell message");
            }
        }
    }
}

/// Read iopub events into the collector until `idle` passes with no matching
/// event. Transport errors end the drain; the reply path still decides the
/// call's outcome.
async fn drain_iopub(
    iopub: &mut SubSocket,
    key: &[u8],
    collector: &mut FragmentCollector,
    idle: Duration,
) {
    let mut deadline = Instant::now() + idle;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let received = match timeout(remaining, iopub.recv()).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!(error = %e, "Event stream read failed, stopping drain");
                return;
            }
            Err(_) => return,
        };

        match WireMessage::decode(&received.into_vec(), key) {
            Ok(event) => {
                if collector.observe(&event) {
                    deadline = Instant::now() + idle;
                }
            }
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable event");
            }
        }
    }
}

/// Accumulates the fragments of one submission, in arrival order.
struct FragmentCollector {
    msg_id: String,
    fragments: Vec<OutputFragment>,
    saw_error_event: bool,
}

impl FragmentCollector {
    fn new(msg_id: String) -> Self {
        Self {
            msg_id,
            fragments: Vec::new(),
            saw_error_event: false,
        }
    }

    /// Feed one event. Returns whether it belonged to this submission
    /// (matching events reset the drain's idle clock even when, like
    /// `status`, they add no fragment).
    fn observe(&mut self, event: &WireMessage) -> bool {
        if event.parent_msg_id() != Some(self.msg_id.as_str()) {
            return false;
        }

        match event.msg_type() {
            "stream" => {
                let text = text_field(&event.content, "text");
                if event.content["name"].as_str() == Some("stderr") {
                    self.fragments.push(OutputFragment::Stderr { text });
                } else {
                    self.fragments.push(OutputFragment::Stdout { text });
                }
            }
            "display_data" => {
                self.fragments.push(OutputFragment::Display {
                    text: display_text(&event.content["data"]),
                });
            }
            "execute_result" => {
                self.fragments.push(OutputFragment::Result {
                    text: display_text(&event.content["data"]),
                });
            }
            "error" => {
                self.saw_error_event = true;
                self.fragments.push(error_fragment(&event.content));
            }
            // status / execute_input and friends: activity, but no output
            _ => {}
        }

        true
    }

    /// Fold in the shell reply. An error reply duplicates the iopub `error`
    /// event for the same exception, so only synthesize a fragment when the
    /// drain saw none; the output carries exactly one error per raise.
    fn absorb_reply(&mut self, content: &Value) {
        if content["status"].as_str() == Some("error") && !self.saw_error_event {
            self.fragments.push(error_fragment(content));
        }
    }

    fn push_timeout(&mut self, ack_timeout: Duration) {
        self.fragments.push(OutputFragment::Error {
            ename: "ExecutionTimeout".to_string(),
            evalue: format!(
                "kernel did not acknowledge the execution within {:?}",
                ack_timeout
            ),
            traceback: String::new(),
        });
    }

    fn finish(self) -> ExecutionOutput {
        ExecutionOutput::new(self.fragments)
    }
}

fn error_fragment(content: &Value) -> OutputFragment {
    let traceback = content["traceback"]
        .as_array()
        .map(|lines| {
            lines
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    OutputFragment::Error {
        ename: text_field(content, "ename"),
        evalue: text_field(content, "evalue"),
        traceback: sanitize_control_codes(&traceback),
    }
}

fn text_field(content: &Value, field: &str) -> String {
    content[field].as_str().unwrap_or_default().to_string()
}

/// Reduce a display-data bundle to text: the `text/plain` fallback when
/// present, otherwise a note about what the kernel sent.
fn display_text(data: &Value) -> String {
    if let Some(text) = data["text/plain"].as_str() {
        return text.to_string();
    }

    if let Some(png) = data["image/png"].as_str() {
        let size = base64::engine::general_purpose::STANDARD
            .decode(png.trim())
            .map(|bytes| bytes.len())
            .unwrap_or(png.len());
        return format!("<image/png, {} bytes>", size);
    }

    match data.as_object() {
        Some(map) if !map.is_empty() => {
            let mimes: Vec<_> = map.keys().map(String::as_str).collect();
            format!("<display data: {}>", mimes.join(", "))
        }
        _ => "<empty display data>".to_string(),
    }
}

/// Strip terminal escape sequences so tracebacks stay plain text.
fn sanitize_control_codes(text: &str) -> String {
    CONTROL_CODES.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::kernel::wire::{MessageHeader, PROTOCOL_VERSION};

    fn event(msg_type: &str, parent_id: &str, content: Value) -> WireMessage {
        WireMessage {
            header: MessageHeader {
                msg_id: uuid::Uuid::new_v4().to_string(),
                session: "kernel".to_string(),
                username: "kernel".to_string(),
                date: chrono::Utc::now().to_rfc3339(),
                msg_type: msg_type.to_string(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: json!({"msg_id": parent_id}),
            metadata: json!({}),
            content,
        }
    }

    #[test]
    fn fragments_keep_arrival_order() {
        let mut collector = FragmentCollector::new("m1".to_string());

        collector.observe(&event("stream", "m1", json!({"name": "stdout", "text": "A"})));
        collector.observe(&event(
            "execute_result",
            "m1",
            json!({"data": {"text/plain": "B"}}),
        ));
        collector.observe(&event("stream", "m1", json!({"name": "stderr", "text": "C"})));
        collector.absorb_reply(&json!({"status": "ok"}));

        assert_eq!(
            collector.finish().fragments,
            vec![
                OutputFragment::Stdout { text: "A".into() },
                OutputFragment::Result { text: "B".into() },
                OutputFragment::Stderr { text: "C".into() },
            ]
        );
    }

    #[test]
    fn foreign_correlation_ids_are_discarded() {
        let mut collector = FragmentCollector::new("m1".to_string());

        let matched = collector.observe(&event(
            "stream",
            "other",
            json!({"name": "stdout", "text": "not mine"}),
        ));

        assert!(!matched);
        assert!(collector.finish().is_empty());
    }

    #[test]
    fn status_events_match_without_producing_output() {
        let mut collector = FragmentCollector::new("m1".to_string());

        let matched =
            collector.observe(&event("status", "m1", json!({"execution_state": "busy"})));

        assert!(matched);
        assert!(collector.finish().is_empty());
    }

    #[test]
    fn error_event_and_error_reply_collapse_to_one_fragment() {
        let error_content = json!({
            "ename": "ValueError",
            "evalue": "boom",
            "traceback": ["Traceback (most recent call last):", "ValueError: boom"],
        });

        let mut collector = FragmentCollector::new("m1".to_string());
        collector.observe(&event("error", "m1", error_content.clone()));
        collector.absorb_reply(&json!({
            "status": "error",
            "ename": "ValueError",
            "evalue": "boom",
            "traceback": [],
        }));

        let output = collector.finish();
        assert_eq!(output.fragments.len(), 1);
        match &output.fragments[0] {
            OutputFragment::Error { ename, evalue, .. } => {
                assert_eq!(ename, "ValueError");
                assert_eq!(evalue, "boom");
            }
            other => panic!("expected error fragment, got {:?}", other),
        }
    }

    #[test]
    fn error_reply_alone_synthesizes_a_fragment() {
        let mut collector = FragmentCollector::new("m1".to_string());
        collector.absorb_reply(&json!({
            "status": "error",
            "ename": "KeyboardInterrupt",
            "evalue": "",
            "traceback": [],
        }));

        let output = collector.finish();
        assert_eq!(output.fragments.len(), 1);
        assert!(output.has_error());
    }

    #[test]
    fn timeout_becomes_a_fragment_not_an_error() {
        let mut collector = FragmentCollector::new("m1".to_string());
        collector.push_timeout(Duration::from_secs(30));

        let output = collector.finish();
        match &output.fragments[0] {
            OutputFragment::Error { ename, .. } => assert_eq!(ename, "ExecutionTimeout"),
            other => panic!("expected error fragment, got {:?}", other),
        }
    }

    #[test]
    fn tracebacks_are_stripped_of_control_codes() {
        let mut collector = FragmentCollector::new("m1".to_string());
        collector.observe(&event(
            "error",
            "m1",
            json!({
                "ename": "ValueError",
                "evalue": "boom",
                "traceback": [
                    "\u{1b}[0;31m---------------------------------------\u{1b}[0m",
                    "\u{1b}[0;31mValueError\u{1b}[0m: boom",
                ],
            }),
        ));

        match &collector.finish().fragments[0] {
            OutputFragment::Error { traceback, .. } => {
                assert!(!traceback.contains('\u{1b}'));
                assert!(traceback.contains("ValueError"));
            }
            other => panic!("expected error fragment, got {:?}", other),
        }
    }

    #[test]
    fn display_data_prefers_text_plain() {
        assert_eq!(
            display_text(&json!({"text/plain": "<Figure>", "image/png": "aGk="})),
            "<Figure>"
        );
    }

    #[test]
    fn image_only_display_data_becomes_a_size_note() {
        // "aGVsbG8=" decodes to the five bytes of "hello"
        assert_eq!(
            display_text(&json!({"image/png": "aGVsbG8="})),
            "<image/png, 5 bytes>"
        );
    }

    #[test]
    fn empty_execution_yields_empty_output() {
        let mut collector = FragmentCollector::new("m1".to_string());
        collector.absorb_reply(&json!({"status": "ok"}));
        assert!(collector.finish().is_empty());
    }
}
