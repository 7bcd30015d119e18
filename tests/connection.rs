//! Connection integration tests over loopback duplex transports.
//!
//! A raw wire probe stands in for the server: it parses frames off the
//! transport with the public codec, records everything it sees, and answers
//! per test policy. That keeps the client's bytes observable.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use rsocket_client::protocol::{
    encode_frame, flags, Frame, FrameBody, FrameBuffer, FrameType, Payload,
};
use rsocket_client::{
    Connection, ConnectionOptions, DrainingSocket, RSocket, RSocketError,
};

/// Frames the probe observed, shared with the test body.
type SeenFrames = Arc<Mutex<Vec<Frame>>>;

/// Commands a test can issue to the probe.
enum ProbeCommand {
    /// Answer the request stream with an echo of its payload.
    Respond { stream_id: u32, payload: Payload },
}

/// Wire probe: records every inbound frame; echoes requests immediately
/// when `auto_echo`, otherwise waits for [`ProbeCommand`]s.
fn spawn_probe(
    transport: DuplexStream,
    auto_echo: bool,
) -> (SeenFrames, mpsc::UnboundedSender<ProbeCommand>) {
    let seen: SeenFrames = Arc::new(Mutex::new(Vec::new()));
    let seen_task = Arc::clone(&seen);
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<ProbeCommand>();

    tokio::spawn(async move {
        let (mut read, mut write) = tokio::io::split(transport);
        let mut framer = FrameBuffer::new();
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            tokio::select! {
                result = read.read(&mut buf) => {
                    let n = match result {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let frames = framer.push(&buf[..n]).expect("probe parse error");
                    for frame in frames {
                        seen_task.lock().unwrap().push(frame.clone());
                        match frame.body {
                            FrameBody::RequestResponse if auto_echo => {
                                let reply =
                                    Frame::response(frame.stream_id, flags::NONE, frame.payload());
                                if write.write_all(&encode_frame(&reply)).await.is_err() {
                                    return;
                                }
                            }
                            FrameBody::Keepalive if frame.wants_keepalive_response() => {
                                let ack = Frame::keepalive(flags::NONE, frame.data.clone());
                                if write.write_all(&encode_frame(&ack)).await.is_err() {
                                    return;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                command = command_rx.recv() => {
                    match command {
                        Some(ProbeCommand::Respond { stream_id, payload }) => {
                            let reply = Frame::response(stream_id, flags::NONE, payload);
                            if write.write_all(&encode_frame(&reply)).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    });

    (seen, command_tx)
}

/// Request/response over a loopback: the server sees a REQUEST_RESPONSE on
/// stream 2, the client's stream resolves exactly once, and the stream
/// table is empty afterward.
#[tokio::test]
async fn test_request_response_over_loopback() {
    let (client_io, server_io) = duplex(64 * 1024);
    let (seen, _commands) = spawn_probe(server_io, true);

    let client = Connection::connect(client_io, ConnectionOptions::default())
        .await
        .unwrap();

    let payload = Payload::from_str(Some("m"), Some("hello"));
    let response = client.request(payload.clone()).await.unwrap();
    assert_eq!(response, payload);

    let frames = seen.lock().unwrap();
    let request = frames
        .iter()
        .find(|f| f.frame_type() == FrameType::RequestResponse)
        .expect("request observed on the wire");
    assert_eq!(request.stream_id, 2);
    assert_eq!(request.data.as_deref(), Some(&b"hello"[..]));
    assert_eq!(request.metadata.as_deref(), Some(&b"m"[..]));
    drop(frames);

    // Only the connection stream remains.
    assert_eq!(client.pending_streams(), 0);
}

/// SETUP precedes every request on the wire.
#[tokio::test]
async fn test_setup_is_first_frame() {
    let (client_io, server_io) = duplex(64 * 1024);
    let (seen, _commands) = spawn_probe(server_io, true);

    let client = Connection::connect(client_io, ConnectionOptions::default())
        .await
        .unwrap();
    client
        .request(Payload::from_str(None, Some("x")))
        .await
        .unwrap();

    let frames = seen.lock().unwrap();
    assert_eq!(frames[0].frame_type(), FrameType::Setup);
    assert_eq!(frames[0].stream_id, 0);
}

/// A server that never replies: the client times out, a CANCEL for the
/// stream goes out on the wire, and the stream is removed from the table.
#[tokio::test(start_paused = true)]
async fn test_request_timeout_emits_cancel_on_wire() {
    let (client_io, server_io) = duplex(64 * 1024);
    let (seen, _commands) = spawn_probe(server_io, false);

    let options = ConnectionOptions::default().request_timeout(Duration::from_millis(100));
    let client = Connection::connect(client_io, options).await.unwrap();

    let result = client.request(Payload::from_str(None, Some("x"))).await;
    assert!(matches!(result, Err(RSocketError::Timeout)));
    assert_eq!(client.pending_streams(), 0);

    // Let the CANCEL flush through the writer.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let frames = seen.lock().unwrap();
    let cancel = frames
        .iter()
        .find(|f| f.frame_type() == FrameType::Cancel)
        .expect("CANCEL observed on the wire");
    assert_eq!(cancel.stream_id, 2);
}

/// A late response for a timed-out stream is discarded silently.
#[tokio::test(start_paused = true)]
async fn test_late_response_is_discarded() {
    let (client_io, server_io) = duplex(64 * 1024);
    let (_seen, commands) = spawn_probe(server_io, false);

    let options = ConnectionOptions::default().request_timeout(Duration::from_millis(100));
    let client = Connection::connect(client_io, options).await.unwrap();

    let result = client.request(Payload::from_str(None, Some("x"))).await;
    assert!(matches!(result, Err(RSocketError::Timeout)));

    // Respond after the fact; nothing must blow up, nothing must revive.
    commands
        .send(ProbeCommand::Respond {
            stream_id: 2,
            payload: Payload::from_str(None, Some("too late")),
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client.pending_streams(), 0);
    assert_eq!(client.availability(), 1.0);
}

/// Draining close: with one request in flight, close() completes only after
/// the response arrives, and availability is 0 for the whole drain.
#[tokio::test]
async fn test_draining_close_waits_for_response() {
    let (client_io, server_io) = duplex(64 * 1024);
    let (seen, commands) = spawn_probe(server_io, false);

    let client = Connection::connect(client_io, ConnectionOptions::default())
        .await
        .unwrap();
    let socket = Arc::new(DrainingSocket::new(Arc::new(client)));

    let pending = tokio::spawn(socket.request(Payload::from_str(None, Some("slow"))));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(socket.outstanding(), 1);

    let closer = {
        let socket = Arc::clone(&socket);
        tokio::spawn(async move { socket.close().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(socket.is_draining());
    assert_eq!(socket.availability(), 0.0);
    assert!(!closer.is_finished(), "close completed before the response");

    // Find the stream id the probe saw and release the response.
    let stream_id = seen
        .lock()
        .unwrap()
        .iter()
        .find(|f| f.frame_type() == FrameType::RequestResponse)
        .map(|f| f.stream_id)
        .expect("request observed");
    commands
        .send(ProbeCommand::Respond {
            stream_id,
            payload: Payload::from_str(None, Some("done")),
        })
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.data.as_deref(), Some(&b"done"[..]));

    tokio::time::timeout(Duration::from_secs(2), closer)
        .await
        .unwrap()
        .unwrap();
}

/// Responses for interleaved streams resolve independently and in any order.
#[tokio::test]
async fn test_interleaved_streams_resolve_out_of_order() {
    let (client_io, server_io) = duplex(64 * 1024);
    let (seen, commands) = spawn_probe(server_io, false);

    let client = Arc::new(
        Connection::connect(client_io, ConnectionOptions::default())
            .await
            .unwrap(),
    );

    let first = tokio::spawn(client.request(Payload::from_str(None, Some("first"))));
    let second = tokio::spawn(client.request(Payload::from_str(None, Some("second"))));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ids: Vec<u32> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|f| f.frame_type() == FrameType::RequestResponse)
        .map(|f| f.stream_id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&2) && ids.contains(&4));

    // Answer in reverse order of issue.
    for &stream_id in ids.iter().rev() {
        commands
            .send(ProbeCommand::Respond {
                stream_id,
                payload: Payload::from_str(None, Some("ok")),
            })
            .unwrap();
    }

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(client.pending_streams(), 0);
}
