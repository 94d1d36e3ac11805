//! Frame dispatcher.
//!
//! Invoked serially from a connection's read task. Consumes zero or more
//! whole frames from the receive buffer per call, validates the envelope
//! (version, size, trailer sentinel) and routes each frame by its
//! `(type, sub_type)` pair to the matching handler.

use std::sync::Arc;

use bytes::Bytes;
use tether_proto::messages::{
    ErrorMessageHeader, HeartbeatReply, MultiblockAbortInit, MultiblockAbortReply,
    MultiblockFinish, MultiblockInit, MultiblockInitReply, MultiblockStatic, SessionCloseReply,
    SessionCloseStart, SessionInitReply, SessionInitStart, SingleblockDynamicHeader,
    SingleblockReply, SingleblockStatic, StreamDynamicHeader, StreamReply, StreamStatic,
    encode_error_message,
};
use tether_proto::{
    ErrorKind, ErrorSubtype, FrameHeader, FrameTrailer, HeartbeatSubtype, MessageType,
    MultiblockSubtype, PROTOCOL_VERSION, SessionSubtype, SingleblockSubtype, StreamSubtype,
};
use zerocopy::IntoBytes;

use crate::protocol::Protocol;
use crate::ring::RecvBuffer;
use crate::session::Session;
use crate::statemachine::SessionState;

/// Consume all whole frames currently buffered for `session`.
///
/// Called by the transport's read task after appending received bytes.
pub async fn process_frames(protocol: &Arc<Protocol>, session: &Arc<Session>, buf: &mut RecvBuffer) {
    loop {
        let consumed = process_one(protocol, session, buf.as_slice()).await;
        if consumed == 0 {
            break;
        }
        buf.consume(consumed);
    }
}

/// Process at most one frame; returns the bytes consumed, 0 when more
/// bytes are needed (or the head of the buffer cannot be processed yet).
async fn process_one(protocol: &Arc<Protocol>, session: &Arc<Session>, bytes: &[u8]) -> usize {
    if bytes.len() < FrameHeader::SIZE {
        return 0;
    }

    let header = match FrameHeader::peek(bytes) {
        Ok(header) => *header,
        Err(_) => return 0,
    };

    if header.version() != PROTOCOL_VERSION {
        tracing::error!(version = header.version(), "received message with false version");
        send_error(session, ErrorSubtype::FalseVersion, "received message with false version")
            .await;
        return 0;
    }

    let total = header.total_size() as usize;
    if total > bytes.len() {
        // need more bytes
        return 0;
    }

    // proxy mode: forward the whole frame to the linked peer untouched
    if let Some(peer) = session.linked_session() {
        if let Err(error) = peer.forward_raw(&bytes[..total]).await {
            tracing::warn!(%error, "linked-session forward failed");
        }
        return total;
    }

    if header.flags().is_reply() {
        protocol.reply().remove(header.session_id(), header.message_id());
    }

    if total < FrameHeader::SIZE + FrameTrailer::SIZE
        || total % 8 != 0
        || FrameTrailer::validate_frame(&bytes[..total]).is_err()
    {
        tracing::error!(total, "frame failed size or sentinel validation");
        send_error(session, ErrorSubtype::InvalidMessage, "invalid message size or delimiter")
            .await;
        return 0;
    }

    let frame = &bytes[..total];

    match header.message_type() {
        Some(MessageType::Session) => handle_session(protocol, session, &header, frame).await,
        Some(MessageType::Error) => handle_error(session, &header, frame).await,
        Some(
            data_type @ (MessageType::Heartbeat
            | MessageType::StreamData
            | MessageType::SingleblockData
            | MessageType::MultiblockData),
        ) => {
            // data and heartbeat frames require a ready session; the
            // offending frame is still consumed after the error report
            if require_ready(session).await {
                match data_type {
                    MessageType::Heartbeat => handle_heartbeat(session, &header).await,
                    MessageType::StreamData => handle_stream(session, &header, frame).await,
                    MessageType::SingleblockData => {
                        handle_singleblock(protocol, session, &header, frame).await;
                    }
                    MessageType::MultiblockData => {
                        handle_multiblock(protocol, session, &header, frame).await;
                    }
                    _ => {}
                }
            }
        }
        Some(MessageType::Undefined) | None => {
            tracing::debug!(
                raw_type = header.raw_type(),
                sub_type = header.sub_type(),
                "skipping frame of unknown type"
            );
        }
    }

    total
}

/// Gate for data and heartbeat frames: the session must be ready.
async fn require_ready(session: &Arc<Session>) -> bool {
    if session.is_in_state(SessionState::SessionReady) {
        return true;
    }

    tracing::warn!(session_id = session.session_id(), "data frame for session that is not ready");
    send_error(session, ErrorSubtype::UnknownSession, "received frame for unknown session").await;
    false
}

async fn send_error(session: &Arc<Session>, subtype: ErrorSubtype, text: &str) {
    let frame =
        encode_error_message(subtype, session.next_message_id(), session.session_id(), text);
    if let Err(error) = session.send_frame(&frame).await {
        tracing::debug!(%error, "error frame send failed");
    }
}

async fn send_reply_frame(session: &Arc<Session>, frame: &[u8]) {
    if let Err(error) = session.send_frame(frame).await {
        tracing::debug!(%error, "reply frame send failed");
    }
}

// ----------------------------------------------------------------------
// session type
// ----------------------------------------------------------------------

async fn handle_session(
    protocol: &Arc<Protocol>,
    session: &Arc<Session>,
    header: &FrameHeader,
    frame: &[u8],
) {
    match header.sub_type() {
        value if value == SessionSubtype::InitStart as u8 => {
            let Ok(message) = SessionInitStart::parse(frame) else {
                tracing::warn!("malformed session init start");
                return;
            };
            process_init_start(protocol, session, message).await;
        }
        value if value == SessionSubtype::InitReply as u8 => {
            let Ok(message) = SessionInitReply::parse(frame) else {
                tracing::warn!("malformed session init reply");
                return;
            };
            process_init_reply(protocol, session, message).await;
        }
        value if value == SessionSubtype::CloseStart as u8 => {
            let Ok(message) = SessionCloseStart::parse(frame) else {
                tracing::warn!("malformed session close start");
                return;
            };
            process_close_start(session, message).await;
        }
        value if value == SessionSubtype::CloseReply as u8 => {
            process_close_reply(session).await;
        }
        other => tracing::debug!(sub_type = other, "unknown session sub-type"),
    }
}

/// Server side: compose the complete id, register and confirm.
async fn process_init_start(
    protocol: &Arc<Protocol>,
    session: &Arc<Session>,
    message: &SessionInitStart,
) {
    tracing::debug!("process session init start");

    let client_session_id = message.client_session_id();
    let server_half = protocol.next_session_id();
    let complete_session_id = client_session_id | (u32::from(server_half) << 16);
    let session_identifier = message.session_identifier();
    let message_id = message.header.message_id();

    protocol.add_session(complete_session_id, session.clone());
    if let Err(error) = session.make_ready(complete_session_id, session_identifier).await {
        tracing::warn!(%error, "make ready failed on init start");
    }

    let reply = SessionInitReply::new(message_id, client_session_id, complete_session_id);
    send_reply_frame(session, reply.as_bytes()).await;
}

/// Client side: rekey from the tentative id and wake the connect caller.
async fn process_init_reply(
    protocol: &Arc<Protocol>,
    session: &Arc<Session>,
    message: &SessionInitReply,
) {
    tracing::debug!("process session init reply");

    let tentative_id = message.client_session_id();
    let complete_session_id = message.complete_session_id();

    protocol.remove_session(tentative_id);
    protocol.add_session(complete_session_id, session.clone());

    if let Err(error) = session.make_ready(complete_session_id, 0).await {
        tracing::warn!(%error, "make ready failed on init reply");
    }
}

/// Passive side of the close handshake.
async fn process_close_start(session: &Arc<Session>, message: &SessionCloseStart) {
    tracing::debug!(reply_expected = message.reply_expected(), "process session close start");

    let reply = SessionCloseReply::new(message.header.message_id(), session.session_id());
    send_reply_frame(session, reply.as_bytes()).await;

    if let Err(error) = session.end_session().await {
        tracing::debug!(%error, "teardown after close start failed");
    }
}

/// Initiator side: the peer confirmed, finish the local teardown.
async fn process_close_reply(session: &Arc<Session>) {
    tracing::debug!("process session close reply");

    if let Err(error) = session.end_session().await {
        tracing::debug!(%error, "teardown after close reply failed");
    }
}

// ----------------------------------------------------------------------
// heartbeat type
// ----------------------------------------------------------------------

async fn handle_heartbeat(session: &Arc<Session>, header: &FrameHeader) {
    match header.sub_type() {
        value if value == HeartbeatSubtype::Start as u8 => {
            let reply = HeartbeatReply::new(header.message_id(), session.session_id());
            send_reply_frame(session, reply.as_bytes()).await;
        }
        value if value == HeartbeatSubtype::Reply as u8 => {
            // arrival already cleared the reply-registry entry
        }
        other => tracing::debug!(sub_type = other, "unknown heartbeat sub-type"),
    }
}

// ----------------------------------------------------------------------
// error type
// ----------------------------------------------------------------------

async fn handle_error(session: &Arc<Session>, header: &FrameHeader, frame: &[u8]) {
    let Ok(message) = ErrorMessageHeader::parse(frame) else {
        tracing::warn!("malformed error frame");
        return;
    };
    let text = match message.text(frame) {
        Ok(text) => String::from_utf8_lossy(text).into_owned(),
        Err(_) => String::new(),
    };

    let kind = match header.sub_type() {
        value if value == ErrorSubtype::FalseVersion as u8 => ErrorKind::FalseVersion,
        value if value == ErrorSubtype::UnknownSession as u8 => ErrorKind::UnknownSession,
        value if value == ErrorSubtype::InvalidMessage as u8 => ErrorKind::InvalidMessageSize,
        other => {
            tracing::debug!(sub_type = other, "unknown error sub-type");
            return;
        }
    };

    tracing::error!(?kind, %text, "received error frame");
    session.dispatch_error(kind, &text).await;
}

// ----------------------------------------------------------------------
// stream type
// ----------------------------------------------------------------------

async fn handle_stream(session: &Arc<Session>, header: &FrameHeader, frame: &[u8]) {
    match header.sub_type() {
        value if value == StreamSubtype::Static as u8 => {
            let Ok(message) = StreamStatic::parse(frame) else {
                tracing::warn!("malformed static stream frame");
                return;
            };
            let Ok(payload) = message.payload() else {
                tracing::warn!("static stream frame with inconsistent payload size");
                return;
            };
            deliver_stream(session, header, payload).await;
        }
        value if value == StreamSubtype::Dynamic as u8 => {
            let Ok(message) = StreamDynamicHeader::parse(frame) else {
                tracing::warn!("malformed dynamic stream frame");
                return;
            };
            let Ok(payload) = message.payload(frame) else {
                tracing::warn!("dynamic stream frame with inconsistent payload size");
                return;
            };
            deliver_stream(session, header, payload).await;
        }
        value if value == StreamSubtype::Reply as u8 => {
            // arrival already cleared the reply-registry entry
        }
        other => tracing::debug!(sub_type = other, "unknown stream sub-type"),
    }
}

async fn deliver_stream(session: &Arc<Session>, header: &FrameHeader, payload: &[u8]) {
    session.handler().stream_data(session, payload).await;

    if header.flags().reply_expected() {
        let reply = StreamReply::new(header.message_id(), session.session_id());
        send_reply_frame(session, reply.as_bytes()).await;
    }
}

// ----------------------------------------------------------------------
// single-block type
// ----------------------------------------------------------------------

async fn handle_singleblock(
    protocol: &Arc<Protocol>,
    session: &Arc<Session>,
    header: &FrameHeader,
    frame: &[u8],
) {
    let parsed = match header.sub_type() {
        value if value == SingleblockSubtype::Static as u8 => match SingleblockStatic::parse(frame)
        {
            Ok(message) => match message.payload() {
                Ok(payload) => Some((
                    message.singleblock_id(),
                    message.blocker_id(),
                    Bytes::copy_from_slice(payload),
                )),
                Err(_) => {
                    tracing::warn!("static single-block frame with inconsistent payload size");
                    None
                }
            },
            Err(_) => {
                tracing::warn!("malformed static single-block frame");
                None
            }
        },
        value if value == SingleblockSubtype::Dynamic as u8 => {
            match SingleblockDynamicHeader::parse(frame) {
                Ok(message) => match message.payload(frame) {
                    Ok(payload) => Some((
                        message.singleblock_id(),
                        message.blocker_id(),
                        Bytes::copy_from_slice(payload),
                    )),
                    Err(_) => {
                        tracing::warn!("dynamic single-block frame with inconsistent payload size");
                        None
                    }
                },
                Err(_) => {
                    tracing::warn!("malformed dynamic single-block frame");
                    None
                }
            }
        }
        value if value == SingleblockSubtype::Reply as u8 => None,
        other => {
            tracing::debug!(sub_type = other, "unknown single-block sub-type");
            None
        }
    };

    let Some((singleblock_id, blocker_id, payload)) = parsed else {
        return;
    };

    if header.flags().blocker_correlated() && blocker_id != 0 {
        if !protocol.blockers().release(blocker_id, payload) {
            tracing::warn!(blocker_id, "response without a parked request");
        }
    } else {
        session.handler().standalone_data(session, singleblock_id, payload).await;
    }

    if header.flags().reply_expected() {
        let reply = SingleblockReply::new(header.message_id(), session.session_id());
        send_reply_frame(session, reply.as_bytes()).await;
    }
}

// ----------------------------------------------------------------------
// multi-block type
// ----------------------------------------------------------------------

async fn handle_multiblock(
    protocol: &Arc<Protocol>,
    session: &Arc<Session>,
    header: &FrameHeader,
    frame: &[u8],
) {
    match header.sub_type() {
        value if value == MultiblockSubtype::Init as u8 => {
            let Ok(message) = MultiblockInit::parse(frame) else {
                tracing::warn!("malformed multi-block init");
                return;
            };

            let accepted = session
                .multiblock()
                .create_incoming(message.multiblock_id(), message.total_size());
            let status =
                if accepted { MultiblockInitReply::OK } else { MultiblockInitReply::FAIL };

            let reply = MultiblockInitReply::new(
                header.message_id(),
                session.session_id(),
                message.multiblock_id(),
                status,
            );
            send_reply_frame(session, reply.as_bytes()).await;
        }
        value if value == MultiblockSubtype::InitReply as u8 => {
            let Ok(message) = MultiblockInitReply::parse(frame) else {
                tracing::warn!("malformed multi-block init reply");
                return;
            };

            if message.status() == MultiblockInitReply::OK {
                session.multiblock().make_outgoing_ready(message.multiblock_id());
            } else {
                session.multiblock().fail_outgoing(message.multiblock_id());
                protocol.blockers().release_empty(message.multiblock_id());
                session
                    .dispatch_error(
                        ErrorKind::MultiblockFailed,
                        "unable to send multi-block message",
                    )
                    .await;
            }
        }
        value if value == MultiblockSubtype::Static as u8 => {
            let Ok(message) = MultiblockStatic::parse(frame) else {
                tracing::warn!("malformed multi-block part");
                return;
            };
            let Ok(payload) = message.payload() else {
                tracing::warn!("multi-block part with inconsistent payload size");
                return;
            };

            if !session.multiblock().append_incoming(message.multiblock_id(), payload) {
                tracing::warn!(
                    multiblock_id = message.multiblock_id(),
                    "part for unknown incoming transfer"
                );
            }
        }
        value if value == MultiblockSubtype::Finish as u8 => {
            let Ok(message) = MultiblockFinish::parse(frame) else {
                tracing::warn!("malformed multi-block finish");
                return;
            };

            let Some(buffer) = session.multiblock().finish_incoming(message.multiblock_id())
            else {
                tracing::warn!(
                    multiblock_id = message.multiblock_id(),
                    "finish for unknown incoming transfer"
                );
                return;
            };

            if header.flags().blocker_correlated() && message.blocker_id() != 0 {
                if !protocol.blockers().release(message.blocker_id(), buffer) {
                    tracing::warn!(
                        blocker_id = message.blocker_id(),
                        "response without a parked request"
                    );
                }
            } else {
                session
                    .handler()
                    .standalone_data(session, message.multiblock_id(), buffer)
                    .await;
            }
        }
        value if value == MultiblockSubtype::AbortInit as u8 => {
            let Ok(message) = MultiblockAbortInit::parse(frame) else {
                tracing::warn!("malformed multi-block abort init");
                return;
            };

            session.multiblock().remove_outgoing(message.multiblock_id());

            let reply = MultiblockAbortReply::new(
                header.message_id(),
                session.session_id(),
                message.multiblock_id(),
            );
            send_reply_frame(session, reply.as_bytes()).await;
        }
        value if value == MultiblockSubtype::AbortReply as u8 => {
            let Ok(message) = MultiblockAbortReply::parse(frame) else {
                tracing::warn!("malformed multi-block abort reply");
                return;
            };
            session.multiblock().remove_incoming(message.multiblock_id());
        }
        other => tracing::debug!(sub_type = other, "unknown multi-block sub-type"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tether_proto::messages::HeartbeatStart;

    use super::*;
    use crate::protocol::Config;
    use crate::testutil::{Event, MockTransport, RecordingHandler};

    struct Endpoint {
        protocol: Arc<Protocol>,
        handler: Arc<RecordingHandler>,
        session: Arc<Session>,
        transport: Arc<MockTransport>,
        buf: RecvBuffer,
    }

    fn endpoint(client: bool, config: Config) -> Endpoint {
        let handler = RecordingHandler::new();
        let protocol = Protocol::new(config, handler.clone());
        let transport = if client { MockTransport::client() } else { MockTransport::server() };
        let session = protocol.create_session(transport.clone());
        Endpoint { protocol, handler, session, transport, buf: RecvBuffer::new() }
    }

    /// Heartbeats pushed far out so frame counts stay deterministic.
    fn quiet_config() -> Config {
        Config {
            reply_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(3600),
        }
    }

    /// Ferry frames between the two endpoints until both directions stay
    /// idle, returning every frame that crossed (in transfer order).
    async fn shuttle(a: &mut Endpoint, b: &mut Endpoint) -> Vec<bytes::Bytes> {
        let mut crossed = Vec::new();
        let mut idle_rounds = 0;

        while idle_rounds < 3 {
            let from_a = a.transport.take_sent();
            let from_b = b.transport.take_sent();

            if from_a.is_empty() && from_b.is_empty() {
                // give the multi-block sender task a chance to run
                idle_rounds += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }
            idle_rounds = 0;

            for frame in from_a {
                b.buf.push(&frame);
                crossed.push(frame);
            }
            process_frames(&b.protocol, &b.session, &mut b.buf).await;

            for frame in from_b {
                a.buf.push(&frame);
                crossed.push(frame);
            }
            process_frames(&a.protocol, &a.session, &mut a.buf).await;
        }

        crossed
    }

    async fn connect(client: &mut Endpoint, server: &mut Endpoint, nonce: u32, identifier: u64) {
        client.session.connect_session(nonce).unwrap();
        client.protocol.add_session(nonce, client.session.clone());
        server.session.connect_session(0).unwrap();

        client.session.init_handshake(identifier).await.unwrap();
        shuttle(client, server).await;

        assert!(client.session.is_active());
        assert!(server.session.is_active());
    }

    fn frames_of(crossed: &[bytes::Bytes], msg_type: MessageType, sub_type: u8) -> Vec<bytes::Bytes> {
        crossed
            .iter()
            .filter(|frame| {
                FrameHeader::peek(frame).is_ok_and(|header| {
                    header.message_type() == Some(msg_type) && header.sub_type() == sub_type
                })
            })
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn handshake_composes_complete_session_id() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());

        // burn server id 1 so the assigned half is 2
        server.protocol.next_session_id();

        let identifier = u64::from_le_bytes(*b"test\0\0\0\0");
        connect(&mut client, &mut server, 0x0001, identifier).await;

        assert_eq!(server.session.session_id(), 0x0002_0001);
        assert_eq!(client.session.session_id(), 131_073);

        assert_eq!(
            server.handler.events(),
            vec![Event::Opened { session_id: 131_073, identifier }]
        );
        assert_eq!(
            client.handler.events(),
            vec![Event::Opened { session_id: 131_073, identifier: 0 }]
        );

        // both sides rekeyed their registries to the complete id
        assert!(client.protocol.has_session(131_073));
        assert!(!client.protocol.has_session(0x0001));
        assert!(server.protocol.has_session(131_073));

        // the INIT_REPLY cleared the init-start reply entry
        assert!(client.protocol.reply().is_empty());
    }

    #[tokio::test]
    async fn stream_round_trip_clears_reply_entry() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        let payload = b"hello!!! (static)";
        client.session.send_stream(payload, true).await.unwrap();

        let crossed = shuttle(&mut client, &mut server).await;

        assert_eq!(server.handler.events(), vec![
            Event::Opened { session_id: server.session.session_id(), identifier: 0 },
            Event::Stream { payload: payload.to_vec() },
        ]);
        assert_eq!(frames_of(&crossed, MessageType::StreamData, StreamSubtype::Reply as u8).len(), 1);
        assert!(client.protocol.reply().is_empty());
    }

    #[tokio::test]
    async fn large_stream_payload_is_chunked() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        let payload: Vec<u8> = (0..2148u32).map(|i| i as u8).collect();
        client.session.send_stream(&payload, false).await.unwrap();

        shuttle(&mut client, &mut server).await;

        let chunks: Vec<Vec<u8>> = server
            .handler
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Stream { payload } => Some(payload),
                _ => None,
            })
            .collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1024);
        assert_eq!(chunks[1].len(), 1024);
        assert_eq!(chunks[2].len(), 100);
        assert_eq!(chunks.concat(), payload);
    }

    #[tokio::test]
    async fn standalone_single_block_delivery() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        let payload: Vec<u8> = (0..577u32).map(|i| (i * 7) as u8).collect();
        let outgoing_id =
            client.session.send_standalone(bytes::Bytes::from(payload.clone())).await.unwrap();
        assert_ne!(outgoing_id, 0);

        shuttle(&mut client, &mut server).await;

        let standalone: Vec<Event> = server
            .handler
            .events()
            .into_iter()
            .filter(|event| matches!(event, Event::Standalone { .. }))
            .collect();
        assert_eq!(standalone, vec![Event::Standalone { outgoing_id, payload }]);
        assert!(client.protocol.reply().is_empty());
    }

    #[tokio::test]
    async fn standalone_multi_block_reassembly() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        let payload: Vec<u8> = (0..2313u32).map(|i| (i * 13) as u8).collect();
        let outgoing_id =
            client.session.send_standalone(bytes::Bytes::from(payload.clone())).await.unwrap();

        let crossed = shuttle(&mut client, &mut server).await;

        // exactly three parts with ascending ids and the announced total
        let parts = frames_of(&crossed, MessageType::MultiblockData, MultiblockSubtype::Static as u8);
        assert_eq!(parts.len(), 3);
        for (index, frame) in parts.iter().enumerate() {
            let part = MultiblockStatic::parse(frame).unwrap();
            assert_eq!(part.part_id(), index as u32);
            assert_eq!(part.total_part_number(), 3);
            assert_eq!(part.multiblock_id(), outgoing_id);
        }
        assert_eq!(
            frames_of(&crossed, MessageType::MultiblockData, MultiblockSubtype::Finish as u8).len(),
            1
        );

        let standalone: Vec<Event> = server
            .handler
            .events()
            .into_iter()
            .filter(|event| matches!(event, Event::Standalone { .. }))
            .collect();
        assert_eq!(standalone, vec![Event::Standalone { outgoing_id, payload }]);

        // transfer state is fully drained on both sides
        assert_eq!(client.session.multiblock().outgoing_len(), 0);
        assert_eq!(server.session.multiblock().incoming_len(), 0);
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        let request_session = client.session.clone();
        let request = tokio::spawn(async move {
            request_session
                .send_request(bytes::Bytes::from_static(b"question"), Duration::from_secs(10))
                .await
        });

        shuttle(&mut client, &mut server).await;

        let blocker_id = server
            .handler
            .events()
            .into_iter()
            .find_map(|event| match event {
                Event::Standalone { outgoing_id, payload } if payload == b"question" => {
                    Some(outgoing_id)
                }
                _ => None,
            })
            .unwrap();

        server
            .session
            .send_response(bytes::Bytes::from_static(b"answer"), blocker_id)
            .await
            .unwrap();
        shuttle(&mut client, &mut server).await;

        let response = tokio::time::timeout(Duration::from_secs(5), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.as_deref(), Some(&b"answer"[..]));
        assert!(client.protocol.blockers().is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_do_not_cross_talk() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        let session_a = client.session.clone();
        let first = tokio::spawn(async move {
            session_a
                .send_request(bytes::Bytes::from_static(b"alpha"), Duration::from_secs(10))
                .await
        });
        let session_b = client.session.clone();
        let second = tokio::spawn(async move {
            session_b
                .send_request(bytes::Bytes::from_static(b"beta"), Duration::from_secs(10))
                .await
        });

        shuttle(&mut client, &mut server).await;

        // answer both, in reverse arrival order, echoing the question
        let pending: Vec<(u64, Vec<u8>)> = server
            .handler
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Standalone { outgoing_id, payload } => Some((outgoing_id, payload)),
                _ => None,
            })
            .collect();
        assert_eq!(pending.len(), 2);

        for (blocker_id, question) in pending.into_iter().rev() {
            let mut answer = b"re: ".to_vec();
            answer.extend_from_slice(&question);
            server.session.send_response(answer.into(), blocker_id).await.unwrap();
        }
        shuttle(&mut client, &mut server).await;

        let first = tokio::time::timeout(Duration::from_secs(5), first).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), second).await.unwrap().unwrap();
        assert_eq!(first.unwrap().as_deref(), Some(&b"re: alpha"[..]));
        assert_eq!(second.unwrap().as_deref(), Some(&b"re: beta"[..]));
    }

    #[tokio::test]
    async fn multi_block_request_and_response() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        let question: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let expected = question.clone();

        let request_session = client.session.clone();
        let question_bytes = bytes::Bytes::from(question);
        let request = tokio::spawn(async move {
            request_session.send_request(question_bytes, Duration::from_secs(10)).await
        });

        shuttle(&mut client, &mut server).await;

        let (blocker_id, received) = server
            .handler
            .events()
            .into_iter()
            .find_map(|event| match event {
                Event::Standalone { outgoing_id, payload } => Some((outgoing_id, payload)),
                _ => None,
            })
            .unwrap();
        assert_eq!(received, expected);

        // answer with a payload that is itself multi-block
        let answer: Vec<u8> = (0..3000u32).map(|i| (i % 241) as u8).collect();
        server
            .session
            .send_response(bytes::Bytes::from(answer.clone()), blocker_id)
            .await
            .unwrap();
        shuttle(&mut client, &mut server).await;

        let response = tokio::time::timeout(Duration::from_secs(5), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.as_deref(), Some(&answer[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_reply_raises_one_timeout() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        client.session.send_stream(b"nobody answers", true).await.unwrap();
        assert_eq!(client.protocol.reply().len(), 1);

        // never shuttle; let the 2 s reply timeout expire
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let timeouts: Vec<Event> = client
            .handler
            .events()
            .into_iter()
            .filter(|event| {
                matches!(event, Event::Error { kind: ErrorKind::MessageTimeout, .. })
            })
            .collect();
        assert_eq!(timeouts.len(), 1);
        match &timeouts[0] {
            Event::Error { message, .. } => assert!(message.contains("timeout of message")),
            _ => {}
        }
        assert!(client.protocol.reply().is_empty());

        // no further callback for the same message
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            client
                .handler
                .count(|e| matches!(e, Event::Error { kind: ErrorKind::MessageTimeout, .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_empty_handed() {
        // reply timeout pushed out so only the blocker deadline fires
        let config = Config {
            reply_timeout: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(3600),
        };
        let mut client = endpoint(true, config.clone());
        let mut server = endpoint(false, config);
        connect(&mut client, &mut server, 1, 0).await;

        let request_session = client.session.clone();
        let request = tokio::spawn(async move {
            request_session
                .send_request(bytes::Bytes::from_static(b"anyone?"), Duration::from_secs(2))
                .await
        });

        // the request frame is never shuttled to the server
        let response = tokio::time::timeout(Duration::from_secs(10), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response, None);

        assert_eq!(
            client
                .handler
                .count(|e| matches!(e, Event::Error { kind: ErrorKind::MessageTimeout, .. })),
            1
        );
        assert!(client.protocol.blockers().is_empty());
    }

    #[tokio::test]
    async fn close_handshake_fires_one_closed_callback_per_side() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;
        let session_id = client.session.session_id();

        client.session.close(true).await.unwrap();
        shuttle(&mut client, &mut server).await;

        assert_eq!(client.handler.count(|e| matches!(e, Event::Closed { .. })), 1);
        assert_eq!(server.handler.count(|e| matches!(e, Event::Closed { .. })), 1);

        assert!(!client.protocol.has_session(session_id));
        assert!(!server.protocol.has_session(session_id));
        assert!(client.transport.was_closed());
        assert!(server.transport.was_closed());

        // closing again fails and never double-fires the callback
        assert!(client.session.close(true).await.is_err());
        assert_eq!(client.handler.count(|e| matches!(e, Event::Closed { .. })), 1);
    }

    #[tokio::test]
    async fn close_without_reply_tears_down_immediately() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        client.session.close(false).await.unwrap();
        assert!(client.transport.was_closed());
        assert_eq!(client.handler.count(|e| matches!(e, Event::Closed { .. })), 1);

        shuttle(&mut client, &mut server).await;
        assert_eq!(server.handler.count(|e| matches!(e, Event::Closed { .. })), 1);
        assert_eq!(server.protocol.session_count(), 0);
    }

    #[tokio::test]
    async fn data_frame_before_handshake_reports_unknown_session() {
        let mut server = endpoint(false, quiet_config());
        server.session.connect_session(0).unwrap();

        let message = StreamStatic::new(1, 0, b"too early", false).unwrap();
        server.buf.push(message.as_bytes());
        process_frames(&server.protocol, &server.session, &mut server.buf).await;

        // frame consumed, no stream callback, error frame emitted
        assert_eq!(server.buf.readable(), 0);
        assert_eq!(server.handler.count(|e| matches!(e, Event::Stream { .. })), 0);

        let sent = server.transport.take_sent();
        assert_eq!(sent.len(), 1);
        let header = FrameHeader::peek(&sent[0]).unwrap();
        assert_eq!(header.message_type(), Some(MessageType::Error));
        assert_eq!(header.sub_type(), ErrorSubtype::UnknownSession as u8);
    }

    #[tokio::test]
    async fn false_version_frame_is_answered_with_error() {
        let mut server = endpoint(false, quiet_config());
        server.session.connect_session(0).unwrap();

        let message = HeartbeatStart::new(1, 0);
        let mut frame = message.as_bytes().to_vec();
        frame[2] = 2; // version byte
        server.buf.push(&frame);
        process_frames(&server.protocol, &server.session, &mut server.buf).await;

        // the frame is not consumed, matching the engine's stall-on-garbage
        // behavior, but the peer is told about the version mismatch
        assert_eq!(server.buf.readable(), frame.len());
        let sent = server.transport.take_sent();
        assert_eq!(sent.len(), 1);
        let header = FrameHeader::peek(&sent[0]).unwrap();
        assert_eq!(header.sub_type(), ErrorSubtype::FalseVersion as u8);
    }

    #[tokio::test]
    async fn corrupted_sentinel_is_answered_with_error() {
        let mut server = endpoint(false, quiet_config());
        server.session.connect_session(0).unwrap();

        let message = HeartbeatStart::new(1, 0);
        let mut frame = message.as_bytes().to_vec();
        let last = frame.len() - 1;
        frame[last] = 0xFF;
        server.buf.push(&frame);
        process_frames(&server.protocol, &server.session, &mut server.buf).await;

        let sent = server.transport.take_sent();
        assert_eq!(sent.len(), 1);
        let header = FrameHeader::peek(&sent[0]).unwrap();
        assert_eq!(header.message_type(), Some(MessageType::Error));
        assert_eq!(header.sub_type(), ErrorSubtype::InvalidMessage as u8);
    }

    #[tokio::test]
    async fn partial_frame_waits_for_more_bytes() {
        let mut server = endpoint(false, quiet_config());
        server.session.connect_session(0).unwrap();

        let message = HeartbeatStart::new(1, 0);
        let frame = message.as_bytes();

        server.buf.push(&frame[..10]);
        process_frames(&server.protocol, &server.session, &mut server.buf).await;
        assert_eq!(server.buf.readable(), 10);

        server.buf.push(&frame[10..]);
        process_frames(&server.protocol, &server.session, &mut server.buf).await;
        assert_eq!(server.buf.readable(), 0);
    }

    #[tokio::test]
    async fn linked_session_forwards_without_callbacks() {
        let handler = RecordingHandler::new();
        let protocol = Protocol::new(quiet_config(), handler.clone());

        let transport_a = MockTransport::server();
        let session_a = protocol.create_session(transport_a.clone());
        let transport_b = MockTransport::server();
        let session_b = protocol.create_session(transport_b.clone());

        session_a.link_session(&session_b);

        let frame = HeartbeatStart::new(1, 42);
        let mut buf = RecvBuffer::new();
        buf.push(frame.as_bytes());
        process_frames(&protocol, &session_a, &mut buf).await;

        assert_eq!(buf.readable(), 0);
        let forwarded = transport_b.take_sent();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(&forwarded[0][..], frame.as_bytes());
        assert!(handler.events().is_empty());

        session_a.unlink_session();
        assert!(session_a.linked_session().is_none());
    }

    #[tokio::test]
    async fn abort_of_unknown_transfer_asks_the_peer() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        client.session.abort_messages(0xABCD).await.unwrap();
        let crossed = shuttle(&mut client, &mut server).await;

        assert_eq!(
            frames_of(&crossed, MessageType::MultiblockData, MultiblockSubtype::AbortInit as u8)
                .len(),
            1
        );
        assert_eq!(
            frames_of(&crossed, MessageType::MultiblockData, MultiblockSubtype::AbortReply as u8)
                .len(),
            1
        );
        assert!(client.protocol.reply().is_empty());
    }

    #[tokio::test]
    async fn per_session_handler_override_receives_callbacks() {
        let mut client = endpoint(true, quiet_config());
        let mut server = endpoint(false, quiet_config());
        connect(&mut client, &mut server, 1, 0).await;

        let override_handler = RecordingHandler::new();
        server.session.set_handler(override_handler.clone());

        client.session.send_stream(b"rerouted", false).await.unwrap();
        shuttle(&mut client, &mut server).await;

        assert_eq!(
            override_handler.events(),
            vec![Event::Stream { payload: b"rerouted".to_vec() }]
        );
        assert_eq!(server.handler.count(|e| matches!(e, Event::Stream { .. })), 0);
    }

    #[tokio::test]
    async fn send_operations_require_active_state() {
        let client = endpoint(true, quiet_config());

        assert!(client.session.send_stream(b"data", false).await.is_err());
        assert!(client.session.send_standalone(bytes::Bytes::from_static(b"data")).await.is_err());
        assert!(
            client
                .session
                .send_request(bytes::Bytes::from_static(b"data"), Duration::from_secs(1))
                .await
                .is_err()
        );
        assert!(
            client.session.send_response(bytes::Bytes::from_static(b"data"), 1).await.is_err()
        );
        assert!(client.session.close(false).await.is_err());
    }
}
