//! Session driver: moves PDUs between a byte stream and the session's
//! outbound queue.
//!
//! Frames are length-delimited; each frame body is one `MsgPack`-encoded
//! [`Pdu`]. A frame that does not decode is answered with a general reject
//! and the session carries on. Well-formed PDUs are handed to a
//! [`PduSink`], which is where performer and invoker behaviour differ.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use remop_core::{GeneralProblem, Pdu, RejectProblem};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::config::SessionConfig;
use super::handle::{Outbound, SessionHandle};

/// Receives PDUs read from a session.
pub trait PduSink: Send + Sync + 'static {
    /// Called for each decoded PDU, in arrival order. Must not block.
    fn deliver(&self, session: &Arc<SessionHandle>, pdu: Pdu);

    /// Called once after the driver stops reading.
    fn closed(&self, session: &Arc<SessionHandle>, end: &SessionEnd);
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed its side of the stream.
    PeerClosed,
    /// A local `Outbound::Close` was processed, or every handle was dropped.
    Closed(Option<String>),
    /// Reading or writing the stream failed.
    Transport(String),
    /// [`SessionHandle::abort`] ended the session; queued PDUs were dropped.
    Aborted,
}

/// Wraps a byte stream in the session's frame codec.
pub fn framed<T>(io: T, config: &SessionConfig) -> Framed<T, LengthDelimitedCodec>
where
    T: AsyncRead + AsyncWrite,
{
    LengthDelimitedCodec::builder()
        .max_frame_length(config.max_frame_length)
        .new_framed(io)
}

/// Runs a session until the peer disconnects, the stream fails, a close is
/// queued, or the session is aborted. Returns how it ended after notifying
/// `sink`.
pub async fn run_session<T>(
    io: T,
    session: Arc<SessionHandle>,
    mut outbound: mpsc::Receiver<Outbound>,
    sink: Arc<dyn PduSink>,
    config: SessionConfig,
) -> SessionEnd
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut frames = framed(io, &config);
    tracing::debug!(session = %session.id, role = ?session.role, "session started");

    // An abort also interrupts a write stuck on a peer that stopped reading.
    let end = tokio::select! {
        end = pump(&mut frames, &mut outbound, &session, sink.as_ref()) => end,
        () = session.aborted() => SessionEnd::Aborted,
    };

    // Stop accepting further outbound items before telling the sink, so
    // anything it fails is not racing new sends.
    outbound.close();
    if matches!(end, SessionEnd::PeerClosed | SessionEnd::Closed(_)) {
        // Best effort: the peer may already be gone.
        let _ = SinkExt::<Bytes>::close(&mut frames).await;
    }

    let lifetime = session.connected_at.elapsed();
    match &end {
        SessionEnd::Transport(reason) => {
            tracing::warn!(session = %session.id, reason = %reason, ?lifetime, "session failed");
        }
        other => tracing::debug!(session = %session.id, end = ?other, ?lifetime, "session ended"),
    }
    sink.closed(&session, &end);
    end
}

async fn pump<T>(
    frames: &mut Framed<T, LengthDelimitedCodec>,
    outbound: &mut mpsc::Receiver<Outbound>,
    session: &Arc<SessionHandle>,
    sink: &dyn PduSink,
) -> SessionEnd
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(bytes)) => match Pdu::from_bytes(&bytes) {
                    Ok(pdu) => {
                        tracing::trace!(session = %session.id, kind = pdu.kind(), invoke_id = ?pdu.invoke_id(), "pdu received");
                        sink.deliver(session, pdu);
                    }
                    Err(e) => {
                        tracing::warn!(session = %session.id, error = %e, len = bytes.len(), "undecodable frame");
                        metrics::counter!("remop_malformed_frames_total").increment(1);
                        let reject = Pdu::reject(None, RejectProblem::General(GeneralProblem::MistypedPdu));
                        if let Err(e) = write_pdu(frames, &reject).await {
                            break SessionEnd::Transport(e.to_string());
                        }
                    }
                },
                Some(Err(e)) => break SessionEnd::Transport(e.to_string()),
                None => break SessionEnd::PeerClosed,
            },
            msg = outbound.recv() => match msg {
                Some(Outbound::Pdu(pdu)) => {
                    if let Err(e) = write_pdu(frames, &pdu).await {
                        break SessionEnd::Transport(e.to_string());
                    }
                }
                Some(Outbound::Close(reason)) => break SessionEnd::Closed(reason),
                None => break SessionEnd::Closed(None),
            },
        }
    }
}

async fn write_pdu<T>(frames: &mut Framed<T, LengthDelimitedCodec>, pdu: &Pdu) -> std::io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let body = match pdu.to_bytes() {
        Ok(body) => body,
        Err(e) => {
            // Nothing the peer can do about a local encoding failure; drop it.
            tracing::error!(kind = pdu.kind(), invoke_id = ?pdu.invoke_id(), error = %e, "failed to encode pdu");
            return Ok(());
        }
    };
    frames.send(Bytes::from(body)).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use remop_core::{InvokeId, InvokePdu, OperationCode, Priority};

    use super::*;
    use crate::session::handle::{SessionId, SessionRole};

    #[derive(Default)]
    struct Recording {
        pdus: Mutex<Vec<Pdu>>,
        ends: Mutex<Vec<SessionEnd>>,
    }

    impl PduSink for Recording {
        fn deliver(&self, _session: &Arc<SessionHandle>, pdu: Pdu) {
            self.pdus.lock().push(pdu);
        }

        fn closed(&self, _session: &Arc<SessionHandle>, end: &SessionEnd) {
            self.ends.lock().push(end.clone());
        }
    }

    fn ping(id: u32) -> Pdu {
        Pdu::Invoke(InvokePdu {
            invoke_id: InvokeId(id),
            linked_id: None,
            operation: OperationCode(9),
            priority: Priority::NORMAL,
            argument: vec![0xC0],
        })
    }

    fn start(
        io: tokio::io::DuplexStream,
    ) -> (Arc<SessionHandle>, Arc<Recording>, tokio::task::JoinHandle<SessionEnd>) {
        let config = SessionConfig::default();
        let (handle, rx) = SessionHandle::new(SessionId(1), SessionRole::Performer, None, &config);
        let sink = Arc::new(Recording::default());
        let task = tokio::spawn(run_session(
            io,
            Arc::clone(&handle),
            rx,
            sink.clone() as Arc<dyn PduSink>,
            config,
        ));
        (handle, sink, task)
    }

    #[tokio::test]
    async fn delivers_decoded_pdus_in_order() {
        let (local, remote) = tokio::io::duplex(4096);
        let (_handle, sink, task) = start(local);

        let mut peer = framed(remote, &SessionConfig::default());
        for id in 1..=3 {
            peer.send(Bytes::from(ping(id).to_bytes().unwrap())).await.unwrap();
        }
        drop(peer);

        assert_eq!(task.await.unwrap(), SessionEnd::PeerClosed);
        let ids: Vec<_> = sink.pdus.lock().iter().filter_map(Pdu::invoke_id).collect();
        assert_eq!(ids, vec![InvokeId(1), InvokeId(2), InvokeId(3)]);
        assert_eq!(sink.ends.lock().clone(), vec![SessionEnd::PeerClosed]);
    }

    #[tokio::test]
    async fn undecodable_frame_is_rejected_and_session_continues() {
        let (local, remote) = tokio::io::duplex(4096);
        let (_handle, sink, task) = start(local);

        let mut peer = framed(remote, &SessionConfig::default());
        peer.send(Bytes::from_static(b"\xC1 not msgpack")).await.unwrap();

        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(
            Pdu::from_bytes(&reply).unwrap(),
            Pdu::reject(None, RejectProblem::General(GeneralProblem::MistypedPdu))
        );

        peer.send(Bytes::from(ping(7).to_bytes().unwrap())).await.unwrap();
        drop(peer);
        task.await.unwrap();
        assert_eq!(sink.pdus.lock().clone(), vec![ping(7)]);
    }

    #[tokio::test]
    async fn queued_pdus_are_written_then_close_ends_session() {
        let (local, remote) = tokio::io::duplex(4096);
        let (handle, _sink, task) = start(local);

        handle.try_send(Outbound::Pdu(ping(5))).unwrap();
        handle.try_send(Outbound::Close(Some("bye".into()))).unwrap();

        let mut peer = framed(remote, &SessionConfig::default());
        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(Pdu::from_bytes(&frame).unwrap(), ping(5));

        assert_eq!(task.await.unwrap(), SessionEnd::Closed(Some("bye".into())));
        assert!(!handle.is_connected());
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn abort_ends_a_session_stuck_writing() {
        // Room for barely one frame; the peer never reads.
        let (local, remote) = tokio::io::duplex(64);
        let (handle, sink, task) = start(local);
        for id in 1..=8 {
            let _ = handle.try_send(Outbound::Pdu(ping(id)));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        handle.abort();
        let end = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Aborted);
        assert_eq!(sink.ends.lock().clone(), vec![SessionEnd::Aborted]);
        assert!(!handle.is_connected());
        drop(remote);
    }
}
