//! HTTP-over-tunnel: exit-side fetching and response fragmentation.
//!
//! A circuit initiator can ask its exit to perform one TCP HTTP
//! request on its behalf. The exit is deliberately not a general
//! proxy: unless the origin answers with a `307` redirect, the
//! response body must be bencoded, which restricts the feature to
//! tracker-compatible traffic.
//!
//! The community wires these pieces together; this module holds the
//! policy and the blocking-free fetch itself.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use tunnel_cell::msg::{self, HttpResponse};
use tunnel_cell::{CircId, PeerFlags};

use crate::cache::{HttpPending, Pending, RequestKind};
use crate::circuit::{Circuit, CircuitType};
use crate::community::{ReactorEvent, TunnelCommunity};
use crate::{Error, Result};

/// Largest fragment of a tunneled HTTP response.
pub(crate) const MAX_HTTP_PACKET_SIZE: usize = 1400;

/// Cap on the header section of a fetched response.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Cap on the body of a fetched response.
const MAX_BODY_SIZE: u64 = 1024 * 1024;

/// Return true if `x` parses as a bencoded value.
pub(crate) fn is_bencoded(x: &[u8]) -> bool {
    serde_bencode::from_bytes::<serde_bencode::value::Value>(x).is_ok()
}

/// Decide whether an exit may return this response to the initiator.
///
/// `307` responses pass through unmodified (trackers use them to
/// redirect); anything else must carry a bencoded body.
pub(crate) fn response_allowed(response: &[u8]) -> bool {
    if response.starts_with(b"HTTP/1.1 307") {
        return true;
    }
    let body = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| &response[i + 4..])
        .unwrap_or(b"");
    is_bencoded(body)
}

/// Split a response into sequenced fragments for transmission.
pub(crate) fn fragment_response(identifier: u32, response: &[u8]) -> Vec<HttpResponse> {
    let total = response.len().div_ceil(MAX_HTTP_PACKET_SIZE).max(1) as u16;
    response
        .chunks(MAX_HTTP_PACKET_SIZE)
        .enumerate()
        .map(|(i, chunk)| HttpResponse::new(identifier, i as u16, total, chunk.to_vec()))
        .collect()
}

/// Perform one HTTP request over TCP, under a deadline.
///
/// Reads the header section and up to 1 MiB of body; the origin
/// closing the connection ends the body.
pub(crate) async fn fetch(target: SocketAddr, request: &[u8], deadline: Duration) -> Result<Vec<u8>> {
    let fetched = tokio::time::timeout(deadline, async {
        let mut stream = TcpStream::connect(target).await?;
        stream.write_all(request).await?;

        let mut response = Vec::new();
        let mut buf = [0_u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                // Origin closed before the headers ended.
                return Ok::<_, std::io::Error>(response);
            }
            response.extend_from_slice(&buf[..n]);
            if response.windows(4).any(|w| w == b"\r\n\r\n") || response.len() > MAX_HEADER_SIZE {
                break;
            }
        }
        let mut limited = stream.take(MAX_BODY_SIZE);
        limited.read_to_end(&mut response).await?;
        Ok(response)
    })
    .await;
    match fetched {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::Timeout(deadline)),
    }
}

impl TunnelCommunity {
    /// Find a ready circuit with HTTP exit capability, or start
    /// building one. Returns the circuit and a readiness receiver
    /// (already resolved for a circuit that exists).
    pub(crate) fn get_or_create_http_circuit(
        &mut self,
        hops: u8,
        now: Instant,
    ) -> Result<(CircId, oneshot::Receiver<bool>)> {
        let existing = self
            .registry
            .find_ready(None, Some(PeerFlags::EXIT_HTTP), None)
            .first()
            .map(|c| c.circuit_id());
        let circuit_id = match existing {
            Some(circuit_id) => circuit_id,
            None => self.create_circuit(
                hops,
                CircuitType::Data,
                PeerFlags::EXIT_HTTP,
                None,
                0,
                now,
            )?,
        };
        let ready = self
            .registry
            .circuit_mut(circuit_id)
            .map(Circuit::wait_ready)
            .ok_or(Error::NoCircuit)?;
        Ok((circuit_id, ready))
    }

    /// Send an HTTP request down a circuit and register the response
    /// assembler. Returns the receiver the response resolves on.
    pub(crate) fn send_http_request(
        &mut self,
        circuit_id: CircId,
        target: std::net::SocketAddr,
        request: Vec<u8>,
        now: Instant,
    ) -> Result<oneshot::Receiver<Result<Vec<u8>>>> {
        if self
            .registry
            .circuit(circuit_id)
            .map_or(true, |c| c.state() != crate::circuit::CircuitState::Ready)
        {
            return Err(Error::NoCircuit);
        }
        let (reply, rx) = oneshot::channel();
        let identifier = self.cache.add(
            Pending::Http(HttpPending::new(circuit_id, reply)),
            self.settings.request_timeout,
            now,
        );
        self.send_on_circuit(
            circuit_id,
            msg::HttpRequest::new(identifier, target.into(), request).into(),
        );
        Ok(rx)
    }

    /// Exit side: an initiator asks us to perform an HTTP request.
    ///
    /// The fetch runs in a spawned task under its own deadline; the
    /// reactor picks the outcome back up as an internal event. At
    /// most five fetches run per circuit.
    pub(crate) fn on_http_request(&mut self, circuit_id: CircId, request: &msg::HttpRequest) {
        if !self.settings.advertised_flags().contains(PeerFlags::EXIT_HTTP) {
            warn!("dropping http-request on {}: we are not an HTTP exit", circuit_id);
            return;
        }
        let Some(exit) = self.registry.exit_mut(circuit_id) else {
            warn!("received unexpected http-request");
            return;
        };
        if exit.http_inflight >= self.settings.max_http_requests_per_circuit {
            warn!("too many HTTP requests coming from circuit {}", circuit_id);
            return;
        }
        exit.http_inflight += 1;
        debug!("got http-request on circuit {}", circuit_id);

        let target: std::net::SocketAddr = request.target().into();
        let body = request.request().to_vec();
        let identifier = request.identifier();
        let deadline = self.settings.http_fetch_timeout;
        let events = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = fetch(target, &body, deadline).await;
            let _ = events.unbounded_send(ReactorEvent::HttpFetchDone {
                circuit_id,
                identifier,
                result,
            });
        });
    }

    /// Exit side: a fetch finished; enforce the response policy and
    /// send the fragments back down the circuit.
    pub(crate) fn on_http_fetch_done(
        &mut self,
        circuit_id: CircId,
        identifier: u32,
        result: Result<Vec<u8>>,
    ) {
        if let Some(exit) = self.registry.exit_mut(circuit_id) {
            exit.http_inflight = exit.http_inflight.saturating_sub(1);
        } else {
            // The circuit died while we were fetching.
            return;
        }
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!("tunnel HTTP request failed: {}", e);
                return;
            }
        };
        if !response_allowed(&response) {
            warn!("tunnel HTTP request not allowed");
            return;
        }
        for fragment in fragment_response(identifier, &response) {
            self.send_from_exit(circuit_id, fragment.into());
        }
    }

    /// Initiator side: one response fragment arrived.
    pub(crate) fn on_http_response(&mut self, circuit_id: CircId, response: msg::HttpResponse) {
        let identifier = response.identifier();
        if !self.cache.has(RequestKind::HttpRequest, identifier) {
            warn!("received unexpected http-response");
            return;
        }
        let complete = match self.cache.get_mut(RequestKind::HttpRequest, identifier) {
            Some(Pending::Http(pending)) => {
                if pending.circuit_id != circuit_id {
                    warn!(
                        "received http-response from wrong circuit {} != {}",
                        pending.circuit_id, circuit_id
                    );
                    return;
                }
                pending.add_response(response.part(), response.total(), response.into_response())
            }
            _ => return,
        };
        if let Some(full) = complete {
            if let Some(Pending::Http(mut pending)) =
                self.cache.pop(RequestKind::HttpRequest, identifier)
            {
                if let Some(reply) = pending.reply.take() {
                    let _ = reply.send(Ok(full));
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::cache::HttpPending;
    use tokio::net::TcpListener;
    use tunnel_cell::CircId;

    #[test]
    fn fragmentation_counts() {
        let response = vec![0x61; 3000];
        let fragments = fragment_response(7, &response);
        assert_eq!(fragments.len(), 3);
        assert_eq!(
            fragments
                .iter()
                .map(|f| (f.part(), f.total(), f.response().len()))
                .collect::<Vec<_>>(),
            vec![(0, 3, 1400), (1, 3, 1400), (2, 3, 200)]
        );
        // An empty response still produces one (empty) fragment.
        assert_eq!(fragment_response(7, b"").len(), 1);
    }

    #[test]
    fn fragments_reassemble() {
        let response: Vec<u8> = (0..3000_u32).map(|i| i as u8).collect();
        let (tx, _rx) = oneshot::channel();
        let mut pending = HttpPending::new(CircId::new(1).unwrap(), tx);

        let mut out = None;
        for f in fragment_response(7, &response) {
            out = pending.add_response(f.part(), f.total(), f.into_response());
        }
        assert_eq!(out.unwrap(), response);
    }

    #[test]
    fn policy_accepts_bencode_and_307() {
        let tracker = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nd8:intervali1800e5:peers0:e";
        assert!(response_allowed(tracker));

        let redirect = b"HTTP/1.1 307 Temporary Redirect\r\nLocation: http://x/\r\n\r\nwhatever";
        assert!(response_allowed(&redirect[..]));

        let html = b"HTTP/1.1 200 OK\r\n\r\n<html>nope</html>";
        assert!(!response_allowed(&html[..]));

        let headerless = b"complete nonsense";
        assert!(!response_allowed(&headerless[..]));
    }

    #[tokio::test]
    async fn fetch_reads_header_and_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0_u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\n\r\nd2:hi5:worlde")
                .await
                .unwrap();
            // Closing the stream ends the body.
        });

        let response = fetch(addr, b"GET /announce HTTP/1.1\r\n\r\n", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200 OK"));
        assert!(response_allowed(&response));
    }

    #[tokio::test]
    async fn fetch_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and stall.
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let result = fetch(addr, b"GET / HTTP/1.1\r\n\r\n", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
