//! # Probe Server
//!
//! Answers every probe request with an echo of the size the request asks for: the
//! request bytes (its 2-byte size header included) repeated cyclically up to that size.
//! ICMP messages reaching the server are logged. The server never stops on its own.

use std::time::Duration;

use crate::demux::{Event, UdpEvent};
use crate::icmp::log_icmp_message;
use crate::session::{RecvError, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// How long one `receive` call waits before polling again.
    pub recv_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(60),
        }
    }
}

/// The echo for `request`, or `None` if it is too short to carry a size.
pub fn echo_response(request: &[u8]) -> Option<Vec<u8>> {
    let size_header: [u8; 2] = request.get(..2)?.try_into().ok()?;
    let size = usize::from(u16::from_be_bytes(size_header));
    Some(request.iter().copied().cycle().take(size).collect())
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Serves requests until the transport is closed.
    pub async fn run<T: Transport>(&self, transport: &mut T) -> Result<(), RecvError> {
        loop {
            match transport.receive(self.config.recv_timeout).await {
                Ok(event) => self.handle_event(transport, event).await,
                Err(RecvError::Timeout) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn handle_event<T: Transport>(&self, transport: &mut T, event: Event) {
        match event {
            Event::Udp(udp) => self.respond(transport, udp).await,
            Event::Icmp(icmp) => {
                log_icmp_message(icmp.source, &icmp.payload);
            }
        }
    }

    async fn respond<T: Transport>(&self, transport: &mut T, request: UdpEvent) {
        let Some(response) = echo_response(&request.payload) else {
            log::warn!(
                "{}: received {} bytes, expected at least 2",
                request.source,
                request.payload.len()
            );
            return;
        };
        log::info!(
            "{}: responding to {} bytes with {} bytes",
            request.source,
            request.payload.len(),
            response.len()
        );
        if let Err(e) = transport.send(&response, Some(request.source)).await {
            log::warn!("{}: failed to send data: {e}", request.source);
        }
    }
}
